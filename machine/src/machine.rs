//! Session lifecycle controller.
//!
//! A [`Machine`] owns one emulation session: the component tree, the
//! scheduler, persistence, notifiers and the watchdog. It starts everything
//! in a fixed order, runs the execution loop and tears the session down
//! again.
//!
//! ```text
//! new()        Preinit  platform builds the component tree
//! start()      Init     subsystems, activation, registrations
//! boot()       Reset    config/NVRAM, initial soft reset
//!              Running  timeslice / session events / save-load
//! finish()     Exit     NVRAM/config, exit notifiers, platform shutdown
//! ```

use crate::activation::{self, ActivationReport};
use crate::component::{ComponentTree, DeviceContext};
use crate::error::{EXIT_SUCCESS, MachineError, Result};
use crate::logsink::{LogSink, file_sink};
use crate::notify::{NotifierBus, NotifyCallback, NotifyKind};
use crate::options::MachineOptions;
use crate::phase::MachinePhase;
use crate::platform::{InitContext, Platform};
use crate::saveload::{SaveLoadKind, SaveLoadOutcome, SaveLoadScheduler};
use crate::scheduler::{Scheduler, TimerTarget};
use crate::session::{SessionHandle, SessionRequest};
use crate::settings;
use crate::state::StateManager;
use crate::time::VirtualTime;
use crate::watchdog::{Watchdog, WatchdogMode};

/// Name of the state slot used by autosave.
pub const AUTOSAVE_SLOT: &str = "auto";

pub struct Machine {
    options: MachineOptions,
    platform: Box<dyn Platform>,
    scheduler: Box<dyn Scheduler>,
    tree: ComponentTree,
    state: StateManager,
    notifiers: NotifierBus,
    saveload: SaveLoadScheduler,
    watchdog: Watchdog,
    session: SessionHandle,
    system: String,
    paused: bool,
    autosave_issued: bool,
    queued_sinks: Vec<LogSink>,
    queued_notifiers: Vec<(NotifyKind, NotifyCallback)>,
    activation: Option<ActivationReport>,
}

impl Machine {
    /// Create a session in the preinit phase and let `platform` build its
    /// component tree.
    pub fn new(
        mut platform: Box<dyn Platform>,
        scheduler: Box<dyn Scheduler>,
        options: MachineOptions,
    ) -> Result<Self> {
        let system = platform.name().to_string();
        let mut tree = ComponentTree::new();
        platform.configure(&mut tree)?;
        log::info!(
            "[Machine] Configured `{}` with {} component(s)",
            system,
            tree.len()
        );

        let mode = WatchdogMode::from_config(platform.watchdog(), options.watchdog);
        // Opened when the session enters Init.
        let mut state = StateManager::new(system.clone());
        state.allow_registration(false);
        Ok(Self {
            saveload: SaveLoadScheduler::new(&options, &system, platform.supports_save()),
            watchdog: Watchdog::new(mode, options.verbose),
            state,
            notifiers: NotifierBus::new(),
            session: SessionHandle::new(),
            paused: false,
            autosave_issued: false,
            queued_sinks: Vec::new(),
            queued_notifiers: Vec::new(),
            activation: None,
            options,
            platform,
            scheduler,
            tree,
            system,
        })
    }

    /// Queue a diagnostic sink to be registered when the session initializes.
    pub fn with_log_sink(mut self, sink: LogSink) -> Self {
        self.queued_sinks.push(sink);
        self
    }

    // ------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------

    pub fn phase(&self) -> MachinePhase {
        self.session.phase()
    }

    pub fn session(&self) -> &SessionHandle {
        &self.session
    }

    pub fn system(&self) -> &str {
        &self.system
    }

    pub fn options(&self) -> &MachineOptions {
        &self.options
    }

    pub fn tree(&self) -> &ComponentTree {
        &self.tree
    }

    pub fn scheduler(&self) -> &dyn Scheduler {
        self.scheduler.as_ref()
    }

    pub fn state(&self) -> &StateManager {
        &self.state
    }

    pub fn watchdog(&self) -> &Watchdog {
        &self.watchdog
    }

    pub fn activation_report(&self) -> Option<&ActivationReport> {
        self.activation.as_ref()
    }

    pub fn now(&self) -> VirtualTime {
        self.scheduler.now()
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    pub fn save_load_pending(&self) -> bool {
        self.saveload.is_pending()
    }

    pub fn hard_reset_pending(&self) -> bool {
        self.session.hard_reset_pending()
    }

    pub fn exit_pending(&self) -> bool {
        self.session.exit_pending()
    }

    pub fn take_messages(&self) -> Vec<String> {
        self.session.take_messages()
    }

    // ------------------------------------------------------------------
    // Registration
    // ------------------------------------------------------------------

    /// Hook a lifecycle transition. Before [`Machine::start`] the callback is
    /// queued and registered on entering Init; after Init it is rejected.
    pub fn add_notifier(&mut self, kind: NotifyKind, callback: NotifyCallback) -> Result<()> {
        if self.session.phase() == MachinePhase::Preinit {
            self.queued_notifiers.push((kind, callback));
            return Ok(());
        }
        self.notifiers.register(self.session.phase(), kind, callback)
    }

    /// Same queueing rules as [`Machine::add_notifier`].
    pub fn add_log_sink(&mut self, sink: LogSink) -> Result<()> {
        if self.session.phase() == MachinePhase::Preinit {
            self.queued_sinks.push(sink);
            return Ok(());
        }
        self.session.add_log_sink(sink)
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Move to `next`. Illegal transitions are refused and leave the phase
    /// unchanged.
    fn enter(&self, next: MachinePhase) -> bool {
        let current = self.session.phase();
        if current == next {
            return true;
        }
        if !current.can_transition_to(next) {
            log::error!("[Machine] Refusing phase change {} -> {}", current, next);
            return false;
        }
        log::debug!("[Machine] {} -> {}", current, next);
        self.session.set_phase(next);
        true
    }

    fn notify(&mut self, kind: NotifyKind) {
        let mut ctx = DeviceContext::new(self.scheduler.as_mut(), &self.session);
        self.notifiers.fire(kind, &mut self.tree, &mut ctx);
    }

    /// Initialize every subsystem and start all components.
    pub fn start(&mut self) -> Result<()> {
        let phase = self.session.phase();
        if phase != MachinePhase::Preinit {
            return Err(MachineError::WrongPhase {
                operation: "start",
                phase,
            });
        }
        self.enter(MachinePhase::Init);
        self.state.allow_registration(true);

        for sink in std::mem::take(&mut self.queued_sinks) {
            self.session.add_log_sink(sink)?;
        }
        for (kind, callback) in std::mem::take(&mut self.queued_notifiers) {
            self.notifiers.register(MachinePhase::Init, kind, callback)?;
        }
        if let Some(path) = &self.options.log_file {
            self.session.add_log_sink(file_sink(path)?)?;
        }

        let watchdog_timer = self.scheduler.timer_alloc(
            TimerTarget::Callback(Box::new(|ctx| ctx.session.flag_watchdog_expired())),
            Some("watchdog"),
        );
        self.watchdog.attach_timer(watchdog_timer);

        self.platform.init_platform(&self.session)?;
        self.platform.init_video(&self.session)?;
        self.platform.init_sound(&self.session)?;
        self.platform.init_inputs(&self.tree, &self.session)?;
        self.platform.load_images(&self.session)?;
        {
            let mut ctx = InitContext::new(
                &mut self.tree,
                self.scheduler.as_mut(),
                &mut self.state,
                &mut self.notifiers,
                &self.session,
            );
            self.platform.init_memory(&mut ctx)?;
            self.platform.driver_init(&mut ctx)?;
        }

        let report = activation::start_all(
            &mut self.tree,
            self.scheduler.as_mut(),
            &mut self.state,
            &mut self.notifiers,
            &self.session,
        )?;
        self.activation = Some(report);

        self.notifiers.register(
            MachinePhase::Init,
            NotifyKind::Reset,
            Box::new(|tree, ctx| tree.reset_all(ctx)),
        )?;
        self.notifiers.register(
            MachinePhase::Init,
            NotifyKind::Exit,
            Box::new(|tree, ctx| tree.stop_all(ctx)),
        )?;
        self.state
            .register_presave(Box::new(|tree| tree.pre_save_all()))?;
        self.state
            .register_postload(Box::new(|tree| tree.post_load_all()))?;

        self.scheduler.register_state(&mut self.state)?;
        self.state.allow_registration(false);
        log::info!(
            "[Machine] `{}` started, {} state item(s) registered",
            self.system,
            self.state.item_count()
        );
        Ok(())
    }

    /// Start the session and bring it to the running phase.
    pub fn boot(&mut self, first_run: bool) -> Result<()> {
        self.start()?;

        settings::load_config(&mut self.tree, &self.options.cfg_directory, &self.system);
        settings::load_nvram(&mut self.tree, &self.options.nvram_directory, &self.system);

        if !self.options.skip_startup_screens {
            self.platform.show_startup_screens(&self.session, first_run)?;
        }

        if let Some(state) = self.options.state.clone() {
            self.schedule_load(&state);
        } else if self.options.autosave && self.platform.supports_save() {
            self.schedule_load(AUTOSAVE_SLOT);
        }

        self.soft_reset();
        // The initial state is in place before the first timeslice.
        if self.saveload.is_pending() {
            self.handle_save_load();
        }
        self.notify(NotifyKind::Start);
        Ok(())
    }

    /// Whether the loop should run another iteration.
    pub fn should_continue(&self) -> bool {
        let stopping = self.session.hard_reset_pending() || self.session.exit_pending();
        !stopping || self.saveload.is_pending()
    }

    /// One pass of the execution loop.
    pub fn run_iteration(&mut self) -> Result<()> {
        if !self.paused {
            self.scheduler.timeslice(&mut self.tree, &self.session)?;
        } else {
            self.platform.frame_update(&self.session);
        }
        self.process_session_events();
        if self.saveload.is_pending() {
            self.handle_save_load();
        }
        Ok(())
    }

    /// Run the session to completion and return its exit status.
    pub fn run(&mut self, first_run: bool) -> i32 {
        let result = self.boot(first_run).and_then(|()| {
            while self.should_continue() {
                self.run_iteration()?;
            }
            Ok(())
        });
        self.finish(result)
    }

    /// Wind the session down after `result` ended the loop.
    pub fn finish(&mut self, result: Result<()>) -> i32 {
        let code = match &result {
            Ok(()) => {
                self.enter(MachinePhase::Exit);
                settings::save_nvram(&self.tree, &self.options.nvram_directory, &self.system);
                settings::save_config(&self.tree, &self.options.cfg_directory, &self.system);
                EXIT_SUCCESS
            }
            Err(err) => {
                self.enter(MachinePhase::Exit);
                let kind = if err.is_fatal() { "Fatal error" } else { "Runtime error" };
                crate::logerror!(self.session, "{}: {}\n", kind, err);
                log::error!("[Machine] {}: {}", kind, err);
                err.exit_code()
            }
        };

        self.notify(NotifyKind::Exit);
        self.platform.shutdown(&self.session);
        log::info!("[Machine] `{}` exited with status {}", self.system, code);
        code
    }

    fn soft_reset(&mut self) {
        self.enter(MachinePhase::Reset);
        self.watchdog.machine_reset(self.scheduler.as_mut());
        self.notify(NotifyKind::Reset);
        self.enter(MachinePhase::Running);
    }

    // ------------------------------------------------------------------
    // Requests
    // ------------------------------------------------------------------

    pub fn schedule_exit(&mut self) {
        self.session.schedule_exit();
        self.arm_autosave();
        self.scheduler.eat_all_cycles();
    }

    /// Queue the exit autosave, once per session.
    fn arm_autosave(&mut self) {
        if self.autosave_issued
            || !self.options.autosave
            || !self.platform.supports_save()
            || self.scheduler.now() == VirtualTime::ZERO
        {
            return;
        }
        self.autosave_issued = true;
        self.schedule_save(AUTOSAVE_SLOT);
    }

    pub fn schedule_hard_reset(&mut self) {
        self.session.schedule_hard_reset();
        self.scheduler.eat_all_cycles();
    }

    pub fn schedule_soft_reset(&mut self) {
        self.session.schedule_soft_reset();
        self.resume();
        self.scheduler.eat_all_cycles();
    }

    pub fn pause(&mut self) {
        if self.paused {
            return;
        }
        self.paused = true;
        self.notify(NotifyKind::Pause);
    }

    pub fn resume(&mut self) {
        if !self.paused {
            return;
        }
        self.paused = false;
        self.notify(NotifyKind::Resume);
    }

    pub fn schedule_save(&mut self, name: &str) {
        let now = self.scheduler.now();
        self.saveload.schedule(SaveLoadKind::Save, name, now);
        self.resume();
    }

    pub fn schedule_load(&mut self, name: &str) {
        let now = self.scheduler.now();
        self.saveload.schedule(SaveLoadKind::Load, name, now);
        self.resume();
    }

    /// Carry out a pending save or load if the scheduler allows it.
    pub fn handle_save_load(&mut self) -> SaveLoadOutcome {
        let outcome = self.saveload.handle(
            self.scheduler.as_ref(),
            &mut self.state,
            &mut self.tree,
            &self.session,
        );
        if outcome == SaveLoadOutcome::Completed(SaveLoadKind::Load) {
            self.session.set_time(self.scheduler.now());
        }
        outcome
    }

    /// Apply everything raised through the session handle since the last
    /// iteration.
    fn process_session_events(&mut self) {
        let watchdog_expired = self.session.take_watchdog_expired();
        let mut kicked = false;

        for request in self.session.drain_requests() {
            match request {
                SessionRequest::Save(name) => self.schedule_save(&name),
                SessionRequest::Load(name) => self.schedule_load(&name),
                SessionRequest::Pause => self.pause(),
                SessionRequest::Resume => self.resume(),
                SessionRequest::WatchdogReset => {
                    self.watchdog.reset(self.scheduler.as_mut());
                    kicked = true;
                }
                SessionRequest::WatchdogEnable(enable) => {
                    self.watchdog.enable(enable, self.scheduler.as_mut())
                }
            }
        }

        for _ in 0..self.session.take_vblank_edges() {
            self.watchdog.vblank(&self.session);
        }
        // A kick in the same slice means the software was still alive.
        if watchdog_expired && !kicked {
            self.watchdog.timer_expired(&self.session);
        }

        if self.options.seconds_to_run != 0
            && !self.session.exit_pending()
            && self.scheduler.now() >= VirtualTime::from_secs(self.options.seconds_to_run)
        {
            log::info!(
                "[Machine] Stopping after {} second(s) of emulated time",
                self.options.seconds_to_run
            );
            self.schedule_exit();
        }
        // Exits raised through the session handle.
        if self.session.exit_pending() {
            self.arm_autosave();
        }

        if self.session.take_soft_reset() {
            log::info!("[Machine] Soft reset at {}", self.scheduler.now());
            self.soft_reset();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component::{Component, StartContext};
    use crate::error::{EXIT_FATAL_ERROR, StartResult};
    use crate::platform::WatchdogConfig;
    use crate::scheduler::QuantumScheduler;
    use crate::state::StateItem;
    use std::cell::RefCell;
    use std::rc::Rc;
    use std::sync::{Arc, Mutex};

    type Trace = Rc<RefCell<Vec<String>>>;

    #[derive(Clone, Copy, Default)]
    struct Behaviour {
        fail_at: Option<VirtualTime>,
        kick_until: Option<VirtualTime>,
        /// Raise one vblank edge per timeslice.
        vblank: bool,
    }

    struct Widget {
        trace: Trace,
        behaviour: Behaviour,
    }

    impl Component for Widget {
        fn start(&mut self, ctx: &mut StartContext<'_>) -> StartResult {
            let phase = ctx.session.phase();
            self.trace.borrow_mut().push(format!("start:{}", phase));
            let trace = Rc::clone(&self.trace);
            ctx.add_notifier(
                NotifyKind::Exit,
                Box::new(move |_, _| trace.borrow_mut().push("exit".into())),
            )?;
            Ok(())
        }

        fn reset(&mut self, _ctx: &mut DeviceContext<'_>) {
            self.trace.borrow_mut().push("reset".into());
        }

        fn stop(&mut self, _ctx: &mut DeviceContext<'_>) {
            self.trace.borrow_mut().push("stop".into());
        }

        fn is_executing(&self) -> bool {
            true
        }

        fn execute(&mut self, _budget: VirtualTime, ctx: &mut DeviceContext<'_>) -> Result<()> {
            let now = ctx.now();
            if self.behaviour.kick_until.is_some_and(|until| now < until) {
                ctx.session.kick_watchdog();
            }
            if self.behaviour.vblank {
                ctx.session.signal_vblank();
            }
            match self.behaviour.fail_at {
                Some(at) if now >= at => Err(MachineError::fatal_with_code("widget fault", 7)),
                _ => Ok(()),
            }
        }
    }

    struct Board {
        trace: Trace,
        behaviour: Behaviour,
        watchdog: WatchdogConfig,
        resets: StateItem<u32>,
    }

    impl Platform for Board {
        fn name(&self) -> &str {
            "board"
        }

        fn watchdog(&self) -> WatchdogConfig {
            self.watchdog
        }

        fn configure(&mut self, tree: &mut ComponentTree) -> Result<()> {
            tree.add(
                None,
                "widget",
                Box::new(Widget {
                    trace: Rc::clone(&self.trace),
                    behaviour: self.behaviour,
                }),
            )?;
            Ok(())
        }

        fn init_platform(&mut self, _session: &SessionHandle) -> Result<()> {
            self.trace.borrow_mut().push("init_platform".into());
            Ok(())
        }

        fn driver_init(&mut self, ctx: &mut InitContext<'_>) -> Result<()> {
            self.trace.borrow_mut().push("driver_init".into());
            ctx.save_item("resets", &self.resets)?;
            let resets = self.resets.clone();
            ctx.add_notifier(
                NotifyKind::Reset,
                Box::new(move |_, _| resets.with_mut(|n| *n += 1)),
            )
        }

        fn shutdown(&mut self, _session: &SessionHandle) {
            self.trace.borrow_mut().push("shutdown".into());
        }
    }

    fn options_in(dir: &std::path::Path, seconds: u64) -> MachineOptions {
        MachineOptions {
            state_directory: dir.join("sta"),
            nvram_directory: dir.join("nvram"),
            cfg_directory: dir.join("cfg"),
            seconds_to_run: seconds,
            ..MachineOptions::default()
        }
    }

    /// Board machine plus the counter its driver hooks onto Reset.
    fn board(
        behaviour: Behaviour,
        watchdog: WatchdogConfig,
        options: MachineOptions,
    ) -> (Machine, Trace, StateItem<u32>) {
        let trace = Trace::default();
        let resets = StateItem::new(0u32);
        let board = Board {
            trace: Rc::clone(&trace),
            behaviour,
            watchdog,
            resets: resets.clone(),
        };
        let machine = Machine::new(
            Box::new(board),
            Box::new(QuantumScheduler::new()),
            options,
        )
        .unwrap();
        (machine, trace, resets)
    }

    fn machine_with(behaviour: Behaviour, seconds: u64) -> (Machine, Trace, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let (machine, trace, _) = board(
            behaviour,
            WatchdogConfig::default(),
            options_in(dir.path(), seconds),
        );
        (machine, trace, dir)
    }

    fn machine() -> (Machine, Trace, tempfile::TempDir) {
        machine_with(Behaviour::default(), 1)
    }

    fn resets(trace: &Trace) -> usize {
        trace.borrow().iter().filter(|t| *t == "reset").count()
    }

    #[test]
    fn startup_runs_in_order_and_exits_cleanly() {
        let (mut machine, trace, _dir) = machine();
        assert_eq!(machine.phase(), MachinePhase::Preinit);

        let code = machine.run(true);

        assert_eq!(code, EXIT_SUCCESS);
        assert_eq!(machine.phase(), MachinePhase::Exit);
        assert!(machine.now() >= VirtualTime::from_secs(1));
        assert_eq!(
            *trace.borrow(),
            vec!["init_platform", "driver_init", "start:init", "reset", "stop", "exit", "shutdown"]
        );
        assert_eq!(machine.activation_report().unwrap().passes, 1);
    }

    #[test]
    fn fatal_fault_still_runs_exit_notifiers() {
        let behaviour = Behaviour {
            fail_at: Some(VirtualTime::from_millis(100)),
            ..Behaviour::default()
        };
        let (mut machine, trace, _dir) = machine_with(behaviour, 1);

        let code = machine.run(true);

        assert_eq!(code, 7);
        let trace = trace.borrow();
        assert_eq!(&trace[trace.len() - 3..], &["stop", "exit", "shutdown"]);
    }

    #[test]
    fn registrations_after_init_are_rejected() {
        let (mut machine, _trace, _dir) = machine();
        machine.boot(true).unwrap();
        assert_eq!(machine.phase(), MachinePhase::Running);

        assert!(matches!(
            machine.add_notifier(NotifyKind::Start, Box::new(|_, _| {})),
            Err(MachineError::WrongPhase { .. })
        ));
        assert!(matches!(
            machine.add_log_sink(Box::new(|_| {})),
            Err(MachineError::WrongPhase { .. })
        ));
        assert!(!machine.state().registration_allowed());
    }

    #[test]
    fn state_window_opens_only_for_init() {
        let (mut machine, _trace, _dir) = machine();
        assert!(!machine.state().registration_allowed());

        let early = StateItem::new(0u32);
        assert!(matches!(
            machine.state.register_item("early", &early),
            Err(MachineError::RegistrationClosed(_))
        ));
        assert_eq!(machine.state().illegal_registrations(), 1);

        machine.boot(true).unwrap();
        assert!(!machine.state().item_names().any(|n| n == "early"));
        machine.schedule_save("after_early");
        assert_eq!(
            machine.handle_save_load(),
            SaveLoadOutcome::Failed(SaveLoadKind::Save)
        );
        assert!(machine.take_messages()[0].contains("illegal registrations"));
    }

    #[test]
    fn host_and_driver_registrations_land_during_init() {
        let dir = tempfile::tempdir().unwrap();
        let (mut machine, _trace, resets) =
            board(Behaviour::default(), WatchdogConfig::default(), options_in(dir.path(), 1));
        let started = Rc::new(RefCell::new(0));
        let seen = Rc::clone(&started);
        machine
            .add_notifier(NotifyKind::Start, Box::new(move |_, _| *seen.borrow_mut() += 1))
            .unwrap();
        let lines = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&lines);
        machine
            .add_log_sink(Box::new(move |line| sink.lock().unwrap().push(line.to_string())))
            .unwrap();

        machine.boot(true).unwrap();
        assert_eq!(*started.borrow(), 1);
        assert_eq!(resets.get(), 1);
        assert!(machine.state().item_names().any(|n| n == "driver/resets"));

        crate::logerror!(machine.session(), "hello\n");
        assert_eq!(*lines.lock().unwrap(), vec!["hello\n".to_string()]);

        machine.schedule_soft_reset();
        machine.run_iteration().unwrap();
        assert_eq!(resets.get(), 2);
    }

    #[test]
    fn starting_twice_is_rejected() {
        let (mut machine, _trace, _dir) = machine();
        machine.start().unwrap();
        assert!(matches!(
            machine.start(),
            Err(MachineError::WrongPhase { .. })
        ));
        assert_eq!(machine.finish(Err(MachineError::Runtime("x".into()))), EXIT_FATAL_ERROR);
    }

    #[test]
    fn pause_and_resume_notify_only_on_change() {
        let (mut machine, _trace, _dir) = machine();
        machine.start().unwrap();
        let seen = Trace::default();
        for kind in [NotifyKind::Pause, NotifyKind::Resume] {
            let seen = Rc::clone(&seen);
            machine
                .add_notifier(kind, Box::new(move |_, _| seen.borrow_mut().push(kind.to_string())))
                .unwrap();
        }

        machine.pause();
        machine.pause();
        let before = machine.now();
        machine.run_iteration().unwrap();
        assert_eq!(machine.now(), before);
        machine.resume();
        machine.resume();

        assert_eq!(*seen.borrow(), vec!["pause", "resume"]);
    }

    #[test]
    fn save_request_resumes_a_paused_session() {
        let (mut machine, _trace, _dir) = machine();
        machine.boot(true).unwrap();
        machine.pause();
        machine.session().request_save("slot");

        machine.run_iteration().unwrap();

        assert!(!machine.is_paused());
        assert!(!machine.save_load_pending());
        assert_eq!(machine.take_messages(), vec!["State successfully saved."]);
    }

    #[test]
    fn steady_kicks_keep_the_watchdog_quiet() {
        let behaviour = Behaviour {
            kick_until: Some(VirtualTime::NEVER),
            ..Behaviour::default()
        };
        let (mut machine, trace, _dir) = machine_with(behaviour, 5);
        assert_eq!(machine.run(true), EXIT_SUCCESS);
        assert_eq!(resets(&trace), 1);
    }

    #[test]
    fn silent_software_is_reset_by_the_watchdog() {
        let behaviour = Behaviour {
            kick_until: Some(VirtualTime::from_secs(1)),
            ..Behaviour::default()
        };
        let (mut machine, trace, _dir) = machine_with(behaviour, 5);
        assert_eq!(machine.run(true), EXIT_SUCCESS);
        // Initial reset plus exactly one watchdog reset three seconds after
        // the last kick.
        assert_eq!(resets(&trace), 2);
    }

    #[test]
    fn exit_waits_for_pending_save() {
        let (mut machine, _trace, dir) = machine();
        machine.boot(true).unwrap();
        machine.schedule_save("final");
        machine.schedule_exit();
        assert!(machine.should_continue());

        machine.run_iteration().unwrap();

        assert!(!machine.should_continue());
        assert!(dir.path().join("sta").join("board").join("final.sta").exists());
    }

    fn autosave_path(dir: &tempfile::TempDir) -> std::path::PathBuf {
        dir.path().join("sta").join("board").join("auto.sta")
    }

    #[test]
    fn host_exit_writes_the_autosave() {
        let dir = tempfile::tempdir().unwrap();
        let options = MachineOptions {
            autosave: true,
            ..options_in(dir.path(), 0)
        };
        let (mut machine, _trace, _) = board(Behaviour::default(), WatchdogConfig::default(), options);
        machine.boot(true).unwrap();
        for _ in 0..3 {
            machine.run_iteration().unwrap();
        }

        machine.schedule_exit();
        while machine.should_continue() {
            machine.run_iteration().unwrap();
        }

        assert!(autosave_path(&dir).exists());
    }

    #[test]
    fn timed_exit_writes_the_autosave() {
        let dir = tempfile::tempdir().unwrap();
        let options = MachineOptions {
            autosave: true,
            ..options_in(dir.path(), 1)
        };
        let (mut machine, _trace, _) = board(Behaviour::default(), WatchdogConfig::default(), options);
        assert_eq!(machine.run(true), EXIT_SUCCESS);
        assert!(autosave_path(&dir).exists());
    }

    #[test]
    fn initial_state_is_loaded_during_boot() {
        let dir = tempfile::tempdir().unwrap();
        let (mut first, _trace, _) =
            board(Behaviour::default(), WatchdogConfig::default(), options_in(dir.path(), 0));
        first.boot(true).unwrap();
        for _ in 0..10 {
            first.run_iteration().unwrap();
        }
        first.schedule_save("snap");
        assert_eq!(
            first.handle_save_load(),
            SaveLoadOutcome::Completed(SaveLoadKind::Save)
        );
        let saved_at = first.now();

        let options = MachineOptions {
            state: Some("snap".into()),
            ..options_in(dir.path(), 0)
        };
        let (mut second, _trace, _) = board(Behaviour::default(), WatchdogConfig::default(), options);
        second.boot(false).unwrap();

        assert!(!second.save_load_pending());
        assert_eq!(second.now(), saved_at);
        assert_eq!(second.session().now(), saved_at);
    }

    fn vblank_machine(kick: bool) -> (Machine, Trace, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let behaviour = Behaviour {
            vblank: true,
            kick_until: kick.then_some(VirtualTime::NEVER),
            ..Behaviour::default()
        };
        let watchdog = WatchdogConfig {
            vblank_count: 3,
            time: None,
        };
        let (machine, trace, _) = board(behaviour, watchdog, options_in(dir.path(), 0));
        (machine, trace, dir)
    }

    #[test]
    fn vblank_watchdog_resets_after_counted_frames() {
        let (mut machine, trace, _dir) = vblank_machine(false);
        machine.boot(true).unwrap();
        assert_eq!(machine.watchdog().counter(), 3);

        machine.run_iteration().unwrap();
        machine.run_iteration().unwrap();
        assert_eq!(resets(&trace), 1);
        assert_eq!(machine.watchdog().counter(), 1);

        machine.run_iteration().unwrap();
        assert_eq!(resets(&trace), 2);
        assert_eq!(machine.watchdog().counter(), 3);
        assert!(machine.take_messages().is_empty());

        for _ in 0..3 {
            machine.run_iteration().unwrap();
        }
        assert_eq!(resets(&trace), 3);
    }

    #[test]
    fn kicked_vblank_watchdog_stays_quiet() {
        let (mut machine, trace, _dir) = vblank_machine(true);
        machine.boot(true).unwrap();
        for _ in 0..12 {
            machine.run_iteration().unwrap();
        }
        assert_eq!(resets(&trace), 1);
        assert_eq!(machine.phase(), MachinePhase::Running);
    }

    #[test]
    fn exited_session_refuses_to_run_again() {
        let (mut machine, _trace, _dir) = machine();
        assert!(!machine.enter(MachinePhase::Running));
        assert_eq!(machine.phase(), MachinePhase::Preinit);

        assert_eq!(machine.run(true), EXIT_SUCCESS);
        assert!(!machine.enter(MachinePhase::Running));
        assert!(!machine.enter(MachinePhase::Reset));
        assert_eq!(machine.phase(), MachinePhase::Exit);
    }
}
