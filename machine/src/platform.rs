//! System definition and host hooks.

use crate::component::ComponentTree;
use crate::error::Result;
use crate::logsink::LogSink;
use crate::notify::{NotifierBus, NotifyCallback, NotifyKind};
use crate::scheduler::Scheduler;
use crate::session::SessionHandle;
use crate::state::{StateItem, StateManager};
use crate::time::VirtualTime;
use serde::Serialize;
use serde::de::DeserializeOwned;

/// Watchdog parameters a system declares.
///
/// A non-zero `vblank_count` selects the vblank-counting watchdog and takes
/// precedence over `time`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WatchdogConfig {
    pub vblank_count: u32,
    pub time: Option<VirtualTime>,
}

/// An emulated system plus the host services it runs on.
///
/// `configure` builds the component tree; the `init_*` hooks run in the
/// fixed order of [`Machine::start`](crate::machine::Machine::start).
pub trait Platform {
    /// Short system name. Used for state, NVRAM and config paths.
    fn name(&self) -> &str;

    fn supports_save(&self) -> bool {
        true
    }

    fn watchdog(&self) -> WatchdogConfig {
        WatchdogConfig::default()
    }

    fn configure(&mut self, tree: &mut ComponentTree) -> Result<()>;

    fn init_platform(&mut self, _session: &SessionHandle) -> Result<()> {
        Ok(())
    }

    fn init_video(&mut self, _session: &SessionHandle) -> Result<()> {
        Ok(())
    }

    fn init_sound(&mut self, _session: &SessionHandle) -> Result<()> {
        Ok(())
    }

    /// Bind inputs. Runs before components start so they can look inputs up.
    fn init_inputs(&mut self, _tree: &ComponentTree, _session: &SessionHandle) -> Result<()> {
        Ok(())
    }

    fn load_images(&mut self, _session: &SessionHandle) -> Result<()> {
        Ok(())
    }

    fn init_memory(&mut self, _ctx: &mut InitContext<'_>) -> Result<()> {
        Ok(())
    }

    /// System-specific setup. Last hook before the components start; may
    /// persist state and hook lifecycle events through `ctx`.
    fn driver_init(&mut self, _ctx: &mut InitContext<'_>) -> Result<()> {
        Ok(())
    }

    fn show_startup_screens(&mut self, _session: &SessionHandle, _first_run: bool) -> Result<()> {
        Ok(())
    }

    /// Keep the display alive while the session is paused.
    fn frame_update(&mut self, _session: &SessionHandle) {}

    fn shutdown(&mut self, _session: &SessionHandle) {}
}

/// Registration access handed to [`Platform::init_memory`] and
/// [`Platform::driver_init`] while the session is in the init phase.
pub struct InitContext<'a> {
    pub tree: &'a mut ComponentTree,
    pub scheduler: &'a mut dyn Scheduler,
    pub session: &'a SessionHandle,
    state: &'a mut StateManager,
    notifiers: &'a mut NotifierBus,
}

impl<'a> InitContext<'a> {
    pub(crate) fn new(
        tree: &'a mut ComponentTree,
        scheduler: &'a mut dyn Scheduler,
        state: &'a mut StateManager,
        notifiers: &'a mut NotifierBus,
        session: &'a SessionHandle,
    ) -> Self {
        Self {
            tree,
            scheduler,
            session,
            state,
            notifiers,
        }
    }

    /// Persist `item` as `driver/<name>`.
    pub fn save_item<T>(&mut self, name: &str, item: &StateItem<T>) -> Result<()>
    where
        T: Serialize + DeserializeOwned + 'static,
    {
        self.state.register_item(format!("driver/{}", name), item)
    }

    pub fn add_notifier(&mut self, kind: NotifyKind, callback: NotifyCallback) -> Result<()> {
        self.notifiers.register(self.session.phase(), kind, callback)
    }

    pub fn add_log_sink(&mut self, sink: LogSink) -> Result<()> {
        self.session.add_log_sink(sink)
    }
}
