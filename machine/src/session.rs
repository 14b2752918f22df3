//! Shared session state.
//!
//! A [`SessionHandle`] is created once per session and cloned into every
//! collaborator that needs to talk back to the controller: components,
//! timer callbacks, the platform, and host threads. Lifecycle requests are
//! plain atomic flags so they can be raised from anywhere; everything else
//! is posted as a [`SessionRequest`] and applied by the controller, which
//! remains the only writer of lifecycle state.

use crate::error::{MachineError, Result};
use crate::logsink::{LogSink, LogSinks};
use crate::phase::MachinePhase;
use crate::time::VirtualTime;
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU8, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Emit a session diagnostic through the log sink chain.
///
/// ```ignore
/// logerror!(session, "bank switched to {}", bank);
/// ```
#[macro_export]
macro_rules! logerror {
    ($session:expr, $($arg:tt)*) => {
        $session.logerror(format_args!($($arg)*))
    };
}

/// Work the controller applies on behalf of components and hosts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionRequest {
    Save(String),
    Load(String),
    Pause,
    Resume,
    /// Kick the watchdog (re-arm it).
    WatchdogReset,
    WatchdogEnable(bool),
}

struct SharedState {
    /// Combined lifecycle flags, see the `*_PENDING` constants.
    flags: AtomicU8,
    phase: AtomicU8,
    /// Current virtual time in nanoseconds.
    time: AtomicU64,
    vblank_edges: AtomicU32,
    sinks: Mutex<LogSinks>,
    messages: Mutex<Vec<String>>,
    requests: Mutex<VecDeque<SessionRequest>>,
}

/// Cloneable handle onto the per-session shared state.
#[derive(Clone)]
pub struct SessionHandle {
    shared: Arc<SharedState>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl SessionHandle {
    const EXIT_PENDING: u8 = 0x01;
    const HARD_RESET_PENDING: u8 = 0x02;
    const SOFT_RESET_PENDING: u8 = 0x04;
    /// Ask the scheduler to abandon the current timeslice.
    const EAT_CYCLES: u8 = 0x08;
    const WATCHDOG_EXPIRED: u8 = 0x10;

    pub fn new() -> Self {
        Self {
            shared: Arc::new(SharedState {
                flags: AtomicU8::new(0),
                phase: AtomicU8::new(MachinePhase::Preinit.as_u8()),
                time: AtomicU64::new(0),
                vblank_edges: AtomicU32::new(0),
                sinks: Mutex::new(LogSinks::new()),
                messages: Mutex::new(Vec::new()),
                requests: Mutex::new(VecDeque::new()),
            }),
        }
    }

    // ------------------------------------------------------------------
    // Phase and time
    // ------------------------------------------------------------------

    pub fn phase(&self) -> MachinePhase {
        MachinePhase::from_u8(self.shared.phase.load(Ordering::Acquire))
    }

    pub(crate) fn set_phase(&self, phase: MachinePhase) {
        self.shared.phase.store(phase.as_u8(), Ordering::Release);
    }

    /// Current virtual time as last published by the scheduler.
    pub fn now(&self) -> VirtualTime {
        VirtualTime::from_nanos(self.shared.time.load(Ordering::Relaxed))
    }

    pub(crate) fn set_time(&self, now: VirtualTime) {
        self.shared.time.store(now.as_nanos(), Ordering::Relaxed);
    }

    // ------------------------------------------------------------------
    // Lifecycle requests
    // ------------------------------------------------------------------

    fn raise(&self, bits: u8) {
        self.shared.flags.fetch_or(bits, Ordering::Release);
    }

    fn take(&self, bit: u8) -> bool {
        self.shared.flags.fetch_and(!bit, Ordering::AcqRel) & bit != 0
    }

    fn test(&self, bit: u8) -> bool {
        self.shared.flags.load(Ordering::Relaxed) & bit != 0
    }

    /// Request the session to end once pending save/load work is done.
    pub fn schedule_exit(&self) {
        self.raise(Self::EXIT_PENDING | Self::EAT_CYCLES);
    }

    /// Request a full teardown so the host can rebuild the session.
    pub fn schedule_hard_reset(&self) {
        self.raise(Self::HARD_RESET_PENDING | Self::EAT_CYCLES);
    }

    /// Request re-entry into the reset phase at the end of this timeslice.
    pub fn schedule_soft_reset(&self) {
        self.raise(Self::SOFT_RESET_PENDING | Self::EAT_CYCLES);
        self.post(SessionRequest::Resume);
    }

    pub fn exit_pending(&self) -> bool {
        self.test(Self::EXIT_PENDING)
    }

    pub fn hard_reset_pending(&self) -> bool {
        self.test(Self::HARD_RESET_PENDING)
    }

    pub fn soft_reset_pending(&self) -> bool {
        self.test(Self::SOFT_RESET_PENDING)
    }

    pub(crate) fn take_soft_reset(&self) -> bool {
        self.take(Self::SOFT_RESET_PENDING)
    }

    /// Whether the running timeslice should be abandoned.
    #[inline]
    pub fn cycles_eaten(&self) -> bool {
        self.test(Self::EAT_CYCLES)
    }

    pub fn eat_cycles(&self) {
        self.raise(Self::EAT_CYCLES);
    }

    pub(crate) fn clear_eaten_cycles(&self) {
        self.take(Self::EAT_CYCLES);
    }

    pub(crate) fn flag_watchdog_expired(&self) {
        self.raise(Self::WATCHDOG_EXPIRED);
    }

    pub(crate) fn take_watchdog_expired(&self) -> bool {
        self.take(Self::WATCHDOG_EXPIRED)
    }

    /// Report a vertical-blank start edge of the primary screen.
    pub fn signal_vblank(&self) {
        self.shared.vblank_edges.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn take_vblank_edges(&self) -> u32 {
        self.shared.vblank_edges.swap(0, Ordering::Relaxed)
    }

    // ------------------------------------------------------------------
    // Deferred requests
    // ------------------------------------------------------------------

    pub fn post(&self, request: SessionRequest) {
        lock(&self.shared.requests).push_back(request);
    }

    pub fn request_save(&self, name: impl Into<String>) {
        self.post(SessionRequest::Save(name.into()));
    }

    pub fn request_load(&self, name: impl Into<String>) {
        self.post(SessionRequest::Load(name.into()));
    }

    pub fn request_pause(&self) {
        self.post(SessionRequest::Pause);
    }

    pub fn request_resume(&self) {
        self.post(SessionRequest::Resume);
    }

    pub fn kick_watchdog(&self) {
        self.post(SessionRequest::WatchdogReset);
    }

    pub fn enable_watchdog(&self, enable: bool) {
        self.post(SessionRequest::WatchdogEnable(enable));
    }

    pub(crate) fn drain_requests(&self) -> Vec<SessionRequest> {
        lock(&self.shared.requests).drain(..).collect()
    }

    // ------------------------------------------------------------------
    // Diagnostics
    // ------------------------------------------------------------------

    /// Register a diagnostic sink. Only legal during the init phase.
    pub fn add_log_sink(&self, sink: LogSink) -> Result<()> {
        let phase = self.phase();
        if !phase.allows_registration() {
            return Err(MachineError::WrongPhase {
                operation: "add_log_sink",
                phase,
            });
        }
        lock(&self.shared.sinks).add(sink);
        Ok(())
    }

    pub fn log_sink_count(&self) -> usize {
        lock(&self.shared.sinks).len()
    }

    /// Send a diagnostic to every registered sink. Sinks must not log back
    /// into the session.
    pub fn logerror(&self, args: fmt::Arguments<'_>) {
        lock(&self.shared.sinks).write(args);
    }

    /// Queue a transient user-visible message. The text is also logged.
    pub fn popmessage(&self, text: impl Into<String>) {
        let text = text.into();
        log::info!("[Session] {}", text);
        self.logerror(format_args!("{}\n", text));
        lock(&self.shared.messages).push(text);
    }

    /// Drain the queued user-visible messages.
    pub fn take_messages(&self) -> Vec<String> {
        std::mem::take(&mut *lock(&self.shared.messages))
    }
}

impl Default for SessionHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionHandle")
            .field("phase", &self.phase())
            .field("now", &self.now())
            .field("flags", &self.shared.flags.load(Ordering::Relaxed))
            .finish()
    }
}
