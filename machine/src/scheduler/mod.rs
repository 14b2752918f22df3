//! Execution scheduling.
//!
//! The [`Scheduler`] is the only place virtual time advances. The controller
//! calls [`Scheduler::timeslice`] once per loop iteration and otherwise only
//! allocates, adjusts and frees timers through it.

mod quantum;

pub use quantum::QuantumScheduler;

use crate::component::{ComponentId, ComponentTree, DeviceContext};
use crate::error::Result;
use crate::session::SessionHandle;
use crate::state::StateManager;
use crate::time::VirtualTime;
use std::fmt;

/// Closure run when a callback timer expires.
pub type TimerCallback = Box<dyn FnMut(&mut DeviceContext<'_>)>;

/// Opaque reference to a scheduler-owned timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerHandle(pub(crate) u32);

impl TimerHandle {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// What an expiring timer calls.
pub enum TimerTarget {
    /// [`Component::timer_fired`](crate::component::Component::timer_fired)
    /// on `id` with `timer`.
    Component { id: ComponentId, timer: u32 },
    Callback(TimerCallback),
}

impl fmt::Debug for TimerTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimerTarget::Component { id, timer } => {
                write!(f, "component #{} timer {}", id, timer)
            }
            TimerTarget::Callback(_) => f.write_str("callback"),
        }
    }
}

pub trait Scheduler {
    fn now(&self) -> VirtualTime;

    /// Advance every executing component by one quantum and fire the timers
    /// that came due. Returns early once cycles are eaten.
    fn timeslice(&mut self, tree: &mut ComponentTree, session: &SessionHandle) -> Result<()>;

    /// True when no enabled anonymous timer is outstanding.
    fn can_save(&self) -> bool;

    /// Abandon the rest of the current timeslice.
    fn eat_all_cycles(&mut self);

    /// Allocate a disabled timer. Timers without a `name` are anonymous.
    fn timer_alloc(&mut self, target: TimerTarget, name: Option<&str>) -> TimerHandle;

    /// Arm `timer` to expire `duration` from now, repeating every `period`
    /// when one is given. A duration of [`VirtualTime::NEVER`] disarms it.
    fn timer_adjust(&mut self, timer: TimerHandle, duration: VirtualTime, period: Option<VirtualTime>);

    fn timer_free(&mut self, timer: TimerHandle);

    /// Time left until `timer` expires, [`VirtualTime::NEVER`] if disarmed.
    fn timer_remaining(&self, timer: TimerHandle) -> VirtualTime;

    /// Descriptions of enabled anonymous timers, for diagnostics.
    fn anonymous_timers(&self) -> Vec<String>;

    /// Register the scheduler's own persisted state.
    fn register_state(&mut self, state: &mut StateManager) -> Result<()>;
}
