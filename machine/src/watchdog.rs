//! Watchdog supervisor.
//!
//! Emulated software is expected to kick the watchdog periodically. If it
//! stops doing so the session is soft reset, the way real boards recover
//! from a hung program.

use crate::platform::WatchdogConfig;
use crate::scheduler::{Scheduler, TimerHandle};
use crate::session::SessionHandle;
use crate::time::VirtualTime;

/// Timeout used when the system declares no watchdog of its own.
pub const DEFAULT_WATCHDOG_TIME: VirtualTime = VirtualTime::from_secs(3);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchdogMode {
    Disabled,
    /// Fires after this many vblank start edges without a kick.
    VblankCount(u32),
    /// Fires after this much virtual time without a kick.
    TimeBased(VirtualTime),
    /// [`DEFAULT_WATCHDOG_TIME`] timeout.
    Default,
}

impl WatchdogMode {
    pub fn from_config(config: WatchdogConfig, enabled: bool) -> Self {
        if !enabled {
            WatchdogMode::Disabled
        } else if config.vblank_count != 0 {
            WatchdogMode::VblankCount(config.vblank_count)
        } else if let Some(time) = config.time.filter(|t| !t.is_zero()) {
            WatchdogMode::TimeBased(time)
        } else {
            WatchdogMode::Default
        }
    }

    /// Whether the system asked for this watchdog itself.
    fn is_explicit(self) -> bool {
        matches!(self, WatchdogMode::VblankCount(_) | WatchdogMode::TimeBased(_))
    }
}

#[derive(Debug)]
pub struct Watchdog {
    mode: WatchdogMode,
    enabled: bool,
    counter: u32,
    timer: Option<TimerHandle>,
    verbose: bool,
}

impl Watchdog {
    pub fn new(mode: WatchdogMode, verbose: bool) -> Self {
        Self {
            mode,
            enabled: false,
            counter: 0,
            timer: None,
            verbose,
        }
    }

    /// Attach the scheduler timer driving the time-based modes.
    pub fn attach_timer(&mut self, timer: TimerHandle) {
        self.timer = Some(timer);
    }

    pub fn mode(&self) -> WatchdogMode {
        self.mode
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn counter(&self) -> u32 {
        self.counter
    }

    /// Prepare for a machine reset.
    ///
    /// Only an explicitly configured watchdog is armed right away; the
    /// default one is enabled but waits for the first kick.
    pub fn machine_reset(&mut self, scheduler: &mut dyn Scheduler) {
        self.enabled = self.mode.is_explicit();
        self.reset(scheduler);
        self.enabled = self.mode != WatchdogMode::Disabled;
    }

    /// Kick: re-arm according to the mode.
    pub fn reset(&mut self, scheduler: &mut dyn Scheduler) {
        let deadline = if !self.enabled {
            VirtualTime::NEVER
        } else {
            match self.mode {
                WatchdogMode::Disabled => VirtualTime::NEVER,
                WatchdogMode::VblankCount(count) => {
                    self.counter = count;
                    VirtualTime::NEVER
                }
                WatchdogMode::TimeBased(time) => time,
                WatchdogMode::Default => DEFAULT_WATCHDOG_TIME,
            }
        };
        if let Some(timer) = self.timer {
            scheduler.timer_adjust(timer, deadline, None);
        }
    }

    /// Enable or disable; a change re-arms.
    pub fn enable(&mut self, enable: bool, scheduler: &mut dyn Scheduler) {
        if enable != self.enabled {
            self.enabled = enable;
            self.reset(scheduler);
        }
    }

    /// Count one vblank start edge. Returns true when this edge fired the
    /// watchdog.
    pub fn vblank(&mut self, session: &SessionHandle) -> bool {
        if !self.enabled || !matches!(self.mode, WatchdogMode::VblankCount(_)) {
            return false;
        }
        if self.counter != 0 {
            self.counter -= 1;
            if self.counter == 0 {
                self.fire(session);
                return true;
            }
        }
        false
    }

    /// The watchdog timer expired without being kicked.
    pub fn timer_expired(&mut self, session: &SessionHandle) -> bool {
        if !self.enabled {
            return false;
        }
        self.fire(session);
        true
    }

    fn fire(&self, session: &SessionHandle) {
        crate::logerror!(session, "Reset caused by the watchdog!!!\n");
        if self.verbose {
            session.popmessage("Reset caused by the watchdog!!!");
        }
        log::warn!("[Watchdog] fired at {}", session.now());
        session.schedule_soft_reset();
    }
}
