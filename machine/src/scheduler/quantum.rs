//! Fixed-quantum cooperative scheduler.

use super::{Scheduler, TimerHandle, TimerTarget};
use crate::component::{ComponentTree, DeviceContext};
use crate::error::Result;
use crate::session::SessionHandle;
use crate::state::{StateItem, StateManager};
use crate::time::VirtualTime;
use serde::{Deserialize, Serialize};

/// Default slice length: one 60 Hz frame.
pub const DEFAULT_QUANTUM: VirtualTime = VirtualTime::from_hz(60);

/// Persisted view of one timer slot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
struct TimerState {
    name: Option<String>,
    allocated: bool,
    enabled: bool,
    expire: VirtualTime,
    /// Zero or [`VirtualTime::NEVER`] for one-shot timers.
    period: VirtualTime,
}

impl TimerState {
    fn is_periodic(&self) -> bool {
        !self.period.is_zero() && !self.period.is_never()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
struct SchedulerState {
    now: VirtualTime,
    timers: Vec<TimerState>,
}

/// Runs executing components for a fixed quantum per slice, cut short by the
/// next timer expiry.
///
/// Timer targets are not persisted; a restored session has re-allocated the
/// same timers in the same order during startup, so slot indices line up.
pub struct QuantumScheduler {
    quantum: VirtualTime,
    state: StateItem<SchedulerState>,
    targets: Vec<Option<TimerTarget>>,
    eaten: bool,
}

impl QuantumScheduler {
    pub fn new() -> Self {
        Self::with_quantum(DEFAULT_QUANTUM)
    }

    pub fn with_quantum(quantum: VirtualTime) -> Self {
        let quantum = if quantum.is_zero() {
            DEFAULT_QUANTUM
        } else {
            quantum
        };
        Self {
            quantum,
            state: StateItem::default(),
            targets: Vec::new(),
            eaten: false,
        }
    }

    pub fn quantum(&self) -> VirtualTime {
        self.quantum
    }

    fn next_expiry(&self) -> Option<VirtualTime> {
        self.state.with(|s| {
            s.timers
                .iter()
                .filter(|t| t.allocated && t.enabled)
                .map(|t| t.expire)
                .min()
        })
    }

    /// Earliest enabled timer due at or before `limit`. Ties go to the lower
    /// slot so firing order is deterministic.
    fn next_due(&self, limit: VirtualTime) -> Option<usize> {
        self.state.with(|s| {
            s.timers
                .iter()
                .enumerate()
                .filter(|(_, t)| t.allocated && t.enabled && t.expire <= limit)
                .min_by_key(|(i, t)| (t.expire, *i))
                .map(|(i, _)| i)
        })
    }

    fn slice_interrupted(&self, session: &SessionHandle) -> bool {
        self.eaten || session.cycles_eaten()
    }

    fn fire(&mut self, index: usize, tree: &mut ComponentTree, session: &SessionHandle) {
        self.state.with_mut(|s| {
            let t = &mut s.timers[index];
            if t.is_periodic() {
                t.expire = t.expire + t.period;
            } else {
                t.enabled = false;
                t.expire = VirtualTime::NEVER;
            }
        });

        let Some(mut target) = self.targets.get_mut(index).and_then(Option::take) else {
            // Slot restored from a save state without a live target.
            self.state.with_mut(|s| s.timers[index].enabled = false);
            return;
        };
        {
            let mut ctx = DeviceContext::new(self, session);
            match &mut target {
                TimerTarget::Component { id, timer } => {
                    if let Some(component) = tree.component_mut(*id) {
                        component.timer_fired(*timer, &mut ctx);
                    }
                }
                TimerTarget::Callback(callback) => callback(&mut ctx),
            }
        }
        let still_allocated = self
            .state
            .with(|s| s.timers.get(index).is_some_and(|t| t.allocated));
        if still_allocated && self.targets[index].is_none() {
            self.targets[index] = Some(target);
        }
    }
}

impl Default for QuantumScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler for QuantumScheduler {
    fn now(&self) -> VirtualTime {
        self.state.with(|s| s.now)
    }

    fn timeslice(&mut self, tree: &mut ComponentTree, session: &SessionHandle) -> Result<()> {
        self.eaten = false;
        session.clear_eaten_cycles();

        let now = self.now();
        let mut target = now + self.quantum;
        if let Some(next) = self.next_expiry() {
            target = target.min(next.max(now));
        }
        let budget = target - now;

        for id in tree.executing() {
            if self.slice_interrupted(session) {
                log::trace!("[Scheduler] slice at {} cut short", now);
                break;
            }
            let mut ctx = DeviceContext::new(self, session);
            if let Some(component) = tree.component_mut(id) {
                component.execute(budget, &mut ctx)?;
            }
        }

        self.state.with_mut(|s| s.now = target);
        session.set_time(target);

        while !self.slice_interrupted(session) {
            let Some(index) = self.next_due(target) else {
                break;
            };
            self.fire(index, tree, session);
        }
        Ok(())
    }

    fn can_save(&self) -> bool {
        self.state.with(|s| {
            !s.timers
                .iter()
                .any(|t| t.allocated && t.enabled && t.name.is_none())
        })
    }

    fn eat_all_cycles(&mut self) {
        self.eaten = true;
    }

    fn timer_alloc(&mut self, target: TimerTarget, name: Option<&str>) -> TimerHandle {
        let slot = TimerState {
            name: name.map(str::to_string),
            allocated: true,
            enabled: false,
            expire: VirtualTime::NEVER,
            period: VirtualTime::ZERO,
        };
        let index = self.state.with_mut(|s| {
            match s.timers.iter().position(|t| !t.allocated) {
                Some(free) => {
                    s.timers[free] = slot;
                    free
                }
                None => {
                    s.timers.push(slot);
                    s.timers.len() - 1
                }
            }
        });
        if index >= self.targets.len() {
            self.targets.resize_with(index + 1, || None);
        }
        log::trace!("[Scheduler] timer #{} -> {:?} ({:?})", index, target, name);
        self.targets[index] = Some(target);
        TimerHandle(index as u32)
    }

    fn timer_adjust(&mut self, timer: TimerHandle, duration: VirtualTime, period: Option<VirtualTime>) {
        self.state.with_mut(|s| {
            let now = s.now;
            let Some(t) = s.timers.get_mut(timer.index()).filter(|t| t.allocated) else {
                log::warn!("[Scheduler] adjust of unallocated timer #{}", timer.index());
                return;
            };
            t.period = period.unwrap_or(VirtualTime::ZERO);
            if duration.is_never() {
                t.enabled = false;
                t.expire = VirtualTime::NEVER;
            } else {
                t.enabled = true;
                t.expire = now + duration;
            }
        });
    }

    fn timer_free(&mut self, timer: TimerHandle) {
        self.state.with_mut(|s| {
            if let Some(t) = s.timers.get_mut(timer.index()) {
                *t = TimerState::default();
            }
        });
        if let Some(slot) = self.targets.get_mut(timer.index()) {
            *slot = None;
        }
    }

    fn timer_remaining(&self, timer: TimerHandle) -> VirtualTime {
        self.state.with(|s| match s.timers.get(timer.index()) {
            Some(t) if t.allocated && t.enabled => t.expire.since(s.now),
            _ => VirtualTime::NEVER,
        })
    }

    fn anonymous_timers(&self) -> Vec<String> {
        self.state.with(|s| {
            s.timers
                .iter()
                .enumerate()
                .filter(|(_, t)| t.allocated && t.enabled && t.name.is_none())
                .map(|(i, t)| {
                    let target = self
                        .targets
                        .get(i)
                        .and_then(Option::as_ref)
                        .map(|target| format!("{:?}", target))
                        .unwrap_or_else(|| "unbound".to_string());
                    format!("timer #{} ({}) expires {}", i, target, t.expire)
                })
                .collect()
        })
    }

    fn register_state(&mut self, state: &mut StateManager) -> Result<()> {
        state.register_item("scheduler", &self.state)
    }
}
