//! Lifecycle notification bus.

use crate::component::{ComponentTree, DeviceContext};
use crate::error::{MachineError, Result};
use crate::phase::MachinePhase;
use std::fmt;

/// Lifecycle transitions components can hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NotifyKind {
    Start,
    Pause,
    Resume,
    Reset,
    Exit,
}

impl NotifyKind {
    pub const ALL: [NotifyKind; 5] = [
        NotifyKind::Start,
        NotifyKind::Pause,
        NotifyKind::Resume,
        NotifyKind::Reset,
        NotifyKind::Exit,
    ];

    fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for NotifyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            NotifyKind::Start => "start",
            NotifyKind::Pause => "pause",
            NotifyKind::Resume => "resume",
            NotifyKind::Reset => "reset",
            NotifyKind::Exit => "exit",
        };
        f.write_str(name)
    }
}

pub type NotifyCallback = Box<dyn FnMut(&mut ComponentTree, &mut DeviceContext<'_>)>;

/// Snapshot of the list lengths, used to undo registrations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NotifierMark([usize; 5]);

/// Ordered callback lists, one per [`NotifyKind`].
///
/// Exit callbacks run last-registered first so teardown unwinds startup;
/// every other kind runs in registration order.
#[derive(Default)]
pub struct NotifierBus {
    lists: [Vec<NotifyCallback>; 5],
}

impl NotifierBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `callback` for `kind`. Only legal while `phase` is Init.
    pub fn register(
        &mut self,
        phase: MachinePhase,
        kind: NotifyKind,
        callback: NotifyCallback,
    ) -> Result<()> {
        if !phase.allows_registration() {
            log::error!("[Notify] {} notifier registered during {} phase", kind, phase);
            return Err(MachineError::WrongPhase {
                operation: "add_notifier",
                phase,
            });
        }
        let list = &mut self.lists[kind.index()];
        if kind == NotifyKind::Exit {
            list.insert(0, callback);
        } else {
            list.push(callback);
        }
        Ok(())
    }

    pub fn mark(&self) -> NotifierMark {
        NotifierMark(NotifyKind::ALL.map(|kind| self.len(kind)))
    }

    /// Drop every callback registered since `mark` was taken.
    pub fn rollback(&mut self, mark: NotifierMark) {
        for kind in NotifyKind::ALL {
            let list = &mut self.lists[kind.index()];
            let added = list.len().saturating_sub(mark.0[kind.index()]);
            if kind == NotifyKind::Exit {
                list.drain(..added);
            } else {
                list.truncate(mark.0[kind.index()]);
            }
        }
    }

    pub fn len(&self, kind: NotifyKind) -> usize {
        self.lists[kind.index()].len()
    }

    pub fn fire(&mut self, kind: NotifyKind, tree: &mut ComponentTree, ctx: &mut DeviceContext<'_>) {
        log::debug!("[Notify] {} ({} callbacks)", kind, self.len(kind));
        for callback in self.lists[kind.index()].iter_mut() {
            callback(tree, ctx);
        }
    }
}

impl fmt::Debug for NotifierBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut map = f.debug_map();
        for kind in NotifyKind::ALL {
            map.entry(&kind, &self.len(kind));
        }
        map.finish()
    }
}
