//! Component activation.
//!
//! Dependencies between components are never declared; a component that
//! needs another one reports [`StartError::MissingDependency`] and is tried
//! again on the next pass. Passes repeat until everything is started or a
//! pass makes no progress, which means the remaining components wait on each
//! other (or on something that will never start).

use crate::component::{ComponentId, ComponentTree};
use crate::error::{MachineError, Result, StartError};
use crate::notify::NotifierBus;
use crate::scheduler::Scheduler;
use crate::session::SessionHandle;
use crate::state::StateManager;

/// Outcome of a successful [`start_all`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivationReport {
    /// Number of passes over the tree, including the final one.
    pub passes: usize,
    /// Components in the order they started.
    pub order: Vec<ComponentId>,
}

/// Start every component of `tree` exactly once.
pub fn start_all(
    tree: &mut ComponentTree,
    scheduler: &mut dyn Scheduler,
    state: &mut StateManager,
    notifiers: &mut NotifierBus,
    session: &SessionHandle,
) -> Result<ActivationReport> {
    let candidates = tree.tree_order();
    let mut order = Vec::with_capacity(candidates.len());
    let mut last_failed: Option<usize> = None;
    let mut passes = 0;

    loop {
        passes += 1;
        let mut failed = 0;

        for &id in &candidates {
            if tree.is_started(id) {
                continue;
            }
            match tree.try_start(id, scheduler, state, notifiers, session) {
                Ok(()) => {
                    log::debug!("[Activation] started {}", tree.tag(id));
                    order.push(id);
                }
                Err(StartError::MissingDependency(needed)) => {
                    log::debug!(
                        "[Activation] {} waiting on {} (pass {})",
                        tree.tag(id),
                        needed,
                        passes
                    );
                    failed += 1;
                }
                Err(StartError::Fatal(err)) => {
                    log::error!("[Activation] {} failed to start: {}", tree.tag(id), err);
                    return Err(err);
                }
            }
        }

        if failed == 0 {
            break;
        }
        if last_failed == Some(failed) {
            let stuck: Vec<&str> = candidates
                .iter()
                .filter(|&&id| !tree.is_started(id))
                .map(|&id| tree.tag(id))
                .collect();
            return Err(MachineError::fatal(format!(
                "Circular dependency in device startup! ({})",
                stuck.join(", ")
            )));
        }
        last_failed = Some(failed);
    }

    log::info!(
        "[Activation] {} component(s) started in {} pass(es)",
        order.len(),
        passes
    );
    Ok(ActivationReport { passes, order })
}
