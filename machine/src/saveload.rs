//! Deferred save/load.
//!
//! A state can only be captured when the scheduler has no anonymous timers
//! in flight: their callbacks are not part of the persisted state. Requests
//! therefore wait until the scheduler settles, and are dropped once the
//! grace period has run out.

use crate::component::ComponentTree;
use crate::options::MachineOptions;
use crate::scheduler::Scheduler;
use crate::session::SessionHandle;
use crate::state::{StateError, StateManager};
use crate::time::VirtualTime;
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter};
use std::path::{Path, PathBuf};

/// Extension of state files.
pub const STATE_EXTENSION: &str = "sta";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveLoadKind {
    Save,
    Load,
}

impl SaveLoadKind {
    fn verb(self) -> &'static str {
        match self {
            SaveLoadKind::Save => "save",
            SaveLoadKind::Load => "load",
        }
    }

    fn past(self) -> &'static str {
        match self {
            SaveLoadKind::Save => "saved",
            SaveLoadKind::Load => "loaded",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SaveRequest {
    pub kind: SaveLoadKind,
    pub path: PathBuf,
    pub requested_at: VirtualTime,
}

/// Result of one [`SaveLoadScheduler::handle`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveLoadOutcome {
    Idle,
    /// Scheduler not settled yet; try again next iteration.
    Deferred,
    /// Gave up waiting for the scheduler.
    Abandoned,
    Completed(SaveLoadKind),
    Failed(SaveLoadKind),
}

#[derive(Debug)]
pub struct SaveLoadScheduler {
    pending: Option<SaveRequest>,
    state_root: PathBuf,
    grace: VirtualTime,
    supports_save: bool,
}

impl SaveLoadScheduler {
    pub fn new(options: &MachineOptions, system: &str, supports_save: bool) -> Self {
        Self {
            pending: None,
            state_root: options
                .state_directory
                .join(options.state_subdirectory(system)),
            grace: options.saveload_grace,
            supports_save,
        }
    }

    /// Where a state called `name` lives.
    pub fn resolve_path(&self, name: &str) -> PathBuf {
        let path = Path::new(name);
        if path.is_absolute() {
            return path.to_path_buf();
        }
        self.state_root.join(format!("{}.{}", name, STATE_EXTENSION))
    }

    /// Record a request, replacing any outstanding one.
    pub fn schedule(&mut self, kind: SaveLoadKind, name: &str, now: VirtualTime) -> &SaveRequest {
        let path = self.resolve_path(name);
        if let Some(previous) = &self.pending {
            log::warn!(
                "[SaveLoad] {} of {} superseded",
                previous.kind.verb(),
                previous.path.display()
            );
        }
        log::debug!("[SaveLoad] {} of {} requested at {}", kind.verb(), path.display(), now);
        self.pending.insert(SaveRequest {
            kind,
            path,
            requested_at: now,
        })
    }

    pub fn pending(&self) -> Option<&SaveRequest> {
        self.pending.as_ref()
    }

    pub fn is_pending(&self) -> bool {
        self.pending.is_some()
    }

    pub fn cancel(&mut self) {
        self.pending = None;
    }

    /// Try to carry out the pending request.
    pub fn handle(
        &mut self,
        scheduler: &dyn Scheduler,
        state: &mut StateManager,
        tree: &mut ComponentTree,
        session: &SessionHandle,
    ) -> SaveLoadOutcome {
        let Some(request) = self.pending.as_ref() else {
            return SaveLoadOutcome::Idle;
        };
        let kind = request.kind;

        if !scheduler.can_save() {
            if scheduler.now().since(request.requested_at) < self.grace {
                return SaveLoadOutcome::Deferred;
            }
            for timer in scheduler.anonymous_timers() {
                crate::logerror!(session, "Anonymous timer: {}\n", timer);
            }
            session.popmessage(format!(
                "Unable to {} due to pending anonymous timers. See error.log for details.",
                kind.verb()
            ));
            self.pending = None;
            return SaveLoadOutcome::Abandoned;
        }

        let Some(request) = self.pending.take() else {
            return SaveLoadOutcome::Idle;
        };
        let outcome = match kind {
            SaveLoadKind::Save => self.save(&request.path, state, tree, session),
            SaveLoadKind::Load => self.load(&request.path, state, tree, session),
        };
        match outcome {
            Ok(()) => SaveLoadOutcome::Completed(kind),
            Err(()) => SaveLoadOutcome::Failed(kind),
        }
    }

    fn save(
        &self,
        path: &Path,
        state: &mut StateManager,
        tree: &mut ComponentTree,
        session: &SessionHandle,
    ) -> Result<(), ()> {
        let kind = SaveLoadKind::Save;
        let file = match create_state_file(path) {
            Ok(file) => file,
            Err(err) => {
                crate::logerror!(session, "Unable to create {}: {}\n", path.display(), err);
                session.popmessage(format!(
                    "Failed to open file for {} operation.",
                    kind.verb()
                ));
                return Err(());
            }
        };

        let mut writer = BufWriter::new(file);
        let result = state.write_file(&mut writer, tree);
        drop(writer);

        self.report(kind, &result, session);
        if result.is_err() {
            if let Err(err) = fs::remove_file(path) {
                log::warn!("[SaveLoad] Could not remove {}: {}", path.display(), err);
            }
            return Err(());
        }
        log::info!("[SaveLoad] Saved {}", path.display());
        Ok(())
    }

    fn load(
        &self,
        path: &Path,
        state: &mut StateManager,
        tree: &mut ComponentTree,
        session: &SessionHandle,
    ) -> Result<(), ()> {
        let kind = SaveLoadKind::Load;
        let file = match File::open(path) {
            Ok(file) => file,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                session.popmessage("No savestate file to load.");
                return Err(());
            }
            Err(err) => {
                crate::logerror!(session, "Unable to open {}: {}\n", path.display(), err);
                session.popmessage(format!(
                    "Failed to open file for {} operation.",
                    kind.verb()
                ));
                return Err(());
            }
        };

        let mut reader = BufReader::new(file);
        let result = state.read_file(&mut reader, tree);
        self.report(kind, &result, session);
        if result.is_ok() {
            log::info!("[SaveLoad] Loaded {}", path.display());
        }
        result.map_err(|_| ())
    }

    fn report(&self, kind: SaveLoadKind, result: &Result<(), StateError>, session: &SessionHandle) {
        let verb = kind.verb();
        let message = match result {
            Ok(()) if self.supports_save => format!("State successfully {}.", kind.past()),
            Ok(()) => format!(
                "State successfully {}.\nWarning: Save states are not officially supported for this machine.",
                kind.past()
            ),
            Err(StateError::IllegalRegistrations(_)) => format!(
                "Error: Unable to {} state due to illegal registrations. See error.log for details.",
                verb
            ),
            Err(StateError::InvalidHeader(_)) => format!(
                "Error: Unable to {} state due to an invalid header. Make sure the save state is correct for this machine.",
                verb
            ),
            Err(StateError::Read(_)) => format!(
                "Error: Unable to {} state due to a read error (file is likely corrupt).",
                verb
            ),
            Err(StateError::Write(_)) => format!(
                "Error: Unable to {} state due to a write error. Verify there is enough disk space.",
                verb
            ),
            Err(StateError::Unknown(_)) => {
                format!("Error: Unknown error during state {}.", kind.past())
            }
        };
        if let Err(err) = result {
            crate::logerror!(session, "State {} failed: {}\n", verb, err);
        }
        session.popmessage(message);
    }
}

fn create_state_file(path: &Path) -> io::Result<File> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    File::create(path)
}
