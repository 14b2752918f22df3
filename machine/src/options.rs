//! Session options.

use crate::error::Result;
use crate::time::VirtualTime;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Placeholder in [`MachineOptions::state_name`] replaced by the system name.
pub const STATE_NAME_SYSTEM: &str = "%g";

/// User-facing knobs of a session.
///
/// Every field has a default, so an options file only needs to list what it
/// overrides.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MachineOptions {
    /// Root directory for save states.
    pub state_directory: PathBuf,
    pub nvram_directory: PathBuf,
    pub cfg_directory: PathBuf,
    /// Per-system subdirectory under `state_directory`; `%g` expands to the
    /// system name.
    pub state_name: String,
    /// Load the `auto` state on start and save it on exit.
    pub autosave: bool,
    /// State to load once the session is running.
    pub state: Option<String>,
    /// Surface diagnostics such as watchdog resets as user messages.
    pub verbose: bool,
    /// Error log receiving every session diagnostic.
    pub log_file: Option<PathBuf>,
    /// Stop after this many seconds of virtual time. Zero runs forever.
    pub seconds_to_run: u64,
    pub watchdog: bool,
    /// How long a save or load may wait for the scheduler to settle.
    pub saveload_grace: VirtualTime,
    pub skip_startup_screens: bool,
}

impl Default for MachineOptions {
    fn default() -> Self {
        Self {
            state_directory: PathBuf::from("sta"),
            nvram_directory: PathBuf::from("nvram"),
            cfg_directory: PathBuf::from("cfg"),
            state_name: STATE_NAME_SYSTEM.to_string(),
            autosave: false,
            state: None,
            verbose: false,
            log_file: None,
            seconds_to_run: 0,
            watchdog: true,
            saveload_grace: VirtualTime::from_secs(1),
            skip_startup_screens: false,
        }
    }
}

impl MachineOptions {
    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let options = Self::from_json(&text)?;
        log::info!("[Options] Loaded {}", path.display());
        Ok(options)
    }

    /// `state_name` with `%g` expanded for `system`.
    pub fn state_subdirectory(&self, system: &str) -> String {
        self.state_name.replace(STATE_NAME_SYSTEM, system)
    }
}
