//! Persistence manager.
//!
//! Components register named [`StateItem`]s while the session initializes.
//! Once registration closes the set is frozen, which lets a save-state file
//! carry a signature of exactly what was registered. A state file is
//! streamed as:
//!
//! 1. a [`StateHeader`] (magic, version, system name, registration
//!    signature, item count),
//! 2. one [`StateRecord`] per item, in name order,
//! 3. a [`StateTrailer`] holding the SHA-256 of all item payloads.

mod item;

pub use item::StateItem;

use crate::component::ComponentTree;
use crate::error::{MachineError, Result};
use bincode::Options;
use item::{SaveEntry, StagedLoad};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;
use std::io::{Read, Write};
use thiserror::Error;

/// File magic for save states.
pub const STATE_MAGIC: [u8; 8] = *b"BAVYSTA\x1a";
/// Bumped whenever the container layout changes.
pub const STATE_VERSION: u32 = 1;
/// Upper bound for any single decode, guards against corrupt length prefixes.
const DECODE_LIMIT: u64 = 1 << 30;

pub(crate) fn codec() -> impl Options + Copy {
    bincode::DefaultOptions::new().with_limit(DECODE_LIMIT)
}

/// Hook run before writing or after reading a state file.
pub type StateHook = Box<dyn FnMut(&mut ComponentTree)>;

/// Why a state file could not be written or read.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("{0} illegal state registration(s) after initialization")]
    IllegalRegistrations(u32),

    #[error("invalid header: {0}")]
    InvalidHeader(String),

    #[error("read error: {0}")]
    Read(String),

    #[error("write error: {0}")]
    Write(String),

    #[error("unknown error: {0}")]
    Unknown(String),
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StateHeader {
    pub magic: [u8; 8],
    pub version: u32,
    pub system: String,
    pub signature: String,
    pub item_count: u32,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StateRecord {
    pub name: String,
    pub data: Vec<u8>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StateTrailer {
    pub payload_hash: String,
}

/// Registry of persistable items plus the save/load entry points.
pub struct StateManager {
    system: String,
    items: BTreeMap<String, Box<dyn SaveEntry>>,
    registration_allowed: bool,
    illegal_registrations: u32,
    presave: Vec<StateHook>,
    postload: Vec<StateHook>,
}

impl StateManager {
    pub fn new(system: impl Into<String>) -> Self {
        Self {
            system: system.into(),
            items: BTreeMap::new(),
            registration_allowed: true,
            illegal_registrations: 0,
            presave: Vec::new(),
            postload: Vec::new(),
        }
    }

    pub fn system(&self) -> &str {
        &self.system
    }

    pub fn allow_registration(&mut self, allowed: bool) {
        self.registration_allowed = allowed;
    }

    pub fn registration_allowed(&self) -> bool {
        self.registration_allowed
    }

    pub fn illegal_registrations(&self) -> u32 {
        self.illegal_registrations
    }

    pub fn item_count(&self) -> usize {
        self.items.len()
    }

    pub fn item_names(&self) -> impl Iterator<Item = &str> {
        self.items.keys().map(String::as_str)
    }

    fn check_open(&mut self, what: &str) -> Result<()> {
        if self.registration_allowed {
            return Ok(());
        }
        self.illegal_registrations += 1;
        log::error!("[State] Attempt to register `{}` after state registration closed", what);
        Err(MachineError::RegistrationClosed(what.to_string()))
    }

    /// Register `item` under `name`.
    ///
    /// After registration has closed the attempt is rejected and counted,
    /// and every later save or load fails with
    /// [`StateError::IllegalRegistrations`].
    pub fn register_item<T>(&mut self, name: impl Into<String>, item: &StateItem<T>) -> Result<()>
    where
        T: Serialize + DeserializeOwned + 'static,
    {
        let name = name.into();
        self.check_open(&name)?;
        if self.items.contains_key(&name) {
            return Err(MachineError::DuplicateStateItem(name));
        }
        log::trace!("[State] Registered `{}`", name);
        self.items.insert(name, Box::new(item.clone()));
        Ok(())
    }

    /// Drop a registration made by an activation attempt that is being retried.
    pub(crate) fn unregister_item(&mut self, name: &str) {
        self.items.remove(name);
    }

    pub fn register_presave(&mut self, hook: StateHook) -> Result<()> {
        self.check_open("presave hook")?;
        self.presave.push(hook);
        Ok(())
    }

    pub fn register_postload(&mut self, hook: StateHook) -> Result<()> {
        self.check_open("postload hook")?;
        self.postload.push(hook);
        Ok(())
    }

    /// Hex SHA-256 over the registered item names and types.
    pub fn signature(&self) -> String {
        let mut hasher = Sha256::new();
        for (name, entry) in &self.items {
            hasher.update(name.as_bytes());
            hasher.update([0u8]);
            hasher.update(entry.type_name().as_bytes());
            hasher.update([0u8]);
        }
        hex::encode(hasher.finalize())
    }

    fn header(&self) -> StateHeader {
        StateHeader {
            magic: STATE_MAGIC,
            version: STATE_VERSION,
            system: self.system.clone(),
            signature: self.signature(),
            item_count: self.items.len() as u32,
        }
    }

    /// Serialize every registered item to `out`.
    pub fn write_file(
        &mut self,
        out: &mut dyn Write,
        tree: &mut ComponentTree,
    ) -> std::result::Result<(), StateError> {
        if self.illegal_registrations > 0 {
            return Err(StateError::IllegalRegistrations(self.illegal_registrations));
        }

        for hook in self.presave.iter_mut() {
            hook(tree);
        }

        let write_err = |e: bincode::Error| StateError::Write(e.to_string());
        codec()
            .serialize_into(&mut *out, &self.header())
            .map_err(write_err)?;

        let mut hasher = Sha256::new();
        for (name, entry) in &self.items {
            let data = entry
                .encode()
                .map_err(|e| StateError::Write(format!("`{}`: {}", name, e)))?;
            hasher.update(&data);
            let record = StateRecord {
                name: name.clone(),
                data,
            };
            codec().serialize_into(&mut *out, &record).map_err(write_err)?;
        }

        let trailer = StateTrailer {
            payload_hash: hex::encode(hasher.finalize()),
        };
        codec().serialize_into(&mut *out, &trailer).map_err(write_err)?;
        out.flush().map_err(|e| StateError::Write(e.to_string()))?;
        Ok(())
    }

    /// Restore every registered item from `input`.
    ///
    /// Nothing is assigned unless the whole file decodes and verifies.
    pub fn read_file(
        &mut self,
        input: &mut dyn Read,
        tree: &mut ComponentTree,
    ) -> std::result::Result<(), StateError> {
        if self.illegal_registrations > 0 {
            return Err(StateError::IllegalRegistrations(self.illegal_registrations));
        }

        let header: StateHeader = codec()
            .deserialize_from(&mut *input)
            .map_err(|e| StateError::InvalidHeader(e.to_string()))?;
        self.validate_header(&header)?;

        let mut hasher = Sha256::new();
        let mut staged: Vec<StagedLoad> = Vec::with_capacity(self.items.len());
        for _ in 0..header.item_count {
            let record: StateRecord = codec()
                .deserialize_from(&mut *input)
                .map_err(|e| StateError::Read(e.to_string()))?;
            let entry = self.items.get(&record.name).ok_or_else(|| {
                StateError::InvalidHeader(format!("unexpected item `{}`", record.name))
            })?;
            hasher.update(&record.data);
            let apply = entry
                .stage(&record.data)
                .map_err(|e| StateError::Read(format!("`{}`: {}", record.name, e)))?;
            staged.push(apply);
        }

        let trailer: StateTrailer = codec()
            .deserialize_from(&mut *input)
            .map_err(|e| StateError::Read(e.to_string()))?;
        if trailer.payload_hash != hex::encode(hasher.finalize()) {
            return Err(StateError::Read("payload hash mismatch".to_string()));
        }

        for apply in staged {
            apply();
        }
        for hook in self.postload.iter_mut() {
            hook(tree);
        }
        Ok(())
    }

    fn validate_header(&self, header: &StateHeader) -> std::result::Result<(), StateError> {
        if header.magic != STATE_MAGIC {
            return Err(StateError::InvalidHeader("bad magic".to_string()));
        }
        if header.version != STATE_VERSION {
            return Err(StateError::InvalidHeader(format!(
                "version mismatch: expected {}, found {}",
                STATE_VERSION, header.version
            )));
        }
        if header.system != self.system {
            return Err(StateError::InvalidHeader(format!(
                "state belongs to `{}`, not `{}`",
                header.system, self.system
            )));
        }
        if header.signature != self.signature() || header.item_count as usize != self.items.len() {
            return Err(StateError::InvalidHeader(
                "registration signature mismatch".to_string(),
            ));
        }
        Ok(())
    }
}

impl fmt::Debug for StateManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateManager")
            .field("system", &self.system)
            .field("items", &self.items.keys().collect::<Vec<_>>())
            .field("registration_allowed", &self.registration_allowed)
            .field("illegal_registrations", &self.illegal_registrations)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::io;
    use std::rc::Rc;

    fn manager_with(counter: &StateItem<u32>, name: &StateItem<String>) -> StateManager {
        let mut state = StateManager::new("testsys");
        state.register_item("cpu/counter", counter).unwrap();
        state.register_item("cpu/name", name).unwrap();
        state
    }

    #[test]
    fn write_then_read_restores_values() {
        let counter = StateItem::new(7u32);
        let name = StateItem::new(String::from("alpha"));
        let mut state = manager_with(&counter, &name);
        let mut tree = ComponentTree::new();

        let mut buf = Vec::new();
        state.write_file(&mut buf, &mut tree).unwrap();

        counter.set(0);
        name.set(String::new());
        state.read_file(&mut buf.as_slice(), &mut tree).unwrap();

        assert_eq!(counter.get(), 7);
        assert_eq!(name.get(), "alpha");
    }

    #[test]
    fn hooks_run_around_io() {
        let counter = StateItem::new(1u32);
        let name = StateItem::new(String::new());
        let mut state = manager_with(&counter, &name);
        let presaves = Rc::new(Cell::new(0));
        let postloads = Rc::new(Cell::new(0));
        {
            let presaves = Rc::clone(&presaves);
            state
                .register_presave(Box::new(move |_| presaves.set(presaves.get() + 1)))
                .unwrap();
            let postloads = Rc::clone(&postloads);
            state
                .register_postload(Box::new(move |_| postloads.set(postloads.get() + 1)))
                .unwrap();
        }
        let mut tree = ComponentTree::new();

        let mut buf = Vec::new();
        state.write_file(&mut buf, &mut tree).unwrap();
        state.read_file(&mut buf.as_slice(), &mut tree).unwrap();

        assert_eq!(presaves.get(), 1);
        assert_eq!(postloads.get(), 1);
    }

    #[test]
    fn late_registration_is_rejected_and_poisons_io() {
        let counter = StateItem::new(1u32);
        let name = StateItem::new(String::new());
        let mut state = manager_with(&counter, &name);
        state.allow_registration(false);

        let late = StateItem::new(0u8);
        assert!(matches!(
            state.register_item("late", &late),
            Err(MachineError::RegistrationClosed(_))
        ));
        assert_eq!(state.illegal_registrations(), 1);
        assert_eq!(state.item_count(), 2);

        let mut tree = ComponentTree::new();
        let mut buf = Vec::new();
        assert!(matches!(
            state.write_file(&mut buf, &mut tree),
            Err(StateError::IllegalRegistrations(1))
        ));
        assert!(buf.is_empty());
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let a = StateItem::new(1u32);
        let mut state = StateManager::new("testsys");
        state.register_item("a", &a).unwrap();
        assert!(matches!(
            state.register_item("a", &a),
            Err(MachineError::DuplicateStateItem(_))
        ));
    }

    #[test]
    fn mismatched_registrations_are_an_invalid_header() {
        let counter = StateItem::new(3u32);
        let name = StateItem::new(String::from("x"));
        let mut writer = manager_with(&counter, &name);
        let mut tree = ComponentTree::new();
        let mut buf = Vec::new();
        writer.write_file(&mut buf, &mut tree).unwrap();

        let mut reader = StateManager::new("testsys");
        let other = StateItem::new(0u64);
        reader.register_item("cpu/counter", &other).unwrap();
        assert!(matches!(
            reader.read_file(&mut buf.as_slice(), &mut tree),
            Err(StateError::InvalidHeader(_))
        ));

        let mut foreign = StateManager::new("othersys");
        foreign.register_item("cpu/counter", &counter).unwrap();
        foreign.register_item("cpu/name", &name).unwrap();
        assert!(matches!(
            foreign.read_file(&mut buf.as_slice(), &mut tree),
            Err(StateError::InvalidHeader(_))
        ));
    }

    #[test]
    fn garbage_is_an_invalid_header() {
        let mut state = StateManager::new("testsys");
        let mut tree = ComponentTree::new();
        let junk = b"definitely not a save state".to_vec();
        assert!(matches!(
            state.read_file(&mut junk.as_slice(), &mut tree),
            Err(StateError::InvalidHeader(_))
        ));
    }

    #[test]
    fn truncated_payload_is_a_read_error_and_changes_nothing() {
        let counter = StateItem::new(11u32);
        let name = StateItem::new(String::from("keep"));
        let mut state = manager_with(&counter, &name);
        let mut tree = ComponentTree::new();
        let mut buf = Vec::new();
        state.write_file(&mut buf, &mut tree).unwrap();

        counter.set(99);
        let truncated = &buf[..buf.len() - 10];
        assert!(matches!(
            state.read_file(&mut &truncated[..], &mut tree),
            Err(StateError::Read(_))
        ));
        assert_eq!(counter.get(), 99);
    }

    struct FailingWriter {
        budget: usize,
    }

    impl Write for FailingWriter {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if self.budget == 0 {
                return Err(io::Error::new(io::ErrorKind::Other, "disk full"));
            }
            let n = buf.len().min(self.budget);
            self.budget -= n;
            Ok(n)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn writer_failure_is_a_write_error() {
        let counter = StateItem::new(1u32);
        let name = StateItem::new("x".repeat(256));
        let mut state = manager_with(&counter, &name);
        let mut tree = ComponentTree::new();
        let mut out = FailingWriter { budget: 64 };
        assert!(matches!(
            state.write_file(&mut out, &mut tree),
            Err(StateError::Write(_))
        ));
    }

    #[test]
    fn signature_tracks_names_and_types() {
        let a = StateItem::new(0u32);
        let b = StateItem::new(0u64);
        let mut one = StateManager::new("s");
        one.register_item("x", &a).unwrap();
        let mut two = StateManager::new("s");
        two.register_item("x", &b).unwrap();
        let mut three = StateManager::new("s");
        three.register_item("x", &a).unwrap();

        assert_ne!(one.signature(), two.signature());
        assert_eq!(one.signature(), three.signature());
    }
}
