//! Non-volatile memory and per-component configuration files.
//!
//! Both survive between sessions, unlike save states. Failures here are
//! logged and otherwise ignored: a missing or unreadable file just means the
//! components start from their defaults.

use crate::component::{ComponentTree, TAG_SEPARATOR};
use crate::error::Result;
use serde_json::{Map, Value};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// `<nvram_dir>/<system>/<tag>.nv`, with tag separators flattened.
pub fn nvram_path(nvram_dir: &Path, system: &str, tag: &str) -> PathBuf {
    let file = tag.replace(TAG_SEPARATOR, "_");
    nvram_dir.join(system).join(format!("{}.nv", file))
}

/// `<cfg_dir>/<system>.cfg`.
pub fn config_path(cfg_dir: &Path, system: &str) -> PathBuf {
    cfg_dir.join(format!("{}.cfg", system))
}

pub fn load_nvram(tree: &mut ComponentTree, nvram_dir: &Path, system: &str) {
    for id in tree.tree_order() {
        let has_nvram = tree.component(id).is_some_and(|c| c.has_nvram());
        if !has_nvram {
            continue;
        }
        let path = nvram_path(nvram_dir, system, tree.tag(id));
        let data = match fs::read(&path) {
            Ok(data) => Some(data),
            Err(err) if err.kind() == io::ErrorKind::NotFound => None,
            Err(err) => {
                log::warn!("[NVRAM] Failed to read {}: {}", path.display(), err);
                None
            }
        };
        log::debug!(
            "[NVRAM] {} <- {}",
            tree.tag(id),
            if data.is_some() { "file" } else { "defaults" }
        );
        if let Some(component) = tree.component_mut(id) {
            component.nvram_load(data.as_deref());
        }
    }
}

pub fn save_nvram(tree: &ComponentTree, nvram_dir: &Path, system: &str) {
    for id in tree.tree_order() {
        let Some(component) = tree.component(id).filter(|c| c.has_nvram()) else {
            continue;
        };
        let Some(data) = component.nvram_save() else {
            continue;
        };
        let path = nvram_path(nvram_dir, system, tree.tag(id));
        if let Err(err) = write_creating_dirs(&path, &data) {
            log::warn!("[NVRAM] Failed to write {}: {}", path.display(), err);
        }
    }
}

pub fn load_config(tree: &mut ComponentTree, cfg_dir: &Path, system: &str) {
    let path = config_path(cfg_dir, system);
    let text = match fs::read_to_string(&path) {
        Ok(text) => text,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return,
        Err(err) => {
            log::warn!("[Config] Failed to read {}: {}", path.display(), err);
            return;
        }
    };
    let entries: Map<String, Value> = match serde_json::from_str(&text) {
        Ok(entries) => entries,
        Err(err) => {
            log::warn!("[Config] Ignoring malformed {}: {}", path.display(), err);
            return;
        }
    };
    for (tag, value) in &entries {
        match tree.find(tag).and_then(|id| tree.component_mut(id)) {
            Some(component) => component.config_load(value),
            None => log::debug!("[Config] No component `{}`, entry skipped", tag),
        }
    }
}

pub fn save_config(tree: &ComponentTree, cfg_dir: &Path, system: &str) {
    let path = config_path(cfg_dir, system);
    if let Err(err) = try_save_config(tree, &path) {
        log::warn!("[Config] Failed to write {}: {}", path.display(), err);
    }
}

fn try_save_config(tree: &ComponentTree, path: &Path) -> Result<()> {
    let mut entries = Map::new();
    for id in tree.tree_order() {
        if let Some(value) = tree.component(id).and_then(|c| c.config_save()) {
            entries.insert(tree.tag(id).to_string(), value);
        }
    }
    if entries.is_empty() {
        return Ok(());
    }
    let text = serde_json::to_string_pretty(&Value::Object(entries))?;
    write_creating_dirs(path, text.as_bytes())?;
    Ok(())
}

fn write_creating_dirs(path: &Path, data: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component::{Component, StartContext};
    use crate::error::StartResult;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[derive(Default)]
    struct Battery {
        bytes: Rc<RefCell<Option<Vec<u8>>>>,
        volume: Rc<RefCell<Option<Value>>>,
    }

    impl Component for Battery {
        fn start(&mut self, _ctx: &mut StartContext<'_>) -> StartResult {
            Ok(())
        }

        fn has_nvram(&self) -> bool {
            true
        }

        fn nvram_load(&mut self, data: Option<&[u8]>) {
            *self.bytes.borrow_mut() = Some(data.map(<[u8]>::to_vec).unwrap_or_else(|| vec![0xff; 4]));
        }

        fn nvram_save(&self) -> Option<Vec<u8>> {
            self.bytes.borrow().clone()
        }

        fn config_load(&mut self, value: &Value) {
            *self.volume.borrow_mut() = Some(value.clone());
        }

        fn config_save(&self) -> Option<Value> {
            self.volume.borrow().clone()
        }
    }

    #[test]
    fn nvram_defaults_then_persists() {
        let dir = tempfile::tempdir().unwrap();
        let battery = Battery::default();
        let bytes = Rc::clone(&battery.bytes);
        let mut tree = ComponentTree::new();
        let board = tree.add(None, "board", Box::new(Battery::default())).unwrap();
        tree.add(Some(board), "rtc", Box::new(battery)).unwrap();

        load_nvram(&mut tree, dir.path(), "sys");
        assert_eq!(*bytes.borrow(), Some(vec![0xff; 4]));

        *bytes.borrow_mut() = Some(vec![1, 2, 3]);
        save_nvram(&tree, dir.path(), "sys");
        let path = nvram_path(dir.path(), "sys", "board:rtc");
        assert_eq!(path.file_name().unwrap(), "board_rtc.nv");
        assert_eq!(fs::read(&path).unwrap(), vec![1, 2, 3]);

        *bytes.borrow_mut() = None;
        load_nvram(&mut tree, dir.path(), "sys");
        assert_eq!(*bytes.borrow(), Some(vec![1, 2, 3]));
    }

    #[test]
    fn config_round_trips_per_tag() {
        let dir = tempfile::tempdir().unwrap();
        let battery = Battery::default();
        let volume = Rc::clone(&battery.volume);
        let mut tree = ComponentTree::new();
        tree.add(None, "speaker", Box::new(battery)).unwrap();

        *volume.borrow_mut() = Some(serde_json::json!({ "volume": 7 }));
        save_config(&tree, dir.path(), "sys");

        *volume.borrow_mut() = None;
        load_config(&mut tree, dir.path(), "sys");
        assert_eq!(*volume.borrow(), Some(serde_json::json!({ "volume": 7 })));
    }

    #[test]
    fn malformed_config_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(config_path(dir.path(), "sys"), "{ nope").unwrap();
        let battery = Battery::default();
        let volume = Rc::clone(&battery.volume);
        let mut tree = ComponentTree::new();
        tree.add(None, "speaker", Box::new(battery)).unwrap();

        load_config(&mut tree, dir.path(), "sys");
        assert!(volume.borrow().is_none());
    }
}
