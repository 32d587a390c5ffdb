use crate::error::{IbxError, Result};
use crate::util::fsx::write_json_atomic;
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

pub const MARKERS_FILE: &str = "markers.json";

/// Extracted `(backup, group)` pairs, persisted per backup as
/// `<root>/<backup>/markers.json`. Only [`MarkerStore::clear`] removes entries.
pub struct MarkerStore {
    root: PathBuf,
    loaded: Mutex<HashMap<String, BTreeSet<String>>>,
}

impl MarkerStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            loaded: Mutex::new(HashMap::new()),
        }
    }

    fn path(&self, backup_id: &str) -> PathBuf {
        self.root.join(backup_id).join(MARKERS_FILE)
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, BTreeSet<String>>> {
        self.loaded.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn load(path: &Path) -> Result<BTreeSet<String>> {
        match std::fs::read(path) {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map_err(|e| IbxError::format(format!("{}: {e}", path.display()))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(BTreeSet::new()),
            Err(e) => Err(e.into()),
        }
    }

    fn with_set<T>(&self, backup_id: &str, f: impl FnOnce(&mut BTreeSet<String>) -> Result<T>) -> Result<T> {
        let mut loaded = self.lock();
        if !loaded.contains_key(backup_id) {
            let set = Self::load(&self.path(backup_id))?;
            loaded.insert(backup_id.to_string(), set);
        }
        match loaded.get_mut(backup_id) {
            Some(set) => f(set),
            None => Err(IbxError::format("marker set vanished")),
        }
    }

    pub fn contains(&self, backup_id: &str, group_key: &str) -> Result<bool> {
        self.with_set(backup_id, |set| Ok(set.contains(group_key)))
    }

    pub fn add(&self, backup_id: &str, group_key: &str) -> Result<()> {
        let path = self.path(backup_id);
        self.with_set(backup_id, |set| {
            if set.insert(group_key.to_string()) {
                write_json_atomic(&path, &*set)?;
            }
            Ok(())
        })
    }

    pub fn clear(&self, backup_id: &str) -> Result<()> {
        let mut loaded = self.lock();
        loaded.remove(backup_id);
        match std::fs::remove_file(self.path(backup_id)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn markers_survive_reload_until_cleared() {
        let dir = tempfile::tempdir().unwrap();
        let store = MarkerStore::new(dir.path());
        store.add("B1", "chat-1").unwrap();
        store.add("B1", "chat-1").unwrap();

        let reloaded = MarkerStore::new(dir.path());
        assert!(reloaded.contains("B1", "chat-1").unwrap());
        assert!(!reloaded.contains("B1", "chat-2").unwrap());

        reloaded.clear("B1").unwrap();
        assert!(!reloaded.contains("B1", "chat-1").unwrap());
        assert!(!MarkerStore::new(dir.path()).contains("B1", "chat-1").unwrap());
    }
}
