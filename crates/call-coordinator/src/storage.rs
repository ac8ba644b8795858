//! Local persistent key-value storage
//!
//! The coordinator persists two things: the call UUID ↔ session mapping and
//! the diagnostic trace ring. Both only need string-keyed get/set/remove.
//! Writes are synchronous so a crash right after a write still leaves it on
//! disk.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::error::{CoordinatorError, CoordinatorResult};

/// String-keyed local storage
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> CoordinatorResult<Option<String>>;

    fn set(&self, key: &str, value: &str) -> CoordinatorResult<()>;

    fn remove(&self, key: &str) -> CoordinatorResult<()>;
}

/// Process-local store; contents are lost on restart
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn keys(&self) -> Vec<String> {
        self.entries.lock().keys().cloned().collect()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> CoordinatorResult<Option<String>> {
        Ok(self.entries.lock().get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> CoordinatorResult<()> {
        self.entries.lock().insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> CoordinatorResult<()> {
        self.entries.lock().remove(key);
        Ok(())
    }
}

/// Store backed by one JSON document on disk.
///
/// The whole document is rewritten on every mutation through a temp file and
/// a rename, so a reader never observes a half-written file.
#[derive(Debug)]
pub struct JsonFileStore {
    path: PathBuf,
    entries: Mutex<HashMap<String, String>>,
}

impl JsonFileStore {
    /// Open (or create on first write) the store at `path`
    pub fn open(path: impl AsRef<Path>) -> CoordinatorResult<Self> {
        let path = path.as_ref().to_path_buf();
        let entries = match fs::read_to_string(&path) {
            Ok(raw) if raw.trim().is_empty() => HashMap::new(),
            Ok(raw) => serde_json::from_str(&raw)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => {
                return Err(CoordinatorError::storage(format!(
                    "failed to read {}: {}",
                    path.display(),
                    e
                )))
            }
        };
        debug!("Opened key-value store at {} with {} entries", path.display(), entries.len());
        Ok(Self { path, entries: Mutex::new(entries) })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn flush(&self, entries: &HashMap<String, String>) -> CoordinatorResult<()> {
        let raw = serde_json::to_string(entries)?;
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, raw)
            .and_then(|_| fs::rename(&tmp, &self.path))
            .map_err(|e| CoordinatorError::storage(format!("failed to write {}: {}", self.path.display(), e)))
    }
}

impl KeyValueStore for JsonFileStore {
    fn get(&self, key: &str) -> CoordinatorResult<Option<String>> {
        Ok(self.entries.lock().get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> CoordinatorResult<()> {
        let mut entries = self.entries.lock();
        entries.insert(key.to_string(), value.to_string());
        self.flush(&entries)
    }

    fn remove(&self, key: &str) -> CoordinatorResult<()> {
        let mut entries = self.entries.lock();
        if entries.remove(key).is_some() {
            self.flush(&entries)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::assert_ok;

    #[test]
    fn test_memory_store_roundtrip() {
        let store = MemoryStore::new();
        assert_ok!(store.set("a", "1"));
        assert_eq!(store.get("a").unwrap().as_deref(), Some("1"));
        assert_ok!(store.remove("a"));
        // Removing a missing key is not an error
        assert_ok!(store.remove("a"));
        assert_eq!(store.get("a").unwrap(), None);
        assert_eq!(store.len(), 0);
    }

    #[test]
    fn test_json_file_store_survives_reopen() {
        let path = std::env::temp_dir().join(format!("callsync-store-{}.json", uuid::Uuid::new_v4()));
        {
            let store = JsonFileStore::open(&path).unwrap();
            store.set("call_map:uuid:1", "room-1").unwrap();
            store.set("call_map:session:room-1", "1").unwrap();
            store.remove("call_map:session:room-1").unwrap();
        }
        let reopened = JsonFileStore::open(&path).unwrap();
        assert_eq!(reopened.get("call_map:uuid:1").unwrap().as_deref(), Some("room-1"));
        assert_eq!(reopened.get("call_map:session:room-1").unwrap(), None);
        let _ = fs::remove_file(&path);
    }
}
