//! # Identity Stores
//!
//! Durable and process-scoped key/value backends for [`ClientIdentity`](super::ClientIdentity).

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};

use super::IdentityError;

/// Directory (under the platform data dir) holding the default identity file.
const STORE_DIR_NAME: &str = "alert_client";
/// File name of the default identity document.
const STORE_FILE_NAME: &str = "identity.json";

/// # Identity Store
///
/// Minimal key/value contract for persisting client identifiers. Implementations
/// decide the storage scope: everything that shares a scope sees the same ids.
pub trait IdentityStore: Send {
    /// Returns the stored value, `None` when the key was never set.
    fn get(&self, key: &str) -> Result<Option<String>, IdentityError>;
    /// Stores `value` under `key`, replacing any previous value.
    fn set(&mut self, key: &str, value: &str) -> Result<(), IdentityError>;
    /// Forgets `key`. Removing a missing key is not an error.
    fn remove(&mut self, key: &str) -> Result<(), IdentityError>;
}

impl<T: IdentityStore + ?Sized> IdentityStore for Box<T> {
    fn get(&self, key: &str) -> Result<Option<String>, IdentityError> {
        (**self).get(key)
    }

    fn set(&mut self, key: &str, value: &str) -> Result<(), IdentityError> {
        (**self).set(key, value)
    }

    fn remove(&mut self, key: &str) -> Result<(), IdentityError> {
        (**self).remove(key)
    }
}

/// # File Identity Store
///
/// Keeps a small JSON object on disk. Every operation reads the file afresh so
/// that several processes sharing one file agree on the stored id.
#[derive(Debug, Clone)]
pub struct FileIdentityStore {
    path: PathBuf,
}

impl FileIdentityStore {
    /// Uses an explicit file location.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Uses `<local data dir>/alert_client/identity.json`.
    pub fn default_location() -> Result<Self, IdentityError> {
        let base = dirs::data_local_dir().ok_or_else(|| {
            IdentityError::StorageUnavailable("no local data directory on this platform".into())
        })?;
        Ok(Self::new(base.join(STORE_DIR_NAME).join(STORE_FILE_NAME)))
    }

    /// Location of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_all(&self) -> Result<BTreeMap<String, String>, IdentityError> {
        match fs::read_to_string(&self.path) {
            Ok(raw) if raw.trim().is_empty() => Ok(BTreeMap::new()),
            Ok(raw) => Ok(serde_json::from_str(&raw)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(BTreeMap::new()),
            Err(e) => Err(e.into()),
        }
    }

    fn write_all(&self, entries: &BTreeMap<String, String>) -> Result<(), IdentityError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&self.path, serde_json::to_string_pretty(entries)?)?;
        Ok(())
    }
}

impl IdentityStore for FileIdentityStore {
    fn get(&self, key: &str) -> Result<Option<String>, IdentityError> {
        Ok(self.read_all()?.remove(key))
    }

    fn set(&mut self, key: &str, value: &str) -> Result<(), IdentityError> {
        let mut entries = self.read_all()?;
        entries.insert(key.to_string(), value.to_string());
        self.write_all(&entries)
    }

    fn remove(&mut self, key: &str) -> Result<(), IdentityError> {
        let mut entries = self.read_all()?;
        if entries.remove(key).is_some() {
            self.write_all(&entries)?;
        }
        Ok(())
    }
}

/// # Memory Identity Store
///
/// Process-scoped store. Ids survive as long as the store value does.
#[derive(Debug, Clone, Default)]
pub struct MemoryIdentityStore {
    entries: HashMap<String, String>,
}

impl MemoryIdentityStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Drops every stored entry, as if the browser storage were cleared.
    pub fn wipe(&mut self) {
        self.entries.clear();
    }
}

impl IdentityStore for MemoryIdentityStore {
    fn get(&self, key: &str) -> Result<Option<String>, IdentityError> {
        Ok(self.entries.get(key).cloned())
    }

    fn set(&mut self, key: &str, value: &str) -> Result<(), IdentityError> {
        self.entries.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&mut self, key: &str) -> Result<(), IdentityError> {
        self.entries.remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_store_round_trips_and_keeps_other_keys() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = FileIdentityStore::new(dir.path().join("nested").join("identity.json"));

        assert_eq!(store.get("a").unwrap(), None);
        store.set("a", "one").unwrap();
        store.set("b", "two").unwrap();
        assert_eq!(store.get("a").unwrap().as_deref(), Some("one"));

        store.remove("a").unwrap();
        assert_eq!(store.get("a").unwrap(), None);
        assert_eq!(store.get("b").unwrap().as_deref(), Some("two"));
    }

    #[test]
    fn file_store_reports_corrupt_documents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("identity.json");
        fs::write(&path, "{ not json").unwrap();

        let store = FileIdentityStore::new(&path);
        assert!(matches!(store.get("a"), Err(IdentityError::SerdeError(_))));
    }
}
