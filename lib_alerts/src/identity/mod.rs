//! # Client Identity
//!
//! Every delivery loop acts on behalf of one logical client. The server keys its
//! delivery cursor on that client's id, so the id must survive reconnects and
//! restarts: it is generated once and persisted in an [`IdentityStore`].
//!
//! ## Failure Behaviour
//! Storage problems never stop a client from starting. When the store cannot be
//! read or written, a transient identity is generated and reused for the rest of
//! the process. Dedup continuity across restarts is lost in that case, nothing
//! else.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

use sha2::{Digest, Sha256};
use thiserror::Error;

/// Key/value backends for persisted ids.
pub mod store;

pub use store::{FileIdentityStore, IdentityStore, MemoryIdentityStore};

/// Errors raised by identity stores.
#[derive(Debug, Error)]
pub enum IdentityError {
    /// Reading or writing the backing file failed.
    #[error("I/O error occurred: {0}")]
    IoError(#[from] std::io::Error),

    /// The backing document is not a JSON object of strings.
    #[error("Identity document is corrupt: {0}")]
    SerdeError(#[from] serde_json::Error),

    /// No storage location exists at all.
    #[error("Identity storage unavailable: {0}")]
    StorageUnavailable(String),
}

/// # Client Identity
///
/// Resolves the stable id of one logical client.
pub struct ClientIdentity<St: IdentityStore> {
    store: St,
    namespace: String,
    fingerprint: bool,
    /// Session-only id used while the store is failing.
    transient: Option<String>,
}

impl<St: IdentityStore> ClientIdentity<St> {
    /// Creates a resolver persisting under `namespace`.
    pub fn new(store: St, namespace: impl Into<String>) -> Self {
        Self {
            store,
            namespace: namespace.into(),
            fingerprint: true,
            transient: None,
        }
    }

    /// Enables or disables the host fingerprint suffix on new ids.
    pub fn with_fingerprint(mut self, enabled: bool) -> Self {
        self.fingerprint = enabled;
        self
    }

    /// Returns the stored id, creating and persisting one on first use.
    ///
    /// Never fails: see the module docs for the degraded path.
    pub fn get_or_create(&mut self) -> String {
        match self.store.get(&self.namespace) {
            Ok(Some(id)) if !id.trim().is_empty() => id,
            Ok(_) => {
                if let Some(id) = &self.transient {
                    return id.clone();
                }
                let id = generate_client_id(self.fingerprint);
                match self.store.set(&self.namespace, &id) {
                    Ok(()) => log::info!("Created client identity {}", id),
                    Err(e) => {
                        log::warn!("Could not persist client identity ({}). Using a session-only id.", e);
                        self.transient = Some(id.clone());
                    }
                }
                id
            }
            Err(e) => {
                let fingerprint = self.fingerprint;
                let id = self
                    .transient
                    .get_or_insert_with(|| {
                        log::warn!("Identity storage unavailable ({}). Using a session-only id.", e);
                        generate_client_id(fingerprint)
                    })
                    .clone();
                id
            }
        }
    }

    /// True while the current id only lives in memory.
    pub fn is_transient(&self) -> bool {
        self.transient.is_some()
    }

    /// Deletes the persisted id so the next call creates a new one.
    pub fn forget(&mut self) -> Result<(), IdentityError> {
        self.transient = None;
        self.store.remove(&self.namespace)
    }

    /// Borrow of the backing store.
    pub fn store(&self) -> &St {
        &self.store
    }

    /// Mutable borrow of the backing store.
    pub fn store_mut(&mut self) -> &mut St {
        &mut self.store
    }

    /// Erases the store type, as the delivery loop expects.
    pub fn boxed(self) -> ClientIdentity<Box<dyn IdentityStore>>
    where
        St: 'static,
    {
        ClientIdentity {
            store: Box::new(self.store),
            namespace: self.namespace,
            fingerprint: self.fingerprint,
            transient: self.transient,
        }
    }
}

/// Builds `client_<micros hex>_<random hex>[_<fingerprint>]`.
pub fn generate_client_id(with_fingerprint: bool) -> String {
    let micros = chrono::Utc::now().timestamp_micros().max(0) as u64;
    let random: u64 = rand::random();
    let mut id = format!("client_{:x}_{:016x}", micros, random);
    if with_fingerprint {
        id.push('_');
        id.push_str(&environment_fingerprint());
    }
    id
}

/// Low-entropy host fingerprint: 8 hex chars of SHA-256 over hostname, OS and arch.
fn environment_fingerprint() -> String {
    let host = hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_default();
    let mut hasher = Sha256::new();
    hasher.update(host.as_bytes());
    hasher.update(std::env::consts::OS.as_bytes());
    hasher.update(std::env::consts::ARCH.as_bytes());
    hex::encode(&hasher.finalize()[..4])
}

#[cfg(test)]
mod tests {
    use super::*;

    struct BrokenStore;

    impl IdentityStore for BrokenStore {
        fn get(&self, _key: &str) -> Result<Option<String>, IdentityError> {
            Err(IdentityError::StorageUnavailable("disabled".into()))
        }
        fn set(&mut self, _key: &str, _value: &str) -> Result<(), IdentityError> {
            Err(IdentityError::StorageUnavailable("disabled".into()))
        }
        fn remove(&mut self, _key: &str) -> Result<(), IdentityError> {
            Err(IdentityError::StorageUnavailable("disabled".into()))
        }
    }

    /// Reads fine, refuses writes.
    struct ReadOnlyStore;

    impl IdentityStore for ReadOnlyStore {
        fn get(&self, _key: &str) -> Result<Option<String>, IdentityError> {
            Ok(None)
        }
        fn set(&mut self, _key: &str, _value: &str) -> Result<(), IdentityError> {
            Err(IdentityError::StorageUnavailable("read only".into()))
        }
        fn remove(&mut self, _key: &str) -> Result<(), IdentityError> {
            Ok(())
        }
    }

    #[test]
    fn same_scope_returns_same_id() {
        let mut identity = ClientIdentity::new(MemoryIdentityStore::new(), "alert_client_id");
        let first = identity.get_or_create();
        let second = identity.get_or_create();
        assert_eq!(first, second);
        assert!(first.starts_with("client_"));
        assert!(!identity.is_transient());
    }

    #[test]
    fn wiped_storage_yields_a_new_id() {
        let mut identity = ClientIdentity::new(MemoryIdentityStore::new(), "alert_client_id");
        let before = identity.get_or_create();
        identity.store_mut().wipe();
        let after = identity.get_or_create();
        assert_ne!(before, after);
    }

    #[test]
    fn id_persists_across_instances_sharing_a_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("identity.json");

        let first = ClientIdentity::new(FileIdentityStore::new(&path), "ns").get_or_create();
        let second = ClientIdentity::new(FileIdentityStore::new(&path), "ns").get_or_create();
        assert_eq!(first, second);

        let other_ns = ClientIdentity::new(FileIdentityStore::new(&path), "other").get_or_create();
        assert_ne!(first, other_ns);
    }

    #[test]
    fn unavailable_storage_degrades_to_stable_session_id() {
        let mut identity = ClientIdentity::new(BrokenStore, "ns");
        let first = identity.get_or_create();
        let second = identity.get_or_create();
        assert_eq!(first, second);
        assert!(identity.is_transient());
    }

    #[test]
    fn failed_write_keeps_the_session_id() {
        let mut identity = ClientIdentity::new(ReadOnlyStore, "ns");
        let first = identity.get_or_create();
        assert!(identity.is_transient());
        assert_eq!(first, identity.get_or_create());
    }

    #[test]
    fn fingerprint_suffix_is_optional() {
        let with = generate_client_id(true);
        let without = generate_client_id(false);
        assert_eq!(with.split('_').count(), 4);
        assert_eq!(without.split('_').count(), 3);
        assert_ne!(generate_client_id(false), generate_client_id(false));
    }
}
