//! Persistent local identity.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use meshkit_core::{MAX_PEER_NAME_BYTES, MeshError, NodeIdentity, Result};
use parking_lot::Mutex;
use tracing::{debug, info};

/// Storage key for the local identity.
pub const LOCAL_IDENTITY_KEY: &str = "meshkit.local_identity";

/// Key/value storage for identities.
pub trait IdentityStore: Send + Sync {
    fn load(&self, key: &str) -> Result<Option<NodeIdentity>>;
    fn save(&self, key: &str, identity: &NodeIdentity) -> Result<()>;
}

/// Identities kept in memory, lost on exit.
#[derive(Debug, Default)]
pub struct MemoryIdentityStore {
    entries: Mutex<HashMap<String, NodeIdentity>>,
}

impl MemoryIdentityStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl IdentityStore for MemoryIdentityStore {
    fn load(&self, key: &str) -> Result<Option<NodeIdentity>> {
        Ok(self.entries.lock().get(key).cloned())
    }

    fn save(&self, key: &str, identity: &NodeIdentity) -> Result<()> {
        self.entries.lock().insert(key.to_string(), identity.clone());
        Ok(())
    }
}

/// Identities stored as a JSON object in one file.
#[derive(Debug)]
pub struct FileIdentityStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl FileIdentityStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_all(&self) -> Result<BTreeMap<String, NodeIdentity>> {
        if !self.path.exists() {
            return Ok(BTreeMap::new());
        }
        let raw = std::fs::read_to_string(&self.path)?;
        serde_json::from_str(&raw).map_err(|e| {
            MeshError::Identity(format!("corrupt identity store {}: {}", self.path.display(), e))
        })
    }
}

impl IdentityStore for FileIdentityStore {
    fn load(&self, key: &str) -> Result<Option<NodeIdentity>> {
        let _guard = self.lock.lock();
        Ok(self.read_all()?.remove(key))
    }

    fn save(&self, key: &str, identity: &NodeIdentity) -> Result<()> {
        let _guard = self.lock.lock();
        let mut all = self.read_all()?;
        all.insert(key.to_string(), identity.clone());
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.path, serde_json::to_vec_pretty(&all)?)?;
        debug!(path = %self.path.display(), "identity store written");
        Ok(())
    }
}

/// Load the persisted local identity, or create and persist a new one.
///
/// A stored identity advertising a different name is replaced.
///
/// # Panics
///
/// If `peer_name` is empty or longer than 63 UTF-8 bytes.
pub fn fetch_or_create_local_identity(peer_name: &str, store: &dyn IdentityStore) -> Result<NodeIdentity> {
    assert!(
        !peer_name.is_empty() && peer_name.len() <= MAX_PEER_NAME_BYTES,
        "peer name must be 1..={MAX_PEER_NAME_BYTES} UTF-8 bytes, got {} bytes",
        peer_name.len()
    );

    match store.load(LOCAL_IDENTITY_KEY)? {
        Some(identity) if identity.name == peer_name => {
            debug!(name = %peer_name, "reusing stored local identity");
            Ok(identity)
        }
        stale => {
            if let Some(old) = stale {
                info!(old = %old.name, new = %peer_name, "peer name changed, generating a new identity");
            }
            let identity = NodeIdentity::generate(peer_name);
            store.save(LOCAL_IDENTITY_KEY, &identity)?;
            Ok(identity)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_store_roundtrip() {
        let store = MemoryIdentityStore::new();
        assert!(store.load("k").unwrap().is_none());
        let id = NodeIdentity::generate("a");
        store.save("k", &id).unwrap();
        assert_eq!(store.load("k").unwrap(), Some(id));
    }

    #[test]
    fn identity_is_stable_across_fetches() {
        let store = MemoryIdentityStore::new();
        let first = fetch_or_create_local_identity("laptop", &store).unwrap();
        let second = fetch_or_create_local_identity("laptop", &store).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn name_change_regenerates_identity() {
        let store = MemoryIdentityStore::new();
        let first = fetch_or_create_local_identity("laptop", &store).unwrap();
        let renamed = fetch_or_create_local_identity("work-laptop", &store).unwrap();
        assert_ne!(first.uid, renamed.uid);
        assert_eq!(renamed.name, "work-laptop");
        assert_eq!(store.load(LOCAL_IDENTITY_KEY).unwrap(), Some(renamed));
    }

    #[test]
    fn file_store_persists_between_instances() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("identity.json");

        let first = fetch_or_create_local_identity("desk", &FileIdentityStore::new(&path)).unwrap();
        let second = fetch_or_create_local_identity("desk", &FileIdentityStore::new(&path)).unwrap();
        assert_eq!(first, second);

        let raw = std::fs::read_to_string(&path).unwrap();
        assert!(raw.contains(LOCAL_IDENTITY_KEY));
    }

    #[test]
    fn corrupt_file_store_is_an_identity_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("identity.json");
        std::fs::write(&path, "not json").unwrap();
        let result = FileIdentityStore::new(&path).load(LOCAL_IDENTITY_KEY);
        assert!(matches!(result, Err(MeshError::Identity(_))));
    }

    #[test]
    #[should_panic(expected = "peer name must be")]
    fn overlong_name_is_a_programmer_error() {
        let store = MemoryIdentityStore::new();
        let _ = fetch_or_create_local_identity(&"x".repeat(64), &store);
    }
}
