//! Trait for the local key-value store backing a cache.
//!
//! Pages are stored under their start index and the cache bookkeeping under
//! [SETTINGS_KEY]. Values are opaque bytes.

use std::fmt::Debug;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::{file::FileStore, memory::MemoryStore, Result};

/// Reserved key holding the persisted [Ledger](crate::ledger::Ledger).
pub const SETTINGS_KEY: &str = "__settings";

/// [Store] trait.
///
/// Single-key asynchronous storage. Implementations must be internally
/// synchronized; the cache may issue reads concurrently with a write.
#[async_trait]
pub trait Store: Send + Sync + Debug {
    /// Add a new entry. Fails with [Error::KeyExists](crate::Error::KeyExists)
    /// if the key is already present.
    async fn add(&self, key: &str, value: Bytes) -> Result<()>;

    /// Insert or overwrite an entry.
    async fn add_or_update(&self, key: &str, value: Bytes) -> Result<()>;

    /// Read an entry.
    ///
    /// # Returns
    /// - `Ok(Some(Bytes))` if the key exists.
    /// - `Ok(None)` if it does not.
    /// - `Err(Error)` if an error occurred.
    async fn read(&self, key: &str) -> Result<Option<Bytes>>;

    /// Remove an entry. Removing a missing key is not an error.
    async fn remove(&self, key: &str) -> Result<()>;

    async fn contains(&self, key: &str) -> Result<bool>;

    /// Remove every entry.
    async fn clear(&self) -> Result<()>;

    async fn get_all_keys(&self) -> Result<Vec<String>>;

    /// Release any handle held on the underlying storage.
    fn close(&self) {}
}

/// Which store backend a cache opens when none is injected.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", tag = "type")]
pub enum Mechanism {
    /// Process-local [MemoryStore].
    #[default]
    Memory,
    /// [FileStore] rooted at `root/<cache name>`.
    File { root: PathBuf },
}

/// Open the store for cache `name` with the given mechanism.
pub fn open(name: &str, mechanism: &Mechanism) -> Result<Arc<dyn Store>> {
    Ok(match mechanism {
        Mechanism::Memory => Arc::new(MemoryStore::builder().name(name).build()),
        Mechanism::File { root } => Arc::new(FileStore::new(root.join(name))?),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mechanism_from_config() {
        let memory: Mechanism = serde_json::from_str(r#"{"type": "memory"}"#).unwrap();
        assert_eq!(memory, Mechanism::Memory);

        let file: Mechanism =
            serde_json::from_str(r#"{"type": "file", "root": "/var/cache/feeds"}"#).unwrap();
        assert_eq!(
            file,
            Mechanism::File {
                root: PathBuf::from("/var/cache/feeds")
            }
        );
    }

    #[tokio::test]
    async fn test_open_file_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(
            "people",
            &Mechanism::File {
                root: dir.path().to_path_buf(),
            },
        )
        .unwrap();
        store.add_or_update("0", Bytes::from("page")).await.unwrap();
        assert!(dir.path().join("people").exists());
    }
}
