//! In-memory [Store] implementation
//!
//! Backed by a `moka` cache weighted by value size. By default nothing is
//! evicted; a capacity or idle timeout can be configured through the builder,
//! in which case evicted pages simply become cache misses.
//!
//! ```
//! use std::time::Duration;
//! use pagecache::memory::MemoryStore;
//!
//! let store = MemoryStore::builder()
//!     .name("people")
//!     .max_capacity(32 * 1024 * 1024)
//!     .time_to_idle(Duration::from_secs(600))
//!     .build();
//! ```

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use log::trace;
use moka::future::Cache;

mod builder;

pub use self::builder::MemoryStoreBuilder;
use crate::{store::Store, Error, Result};

/// In-memory [Store] implementation.
#[derive(Debug)]
pub struct MemoryStore {
    name: String,

    /// Key to value bytes.
    cache: Cache<String, Bytes>,
}

impl MemoryStore {
    /// Create a [`Builder`](MemoryStoreBuilder) to construct [MemoryStore].
    pub fn builder() -> MemoryStoreBuilder {
        MemoryStoreBuilder::new()
    }

    /// An unbounded store with the given name.
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_params(name.into(), None, None)
    }

    fn with_params(name: String, capacity: Option<u64>, time_to_idle: Option<Duration>) -> Self {
        let mut builder = Cache::builder()
            // weight each key using the size of the value
            .weigher(|_key, value: &Bytes| -> u32 {
                u32::try_from(value.len()).unwrap_or(u32::MAX)
            });
        if let Some(capacity) = capacity {
            builder = builder.max_capacity(capacity);
        }
        if let Some(tti) = time_to_idle {
            builder = builder.time_to_idle(tti);
        }
        Self {
            name,
            cache: builder.build(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn add(&self, key: &str, value: Bytes) -> Result<()> {
        let entry = self.cache.entry(key.to_owned()).or_insert(value).await;
        if entry.is_fresh() {
            Ok(())
        } else {
            Err(Error::KeyExists(key.to_owned()))
        }
    }

    async fn add_or_update(&self, key: &str, value: Bytes) -> Result<()> {
        trace!("{}: put {} ({} bytes)", self.name, key, value.len());
        self.cache.insert(key.to_owned(), value).await;
        Ok(())
    }

    async fn read(&self, key: &str) -> Result<Option<Bytes>> {
        Ok(self.cache.get(key).await)
    }

    async fn remove(&self, key: &str) -> Result<()> {
        self.cache.invalidate(key).await;
        Ok(())
    }

    async fn contains(&self, key: &str) -> Result<bool> {
        Ok(self.cache.contains_key(key))
    }

    async fn clear(&self) -> Result<()> {
        self.cache.invalidate_all();
        self.cache.run_pending_tasks().await;
        Ok(())
    }

    async fn get_all_keys(&self) -> Result<Vec<String>> {
        Ok(self.cache.iter().map(|(key, _)| key.as_ref().clone()).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_read_write() {
        let store = MemoryStore::new("test");
        assert_eq!(store.read("0").await.unwrap(), None);
        assert!(!store.contains("0").await.unwrap());

        store.add_or_update("0", Bytes::from("first")).await.unwrap();
        store.add_or_update("0", Bytes::from("second")).await.unwrap();
        assert!(store.contains("0").await.unwrap());
        assert_eq!(store.read("0").await.unwrap(), Some(Bytes::from("second")));

        store.remove("0").await.unwrap();
        assert!(!store.contains("0").await.unwrap());
        // removing twice is fine
        store.remove("0").await.unwrap();
    }

    #[tokio::test]
    async fn test_add_rejects_existing_key() {
        let store = MemoryStore::new("test");
        store.add("10", Bytes::from("page")).await.unwrap();
        let err = store.add("10", Bytes::from("other")).await.unwrap_err();
        assert!(matches!(err, Error::KeyExists(key) if key == "10"));
        assert_eq!(store.read("10").await.unwrap(), Some(Bytes::from("page")));
    }

    #[tokio::test]
    async fn test_keys_and_clear() {
        let store = MemoryStore::new("test");
        for key in ["0", "10", "__settings"] {
            store.add_or_update(key, Bytes::from(key)).await.unwrap();
        }
        let mut keys = store.get_all_keys().await.unwrap();
        keys.sort();
        assert_eq!(keys, vec!["0", "10", "__settings"]);

        store.clear().await.unwrap();
        assert!(!store.contains("0").await.unwrap());
        assert_eq!(store.read("__settings").await.unwrap(), None);
    }
}
