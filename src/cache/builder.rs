//! Cache configuration.
//!

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sysinfo::{MemoryRefreshKind, RefreshKind};

use super::Cache;
use crate::{engine::IdleCallback, paging::Source, store::Mechanism, store::Store, Error, Result};

/// Default number of records per page.
pub const DEFAULT_PAGE_SIZE: u64 = 50;
/// Default byte budget for saved pages: 1 MiB.
pub const DEFAULT_CACHE_SIZE: u64 = 1024 * 1024;

/// Serializable cache settings.
///
/// ```
/// use pagecache::CacheOptions;
///
/// let options: CacheOptions =
///     serde_json::from_str(r#"{"name": "people", "pageSize": 20}"#).unwrap();
/// assert_eq!(options.page_size, 20);
/// assert_eq!(options.prefetch_size(), 20);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CacheOptions {
    /// Name of the cache, also the name of its store.
    pub name: String,
    pub page_size: u64,
    /// Byte budget for saved pages. Zero disables local caching.
    pub cache_size: u64,
    /// Records to prefetch after each read. Defaults to one page.
    pub prefetch_size: Option<u64>,
    pub mechanism: Mechanism,
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self {
            name: String::new(),
            page_size: DEFAULT_PAGE_SIZE,
            cache_size: DEFAULT_CACHE_SIZE,
            prefetch_size: None,
            mechanism: Mechanism::default(),
        }
    }
}

impl CacheOptions {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            ..Default::default()
        }
    }

    pub fn prefetch_size(&self) -> u64 {
        self.prefetch_size.unwrap_or(self.page_size)
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(Error::invalid("name", "cache name must not be empty"));
        }
        if self.page_size == 0 {
            return Err(Error::invalid("pageSize", "page size must be positive"));
        }
        Ok(())
    }
}

/// Builder for [Cache]
pub struct CacheBuilder {
    options: CacheOptions,
    source: Arc<dyn Source>,
    store: Option<Arc<dyn Store>>,
    on_idle: Option<IdleCallback>,
}

impl CacheBuilder {
    pub(crate) fn new(options: CacheOptions, source: Arc<dyn Source>) -> Self {
        Self {
            options,
            source,
            store: None,
            on_idle: None,
        }
    }

    /// Set the number of records per page.
    pub fn page_size(&mut self, size: u64) -> &mut Self {
        self.options.page_size = size;
        self
    }

    /// Byte budget for saved pages. Once it would be exceeded, pages are
    /// served without being saved and prefetching stops.
    ///
    /// Default is 1 MiB.
    pub fn cache_size(&mut self, bytes: u64) -> &mut Self {
        self.options.cache_size = bytes;
        self
    }

    /// Records to prefetch after each read. Zero disables prefetching.
    pub fn prefetch_size(&mut self, count: u64) -> &mut Self {
        self.options.prefetch_size = Some(count);
        self
    }

    pub fn mechanism(&mut self, mechanism: Mechanism) -> &mut Self {
        self.options.mechanism = mechanism;
        self
    }

    /// Use `store` instead of opening one from the mechanism.
    pub fn store(&mut self, store: Arc<dyn Store>) -> &mut Self {
        self.store = Some(store);
        self
    }

    pub fn on_idle(&mut self, on_idle: impl Fn() + Send + Sync + 'static) -> &mut Self {
        self.on_idle = Some(Arc::new(on_idle));
        self
    }

    /// Set the byte budget to a fraction of the system memory
    ///
    /// warning: does NOT fail if the fraction is greater than 1
    pub fn with_sys_memory(&mut self, fraction: f32) -> &mut Self {
        let sys = sysinfo::System::new_with_specifics(
            RefreshKind::new().with_memory(MemoryRefreshKind::everything()),
        );
        self.options.cache_size = (sys.total_memory() as f32 * fraction) as u64;
        self
    }

    pub fn build(&self) -> Result<Cache> {
        Cache::open(
            self.options.clone(),
            Arc::clone(&self.source),
            self.store.clone(),
            self.on_idle.clone(),
        )
    }
}
