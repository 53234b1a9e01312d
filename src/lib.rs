//! **pagecache**: an on-demand paging cache for large remote collections.
//!
//! Records are pulled from a remote [Source] one page at a time, saved in a
//! local key-value [Store] and served from there afterwards. Reads are
//! followed by background prefetches of the next pages until the cache's
//! byte budget is used up, and a [Cache::clear] preempts everything else.
//!
//! ```no_run
//! # use std::sync::Arc;
//! # use tokio::runtime::Runtime;
//! use pagecache::{testing::VecSource, Cache};
//!
//! # let rt = Runtime::new().unwrap();
//! # rt.block_on(async {
//! let source = Arc::new(VecSource::numbered("numbers", 1000));
//! let cache = Cache::builder("numbers", source)
//!     .page_size(100)
//!     // Use 1% of system memory for saved pages
//!     .with_sys_memory(0.01)
//!     .build()
//!     .unwrap();
//!
//! let records = cache.read_range(150, 20).unwrap().await.unwrap();
//! assert_eq!(records.len(), 20);
//! # })
//! ```

pub mod cache;
mod engine;
mod error;
pub mod file;
pub mod ledger;
pub mod memory;
mod operation;
pub mod paging;
pub mod range;
pub mod store;
pub mod testing;

pub use cache::{Cache, CacheBuilder, CacheOptions, Clearing, Filtered, ReadRange, Request};
pub use engine::{IdleCallback, Stats};
pub use error::{Error, Result};
pub use operation::Mode;
pub use paging::{Page, Record, Source};
pub use store::{Mechanism, Store};
