//! Pages and the remote source they are fetched from.
//!
//! A page is a `page_size`-aligned slice of the remote collection. It is the
//! unit of I/O against both the local [Store](crate::store::Store) and the
//! remote [Source].

use std::fmt::Debug;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    range::{estimate_sequence, Range},
    Result,
};

/// A single entry of the remote collection.
pub type Record = Value;

/// A contiguous run of records starting at `index`.
///
/// `count` is the number of records the source actually returned, which is
/// less than the page size near the end of the collection and zero past it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Page {
    pub index: u64,
    pub count: u64,
    pub data: Vec<Record>,
}

impl Page {
    pub fn new(index: u64, data: Vec<Record>) -> Self {
        Self {
            index,
            count: data.len() as u64,
            data,
        }
    }

    pub fn range(&self) -> Range {
        Range::new(self.index, self.count)
    }

    /// Estimated cost of keeping this page in the local store.
    pub fn estimated_size(&self) -> u64 {
        // "index", "count" and "data" keys plus the two numeric fields
        (5 + 5 + 4) * 2 + 8 + 8 + estimate_sequence(&self.data)
    }

    pub(crate) fn encode(&self) -> Result<Bytes> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }

    pub(crate) fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Store key of the page starting at `index`.
pub fn page_key(index: u64) -> String {
    index.to_string()
}

/// The remote, paged collection being cached.
///
/// Calls may be abandoned at any await point when the cache cancels the
/// operation that issued them.
#[async_trait]
pub trait Source: Send + Sync + Debug {
    /// Identity of the collection. A cache whose persisted pages came from a
    /// different identifier is cleared on startup.
    fn identifier(&self) -> &str;

    /// Read up to `count` records starting at `index`.
    ///
    /// Returning fewer than `count` records marks the end of the collection.
    async fn read(&self, index: u64, count: u64) -> Result<Vec<Record>>;

    /// Total number of records in the collection.
    async fn count(&self) -> Result<u64>;
}

#[cfg(test)]
mod tests {
    use super::*;

    use serde_json::json;

    #[test]
    fn test_page_encode_decode() {
        let page = Page::new(20, vec![json!({"id": 20}), json!({"id": 21})]);
        assert_eq!(page.count, 2);
        assert_eq!(page.range(), Range::new(20, 2));

        let bytes = page.encode().unwrap();
        assert_eq!(Page::decode(&bytes).unwrap(), page);
        assert!(Page::decode(b"not a page").is_err());
    }

    #[test]
    fn test_page_size_grows_with_data() {
        let empty = Page::new(0, vec![]);
        let one = Page::new(0, vec![json!("ab")]);
        assert_eq!(empty.estimated_size(), 28 + 16);
        assert_eq!(one.estimated_size(), empty.estimated_size() + 2 + 4);
    }
}
