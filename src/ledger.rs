//! Persisted bookkeeping of what the local store holds.
//!
//! The ledger tracks how far into the collection pages have been saved, how
//! many bytes they are estimated to occupy, and whether the end of the
//! collection has been seen. It is serialized under
//! [SETTINGS_KEY](crate::store::SETTINGS_KEY).

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::Result;

/// Format version written by this crate. Any `1.x` ledger can be read.
pub const LEDGER_VERSION: &str = "1.0";

pub fn is_supported_version(version: &str) -> bool {
    version.starts_with("1.")
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Ledger {
    pub version: String,
    pub page_size: u64,
    pub source_id: String,
    /// Estimated bytes of all saved pages.
    pub actual_cache_size: u64,
    pub all_data_local: bool,
    /// Size of the collection, once a short page has revealed its end.
    pub collection_count: Option<u64>,
    /// Start index of the highest page saved so far.
    pub highest_saved_page: u64,
    pub highest_saved_page_size: u64,
}

impl Ledger {
    pub fn new(page_size: u64, source_id: impl Into<String>) -> Self {
        Self {
            version: LEDGER_VERSION.to_owned(),
            page_size,
            source_id: source_id.into(),
            actual_cache_size: 0,
            all_data_local: false,
            collection_count: None,
            highest_saved_page: 0,
            highest_saved_page_size: 0,
        }
    }

    /// Whether the ledger describes pages of this shape from this source.
    pub fn matches(&self, page_size: u64, source_id: &str) -> bool {
        self.page_size == page_size && self.source_id == source_id
    }

    /// Would saving another `page_bytes` exceed `budget`?
    pub fn would_overflow(&self, budget: u64, page_bytes: u64) -> bool {
        budget < self.actual_cache_size.saturating_add(page_bytes)
    }

    /// Account for a page of `count` records at `index` that was just saved.
    ///
    /// A zero-count page only settles the collection size when it directly
    /// follows the highest saved page.
    pub fn record_page(&mut self, index: u64, count: u64, page_bytes: u64) {
        if count == 0 {
            if self.collection_count.is_none()
                && index.checked_sub(self.page_size) == Some(self.highest_saved_page)
            {
                self.collection_count = Some(self.highest_saved_page + self.highest_saved_page_size);
            }
        } else {
            self.highest_saved_page = self.highest_saved_page.max(index);
            if self.highest_saved_page == index {
                self.highest_saved_page_size = count;
            }
            self.actual_cache_size += page_bytes;
            if count < self.page_size && self.collection_count.is_none() {
                self.collection_count = Some(index + count);
            }
        }

        if !self.all_data_local
            && self.collection_count == Some(self.highest_saved_page + self.highest_saved_page_size)
        {
            self.all_data_local = true;
        }
    }

    /// Forget every saved page, keeping the shape and source.
    pub fn reset(&mut self) {
        *self = Self::new(self.page_size, std::mem::take(&mut self.source_id));
    }

    pub(crate) fn encode(&self) -> Result<Bytes> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }

    pub(crate) fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_page_reveals_end() {
        let mut ledger = Ledger::new(10, "people");
        ledger.record_page(0, 10, 100);
        ledger.record_page(10, 10, 100);
        assert_eq!(ledger.collection_count, None);
        assert!(!ledger.all_data_local);

        ledger.record_page(20, 3, 30);
        assert_eq!(ledger.collection_count, Some(23));
        assert_eq!(ledger.highest_saved_page, 20);
        assert_eq!(ledger.highest_saved_page_size, 3);
        assert_eq!(ledger.actual_cache_size, 230);
        assert!(ledger.all_data_local);
    }

    #[test]
    fn test_empty_page_after_highest_saved() {
        let mut ledger = Ledger::new(10, "people");
        ledger.record_page(0, 10, 100);
        ledger.record_page(10, 10, 100);
        ledger.record_page(20, 0, 0);
        assert_eq!(ledger.collection_count, Some(20));
        assert!(ledger.all_data_local);
        assert_eq!(ledger.actual_cache_size, 200);
    }

    #[test]
    fn test_empty_page_out_of_order_is_ignored() {
        let mut ledger = Ledger::new(10, "people");
        ledger.record_page(0, 10, 100);
        // page 10 was never saved, so an empty page 30 says nothing
        ledger.record_page(30, 0, 0);
        assert_eq!(ledger.collection_count, None);
        assert!(!ledger.all_data_local);
    }

    #[test]
    fn test_collection_count_set_once() {
        let mut ledger = Ledger::new(10, "people");
        ledger.record_page(20, 4, 40);
        assert_eq!(ledger.collection_count, Some(24));
        ledger.record_page(40, 2, 20);
        assert_eq!(ledger.collection_count, Some(24));
        assert_eq!(ledger.highest_saved_page, 40);
        assert!(ledger.all_data_local);
    }

    #[test]
    fn test_overflow_and_reset() {
        let mut ledger = Ledger::new(10, "people");
        ledger.record_page(0, 10, 600);
        assert!(!ledger.would_overflow(1000, 400));
        assert!(ledger.would_overflow(1000, 401));
        assert!(ledger.would_overflow(0, 1));

        ledger.reset();
        assert_eq!(ledger, Ledger::new(10, "people"));
    }

    #[test]
    fn test_persisted_shape() {
        let ledger = Ledger::new(50, "https://example.org/feed");
        let bytes = ledger.encode().unwrap();
        let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(json["pageSize"], 50);
        assert_eq!(json["sourceId"], "https://example.org/feed");
        assert_eq!(json["collectionCount"], serde_json::Value::Null);
        assert_eq!(Ledger::decode(&bytes).unwrap(), ledger);
        assert!(is_supported_version(&ledger.version));
        assert!(is_supported_version("1.7"));
        assert!(!is_supported_version("2.0"));
        assert!(!is_supported_version(""));
        assert!(ledger.matches(50, "https://example.org/feed"));
        assert!(!ledger.matches(25, "https://example.org/feed"));
    }
}
