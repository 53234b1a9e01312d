//! Memory Store Builder
//!

use std::time::Duration;

use super::MemoryStore;

/// Builder for [MemoryStore]
#[derive(Debug, Default)]
pub struct MemoryStoreBuilder {
    name: String,
    capacity: Option<u64>,

    time_to_idle: Option<Duration>,
}

impl MemoryStoreBuilder {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Name of the store, used in log lines.
    pub fn name(&mut self, name: &str) -> &mut Self {
        self.name = name.to_owned();
        self
    }

    /// Cap the total size of stored values, in bytes.
    ///
    /// Unbounded by default.
    pub fn max_capacity(&mut self, bytes: u64) -> &mut Self {
        self.capacity = Some(bytes);
        self
    }

    /// If an entry has been idle longer than `time_to_idle`,
    /// it will be evicted.
    pub fn time_to_idle(&mut self, tti: Duration) -> &mut Self {
        self.time_to_idle = Some(tti);
        self
    }

    pub fn build(&self) -> MemoryStore {
        MemoryStore::with_params(self.name.clone(), self.capacity, self.time_to_idle)
    }
}
