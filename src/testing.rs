//! In-memory [Source] for tests and benchmarks.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::Semaphore;

use crate::{
    paging::{Record, Source},
    Error, Result,
};

/// A [Source] serving a fixed list of records and counting its calls.
///
/// With a gate, every call waits for one permit, so a test can hold remote
/// requests open and release them one at a time.
#[derive(Debug)]
pub struct VecSource {
    identifier: String,
    records: Vec<Record>,
    gate: Option<Arc<Semaphore>>,
    reads: AtomicUsize,
    counts: AtomicUsize,
    fail_reads: AtomicBool,
}

impl VecSource {
    pub fn new(identifier: &str, records: Vec<Record>) -> Self {
        Self {
            identifier: identifier.to_owned(),
            records,
            gate: None,
            reads: AtomicUsize::new(0),
            counts: AtomicUsize::new(0),
            fail_reads: AtomicBool::new(false),
        }
    }

    /// Records `0, 1, .., len - 1`.
    pub fn numbered(identifier: &str, len: u64) -> Self {
        Self::new(identifier, (0..len).map(|i| json!(i)).collect())
    }

    pub fn with_gate(mut self, gate: Arc<Semaphore>) -> Self {
        self.gate = Some(gate);
        self
    }

    /// Number of `read` calls so far.
    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    pub fn counts(&self) -> usize {
        self.counts.load(Ordering::SeqCst)
    }

    /// Make subsequent reads fail.
    pub fn fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    async fn pass_gate(&self) -> Result<()> {
        if let Some(gate) = &self.gate {
            gate.acquire()
                .await
                .map_err(|e| Error::Source(e.to_string()))?
                .forget();
        }
        Ok(())
    }
}

#[async_trait]
impl Source for VecSource {
    fn identifier(&self) -> &str {
        &self.identifier
    }

    async fn read(&self, index: u64, count: u64) -> Result<Vec<Record>> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        self.pass_gate().await?;
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(Error::Source(format!("read of {index}+{count} refused")));
        }
        let len = self.records.len() as u64;
        let start = index.min(len) as usize;
        let end = index.saturating_add(count).min(len) as usize;
        Ok(self.records[start..end].to_vec())
    }

    async fn count(&self) -> Result<u64> {
        self.counts.fetch_add(1, Ordering::SeqCst);
        self.pass_gate().await?;
        Ok(self.records.len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_reads_past_end() {
        let source = VecSource::numbered("numbers", 23);
        assert_eq!(source.read(20, 10).await.unwrap(), vec![json!(20), json!(21), json!(22)]);
        assert!(source.read(30, 10).await.unwrap().is_empty());
        assert_eq!(source.count().await.unwrap(), 23);
        assert_eq!(source.reads(), 2);
        assert_eq!(source.counts(), 1);

        source.fail_reads(true);
        assert!(matches!(source.read(0, 10).await, Err(Error::Source(_))));
    }

    #[tokio::test]
    async fn test_gate_holds_reads() {
        let gate = Arc::new(Semaphore::new(0));
        let source = Arc::new(VecSource::numbered("numbers", 5).with_gate(gate.clone()));
        let read = tokio::spawn({
            let source = source.clone();
            async move { source.read(0, 5).await }
        });
        tokio::task::yield_now().await;
        assert!(!read.is_finished());
        gate.add_permits(1);
        assert_eq!(read.await.unwrap().unwrap().len(), 5);
    }
}
