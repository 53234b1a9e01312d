//! The paging cache façade.
//!
//! [Cache] is a cheap-to-clone handle. Reads, clears and counts return
//! handles that are futures and can be canceled; the state machines behind
//! them live in [Engine](crate::engine::Engine).

use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{ready, Context, Poll};

use futures::{
    future::{BoxFuture, Shared},
    stream::{self, BoxStream},
    FutureExt, StreamExt, TryStreamExt,
};
use log::debug;
use tokio::{runtime::Handle, sync::oneshot, task::JoinHandle};

use crate::{
    engine::{self, Engine, EngineConfig, IdleCallback, Stats},
    ledger::Ledger,
    operation::{Mode, OpId},
    paging::{Record, Source},
    store::{self, Store},
    Error, Result,
};

mod builder;

pub use builder::{CacheBuilder, CacheOptions, DEFAULT_CACHE_SIZE, DEFAULT_PAGE_SIZE};

/// State shared by every handle of one cache and by its in-flight requests.
pub(crate) struct Core {
    engine: Mutex<Engine>,
    pub(crate) runtime: Handle,
    pub(crate) store: Arc<dyn Store>,
    pub(crate) source: Arc<dyn Source>,
    pub(crate) page_size: u64,
}

impl Core {
    /// Run `f` under the engine lock. The idle callback, if due, fires after
    /// the lock is released.
    pub(crate) fn with_engine<R>(&self, f: impl FnOnce(&mut Engine) -> R) -> R {
        let (result, on_idle) = {
            let mut engine = self.engine.lock().unwrap_or_else(PoisonError::into_inner);
            let result = f(&mut engine);
            (result, engine.take_idle())
        };
        if let Some(on_idle) = on_idle {
            on_idle();
        }
        result
    }
}

impl Drop for Core {
    fn drop(&mut self) {
        self.store.close();
    }
}

/// On-demand paging cache over a remote [Source].
///
/// Records are fetched a page at a time, saved to the local [Store] and
/// served from there on later reads. After each read the following pages are
/// prefetched in the background until the byte budget is used up.
#[derive(Clone)]
pub struct Cache {
    core: Arc<Core>,
}

impl fmt::Debug for Cache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cache")
            .field("source", &self.core.source)
            .field("store", &self.core.store)
            .field("page_size", &self.core.page_size)
            .finish_non_exhaustive()
    }
}

impl Cache {
    /// Start configuring a cache called `name` over `source`.
    pub fn builder(name: &str, source: Arc<dyn Source>) -> CacheBuilder {
        CacheBuilder::new(CacheOptions::new(name), source)
    }

    /// Create a cache from deserialized options.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(options: CacheOptions, source: Arc<dyn Source>) -> Result<Self> {
        Self::open(options, source, None, None)
    }

    pub(crate) fn open(
        options: CacheOptions,
        source: Arc<dyn Source>,
        store: Option<Arc<dyn Store>>,
        on_idle: Option<IdleCallback>,
    ) -> Result<Self> {
        options.validate()?;
        let runtime = Handle::try_current().map_err(|e| Error::Runtime(e.to_string()))?;
        let store = match store {
            Some(store) => store,
            None => store::open(&options.name, &options.mechanism)?,
        };
        debug!(
            "opening cache {} over {} (page size {}, budget {} bytes)",
            options.name,
            source.identifier(),
            options.page_size,
            options.cache_size
        );

        let config = EngineConfig {
            page_size: options.page_size,
            prefetch_size: options.prefetch_size(),
            cache_size: options.cache_size,
            source_id: source.identifier().to_owned(),
            on_idle,
        };
        let core = Arc::new_cyclic(|core| Core {
            engine: Mutex::new(Engine::new(core.clone(), config)),
            runtime: runtime.clone(),
            store,
            source,
            page_size: options.page_size,
        });
        runtime.spawn(engine::initialize(Arc::clone(&core)));
        Ok(Self { core })
    }

    pub fn page_size(&self) -> u64 {
        self.core.page_size
    }

    /// Number of records in the collection.
    ///
    /// Answered locally once every record has been cached, otherwise asked of
    /// the source.
    pub fn count(&self) -> Result<Request<u64>> {
        let local = self.core.with_engine(|engine| {
            engine.check()?;
            Ok::<_, Error>(engine.local_count())
        })?;
        let task = self
            .core
            .runtime
            .spawn(count_records(Arc::clone(&self.core), local));
        Ok(Request { task })
    }

    /// Read `count` records starting at `index`.
    ///
    /// Fewer records are returned when the collection ends inside the range.
    /// The range plus one page past it must fit in a `u64`.
    pub fn read_range(&self, index: u64, count: u64) -> Result<ReadRange> {
        let end = index
            .checked_add(count)
            .and_then(|end| end.checked_add(self.core.page_size));
        if end.is_none() {
            return Err(Error::invalid(
                "count",
                format!("range {index}+{count} overflows"),
            ));
        }
        let (id, rx) = self.core.with_engine(|engine| {
            engine.check()?;
            Ok::<_, Error>(engine.read(index, count))
        })?;
        Ok(ReadRange {
            core: Arc::clone(&self.core),
            id,
            rx,
            settled: false,
        })
    }

    /// Scan forward from `index` for up to `count` records matching
    /// `predicate`. A negative `count` scans to the end of the collection.
    pub fn filter_forward<F>(&self, index: u64, count: i64, predicate: F) -> Result<Request<Vec<Filtered>>>
    where
        F: Fn(&Record) -> bool + Send + 'static,
    {
        self.core.with_engine(|engine| engine.check())?;
        let task = self
            .core
            .runtime
            .spawn(filter_forward(self.clone(), index, wanted(count), predicate));
        Ok(Request { task })
    }

    /// Scan backward from `index` towards the start of the collection.
    ///
    /// Matches are returned in ascending index order.
    pub fn filter_back<F>(&self, index: u64, count: i64, predicate: F) -> Result<Request<Vec<Filtered>>>
    where
        F: Fn(&Record) -> bool + Send + 'static,
    {
        self.core.with_engine(|engine| engine.check())?;
        let task = self
            .core
            .runtime
            .spawn(filter_back(self.clone(), index, wanted(count), predicate));
        Ok(Request { task })
    }

    /// Empty the store and reset the ledger.
    ///
    /// Pending reads and prefetches are canceled. While a clear is pending,
    /// calling this again returns the same [Clearing].
    pub fn clear(&self) -> Result<Clearing> {
        self.core.with_engine(|engine| {
            engine.check()?;
            Ok(engine.clear())
        })
    }

    /// Every record of the collection, read a page at a time from index 0.
    pub fn contents(&self) -> Result<BoxStream<'static, Result<Record>>> {
        self.core.with_engine(|engine| engine.check())?;
        let cache = self.clone();
        Ok(
            stream::try_unfold(Some(0), move |start| next_page(cache.clone(), start))
                .map_ok(|records| stream::iter(records.into_iter().map(Ok::<Record, Error>)))
                .try_flatten()
                .boxed(),
        )
    }

    pub fn stats(&self) -> Stats {
        self.core.with_engine(|engine| engine.stats())
    }

    /// Current cache mode.
    pub fn mode(&self) -> Mode {
        self.core.with_engine(|engine| engine.mode())
    }

    /// Snapshot of the bookkeeping for the local store.
    pub fn ledger(&self) -> Ledger {
        self.core.with_engine(|engine| engine.ledger().clone())
    }

    /// Operations queued or running, prefetches included.
    pub fn pending_operations(&self) -> usize {
        self.core.with_engine(|engine| engine.pending_operations())
    }

    /// Replace the callback fired each time the pending operations drain.
    pub fn set_on_idle(&self, on_idle: Option<IdleCallback>) {
        self.core.with_engine(|engine| engine.set_on_idle(on_idle));
    }
}

/// A record matched by [Cache::filter_forward] or [Cache::filter_back].
#[derive(Debug, Clone, PartialEq)]
pub struct Filtered {
    pub index: u64,
    pub item: Record,
}

fn wanted(count: i64) -> Option<usize> {
    usize::try_from(count).ok()
}

async fn count_records(core: Arc<Core>, local: Option<u64>) -> Result<u64> {
    if let Some(count) = local {
        return Ok(count);
    }
    let count = core.source.count().await?;
    core.with_engine(Engine::record_count);
    Ok(count)
}

async fn filter_forward<F>(cache: Cache, index: u64, wanted: Option<usize>, predicate: F) -> Result<Vec<Filtered>>
where
    F: Fn(&Record) -> bool,
{
    let mut found = Vec::new();
    if wanted == Some(0) {
        return Ok(found);
    }
    let page_size = cache.page_size();
    let mut start = index / page_size * page_size;
    loop {
        let records = cache.read_range(start, page_size)?.await?;
        let short = (records.len() as u64) < page_size;
        for (at, item) in (start..).zip(records) {
            if at >= index && predicate(&item) {
                found.push(Filtered { index: at, item });
                if wanted == Some(found.len()) {
                    return Ok(found);
                }
            }
        }
        if short {
            return Ok(found);
        }
        start += page_size;
    }
}

async fn filter_back<F>(cache: Cache, index: u64, wanted: Option<usize>, predicate: F) -> Result<Vec<Filtered>>
where
    F: Fn(&Record) -> bool,
{
    let mut found = VecDeque::new();
    if wanted == Some(0) {
        return Ok(Vec::new());
    }
    let page_size = cache.page_size();
    let mut start = index / page_size * page_size;
    loop {
        let records = cache.read_range(start, page_size)?.await?;
        for (offset, item) in records.into_iter().enumerate().rev() {
            let at = start + offset as u64;
            if at <= index && predicate(&item) {
                found.push_front(Filtered { index: at, item });
                if wanted == Some(found.len()) {
                    return Ok(found.into());
                }
            }
        }
        if start == 0 {
            return Ok(found.into());
        }
        start -= page_size;
    }
}

async fn next_page(cache: Cache, start: Option<u64>) -> Result<Option<(Vec<Record>, Option<u64>)>> {
    let Some(start) = start else {
        return Ok(None);
    };
    let page_size = cache.page_size();
    let records = cache.read_range(start, page_size)?.await?;
    let next = (records.len() as u64 == page_size).then_some(start + page_size);
    Ok(Some((records, next)))
}

/// A pending [Cache::read_range].
///
/// Dropping it before it completes cancels the read.
pub struct ReadRange {
    core: Arc<Core>,
    id: OpId,
    rx: oneshot::Receiver<Result<Vec<Record>>>,
    settled: bool,
}

impl ReadRange {
    /// Cancel the read. It then fails with [Error::Canceled] unless it has
    /// already settled.
    pub fn cancel(&self) {
        self.core.with_engine(|engine| engine.cancel(self.id));
    }
}

impl Future for ReadRange {
    type Output = Result<Vec<Record>>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let result = ready!(self.rx.poll_unpin(cx));
        self.settled = true;
        Poll::Ready(result.unwrap_or(Err(Error::Canceled)))
    }
}

impl Drop for ReadRange {
    fn drop(&mut self) {
        if !self.settled {
            self.cancel();
        }
    }
}

impl fmt::Debug for ReadRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReadRange")
            .field("id", &self.id)
            .field("settled", &self.settled)
            .finish()
    }
}

/// A pending [Cache::clear]. Clones resolve together.
#[derive(Clone)]
pub struct Clearing {
    inner: Shared<BoxFuture<'static, Result<()>>>,
}

impl Clearing {
    pub(crate) fn new(rx: oneshot::Receiver<Result<()>>) -> Self {
        let inner = rx
            .map(|cleared| cleared.unwrap_or(Err(Error::Canceled)))
            .boxed()
            .shared();
        Self { inner }
    }
}

impl Future for Clearing {
    type Output = Result<()>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.inner.poll_unpin(cx)
    }
}

impl fmt::Debug for Clearing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Clearing").finish_non_exhaustive()
    }
}

/// A background request such as [Cache::count] or a filter scan.
#[derive(Debug)]
pub struct Request<T> {
    task: JoinHandle<Result<T>>,
}

impl<T> Request<T> {
    /// Abort the request, including any read it is waiting on.
    pub fn cancel(&self) {
        self.task.abort();
    }
}

impl<T> Future for Request<T> {
    type Output = Result<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Poll::Ready(match ready!(self.task.poll_unpin(cx)) {
            Ok(result) => result,
            Err(e) if e.is_cancelled() => Err(Error::Canceled),
            Err(e) => Err(Error::Task(e.to_string())),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::testing::VecSource;

    #[tokio::test]
    async fn test_build_validates_options() {
        let source = Arc::new(VecSource::numbered("numbers", 5));
        let err = Cache::builder("", source.clone()).build().unwrap_err();
        assert!(matches!(err, Error::InvalidArgument { name: "name", .. }));

        let err = Cache::builder("numbers", source).page_size(0).build().unwrap_err();
        assert!(matches!(err, Error::InvalidArgument { name: "pageSize", .. }));
    }

    #[test]
    fn test_outside_runtime() {
        let source = Arc::new(VecSource::numbered("numbers", 5));
        let err = Cache::builder("numbers", source).build().unwrap_err();
        assert!(matches!(err, Error::Runtime(_)));
    }

    #[tokio::test]
    async fn test_read_range_rejects_overflowing_range() {
        let source = Arc::new(VecSource::numbered("numbers", 5));
        let cache = Cache::builder("numbers", source).build().unwrap();
        for (index, count) in [(u64::MAX, 2), (u64::MAX, 0), (u64::MAX - 60, 20)] {
            let err = cache.read_range(index, count).unwrap_err();
            assert!(matches!(err, Error::InvalidArgument { name: "count", .. }));
        }
        assert_eq!(cache.pending_operations(), 0);
    }

    #[tokio::test]
    async fn test_dropped_read_is_canceled() {
        let source = Arc::new(VecSource::numbered("numbers", 5));
        let cache = Cache::builder("numbers", source).build().unwrap();
        let read = cache.read_range(0, 5).unwrap();
        assert_eq!(cache.pending_operations(), 1);
        drop(read);
        assert_eq!(cache.pending_operations(), 0);
    }

    #[tokio::test]
    async fn test_request_cancel() {
        let gate = Arc::new(tokio::sync::Semaphore::new(0));
        let source = Arc::new(VecSource::numbered("numbers", 5).with_gate(gate));
        let cache = Cache::builder("numbers", source).build().unwrap();
        let count = cache.count().unwrap();
        count.cancel();
        assert!(count.await.unwrap_err().is_canceled());
    }
}
