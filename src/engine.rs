//! The cache mode machine.
//!
//! One [Engine] per cache owns the current [Mode], the clear/read/prefetch
//! queues and the [Ledger]. It runs behind the cache's mutex; every step below
//! is synchronous, and store or source I/O is spawned onto the runtime with its
//! result fed back through [Engine::deliver].
//!
//! Mode changes go through [Engine::change_state] only, which updates the mode
//! and re-runs every queued operation (clear, then read, then prefetch) before
//! returning, so no waiting operation misses a change.

use std::collections::HashMap;
use std::future::Future;
use std::mem;
use std::sync::{Arc, Weak};

use bytes::Bytes;
use log::{debug, error, trace, warn};
use serde_json::Value;
use tokio::{sync::oneshot, task::AbortHandle};

use crate::{
    cache::{Clearing, Core},
    ledger::{is_supported_version, Ledger},
    operation::{Fetch, Kind, Mode, OpId, Operation, State},
    paging::{page_key, Page, Record},
    store::SETTINGS_KEY,
    Error, Result,
};

mod machines;

/// Callback fired whenever the last pending operation drains.
pub type IdleCallback = Arc<dyn Fn() + Send + Sync>;

/// Counters describing how requests were served.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Stats {
    /// Successful `count()` calls answered by the source.
    pub counts: u64,
    /// Pages fetched from the source on behalf of reads.
    pub net_reads: u64,
    /// Pages fetched from the source on behalf of prefetches.
    pub prefetches: u64,
    /// Pages served to reads from the local store.
    pub cache_reads: u64,
}

/// Result of an async request issued by an operation.
#[derive(Debug)]
pub(crate) enum Completion {
    Local { index: u64, page: Result<Option<Page>> },
    Fetched(Result<Page>),
    Saved { page: Arc<Page>, saved: bool },
    Cleared(Result<()>),
}

pub(crate) struct EngineConfig {
    pub page_size: u64,
    pub prefetch_size: u64,
    /// Byte budget for saved pages.
    pub cache_size: u64,
    pub source_id: String,
    pub on_idle: Option<IdleCallback>,
}

pub(crate) struct Engine {
    core: Weak<Core>,
    mode: Mode,

    clear_ops: Vec<OpId>,
    read_ops: Vec<OpId>,
    prefetch_ops: Vec<OpId>,
    ops: HashMap<OpId, Operation>,
    next_id: OpId,
    pending_operations: usize,
    /// Operation holding [Mode::Write].
    writer: Option<OpId>,
    clearing: Option<Clearing>,

    page_size: u64,
    prefetch_size: u64,
    cache_size: u64,
    ledger: Ledger,
    overflowed: bool,
    stats: Stats,
    failure: Option<Error>,

    on_idle: Option<IdleCallback>,
    idle_due: bool,
}

impl Engine {
    pub fn new(core: Weak<Core>, config: EngineConfig) -> Self {
        Self {
            core,
            mode: Mode::Init,
            clear_ops: Vec::new(),
            read_ops: Vec::new(),
            prefetch_ops: Vec::new(),
            ops: HashMap::new(),
            next_id: 0,
            pending_operations: 0,
            writer: None,
            clearing: None,
            page_size: config.page_size,
            prefetch_size: config.prefetch_size,
            cache_size: config.cache_size,
            ledger: Ledger::new(config.page_size, config.source_id),
            overflowed: config.cache_size == 0,
            stats: Stats::default(),
            failure: None,
            on_idle: config.on_idle,
            idle_due: false,
        }
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn stats(&self) -> Stats {
        self.stats
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    pub fn pending_operations(&self) -> usize {
        self.pending_operations
    }

    pub fn set_on_idle(&mut self, on_idle: Option<IdleCallback>) {
        self.on_idle = on_idle;
    }

    /// Fails with the stored error once the cache is unusable.
    pub fn check(&self) -> Result<()> {
        match &self.failure {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    /// Collection size, if every record is known to be local.
    pub fn local_count(&self) -> Option<u64> {
        if self.ledger.all_data_local {
            self.ledger.collection_count
        } else {
            None
        }
    }

    pub fn record_count(&mut self) {
        self.stats.counts += 1;
    }

    /// Queue a read of `count` records starting at `index`.
    pub fn read(&mut self, index: u64, count: u64) -> (OpId, oneshot::Receiver<Result<Vec<Record>>>) {
        let (tx, rx) = oneshot::channel();
        let id = self.enqueue(Operation::read(index, count, tx));
        (id, rx)
    }

    /// Queue a clear, or join the one already pending.
    pub fn clear(&mut self) -> Clearing {
        if let Some(clearing) = &self.clearing {
            return clearing.clone();
        }
        let (tx, rx) = oneshot::channel();
        let clearing = Clearing::new(rx);
        self.clearing = Some(clearing.clone());
        self.enqueue(Operation::clear(tx));
        clearing
    }

    /// Returns the idle callback if the queues drained since the last call.
    pub fn take_idle(&mut self) -> Option<IdleCallback> {
        if mem::take(&mut self.idle_due) {
            self.on_idle.clone()
        } else {
            None
        }
    }

    fn enqueue(&mut self, op: Operation) -> OpId {
        let id = self.next_id;
        self.next_id += 1;
        match op.kind {
            Kind::Clear => self.clear_ops.push(id),
            Kind::Read => self.read_ops.push(id),
            Kind::Prefetch => self.prefetch_ops.push(id),
        }
        trace!("queue {:?} operation {id} at {}+{}", op.kind, op.index, op.count);
        self.ops.insert(id, op);
        self.pending_operations += 1;
        let mode = self.mode;
        self.run(id, mode);
        id
    }

    /// Remove a finished operation and hand the mode back.
    fn dequeue(&mut self, id: OpId) -> Option<Operation> {
        let op = self.ops.remove(&id)?;
        self.clear_ops.retain(|&queued| queued != id);
        self.read_ops.retain(|&queued| queued != id);
        self.prefetch_ops.retain(|&queued| queued != id);
        self.pending_operations = self.pending_operations.saturating_sub(1);
        if op.kind == Kind::Clear && self.clear_ops.is_empty() {
            self.clearing = None;
        }
        if self.writer == Some(id) {
            self.writer = None;
        }

        let release = match self.mode {
            Mode::Init => false,
            Mode::Destroy => self.clear_ops.is_empty(),
            Mode::Write => self.writer.is_none(),
            Mode::Idle | Mode::Read | Mode::Prefetch => true,
        };
        if release {
            self.change_state(Mode::Idle);
        }
        Some(op)
    }

    /// Set the cache mode and broadcast it to every queued operation.
    pub(crate) fn change_state(&mut self, mode: Mode) {
        if self.mode == mode {
            return;
        }
        debug!("cache mode {:?} -> {:?}", self.mode, mode);
        self.mode = mode;
        let queued: Vec<OpId> = self
            .clear_ops
            .iter()
            .chain(&self.read_ops)
            .chain(&self.prefetch_ops)
            .copied()
            .collect();
        for id in queued {
            // nested broadcasts may have moved the mode on already
            let mode = self.mode;
            self.run(id, mode);
        }
    }

    /// Re-enter the operation's current state under `mode`.
    fn run(&mut self, id: OpId, mode: Mode) {
        let Some(op) = self.ops.get_mut(&id) else {
            return;
        };
        if op.state.is_terminal() {
            return;
        }
        op.mode = mode;
        let state = op.state.clone();
        self.transition(id, state);
    }

    pub(crate) fn transition(&mut self, id: OpId, state: State) {
        let Some(op) = self.ops.get_mut(&id) else {
            return;
        };
        if !matches!(state, State::Wait | State::Cancel) {
            op.finish_request();
        }
        op.state = state.clone();
        let mode = op.mode;
        trace!("operation {id} -> {} under {mode:?}", label(&state));
        self.operation_machine(id, state, mode);
    }

    /// Lifecycle shared by every kind of operation.
    fn operation_machine(&mut self, id: OpId, state: State, mode: Mode) {
        match state {
            State::Start => {
                // nothing runs until the settings are loaded
                if mode != Mode::Init {
                    self.kind_machine(id, State::Start, mode);
                }
            }
            State::Cancel => {
                self.kind_machine(id, State::Cancel, mode);
                if let Some(op) = self.ops.get_mut(&id) {
                    op.fire_canceled();
                }
                self.transition(id, State::End);
            }
            State::Error(err) => {
                self.kind_machine(id, State::Error(err.clone()), mode);
                if let Some(op) = self.ops.get_mut(&id) {
                    op.canceled = true;
                    op.fire_rejected(err);
                }
                self.transition(id, State::End);
            }
            State::End => {
                let Some(mut op) = self.dequeue(id) else {
                    return;
                };
                if !op.canceled {
                    op.fire_resolved();
                }
                if self.pending_operations == 0 {
                    self.idle_due = true;
                }
            }
            other => self.kind_machine(id, other, mode),
        }
    }

    fn kind_machine(&mut self, id: OpId, state: State, mode: Mode) {
        let Some(kind) = self.ops.get(&id).map(|op| op.kind) else {
            return;
        };
        match kind {
            Kind::Read => self.read_machine(id, state, mode),
            Kind::Prefetch => self.prefetch_machine(id, state, mode),
            Kind::Clear => self.destroy_machine(id, state, mode),
        }
    }

    /// Cancel a cancelable operation that has not settled yet.
    pub fn cancel(&mut self, id: OpId) {
        let Some(op) = self.ops.get_mut(&id) else {
            return;
        };
        if !op.can_cancel() {
            return;
        }
        op.canceled = true;
        self.transition(id, State::Cancel);
    }

    fn complete(&mut self, id: OpId) {
        debug_assert!(
            self.ops.get(&id).is_some_and(|op| !matches!(op.state, State::End)),
            "operation {id} completed twice"
        );
        self.transition(id, State::End);
    }

    fn error(&mut self, id: OpId, err: Error) {
        if self.ops.get(&id).is_some_and(|op| !op.canceled) {
            self.transition(id, State::Error(err));
        }
    }

    /// Park the operation on an outstanding request.
    fn wait(&mut self, id: OpId, request: AbortHandle) {
        let Some(op) = self.ops.get_mut(&id) else {
            request.abort();
            return;
        };
        if op.canceled {
            request.abort();
            return;
        }
        op.set_request(request);
        self.transition(id, State::Wait);
    }

    /// Feed the result of a spawned request back into its operation.
    pub fn deliver(&mut self, id: OpId, completion: Completion) {
        let Some(op) = self.ops.get_mut(&id) else {
            trace!("dropping late result for operation {id}");
            return;
        };
        if op.canceled || !matches!(op.state, State::Wait) {
            return;
        }
        op.finish_request();
        let kind = op.kind;
        match completion {
            Completion::Local {
                page: Ok(Some(page)),
                ..
            } => {
                if kind == Kind::Read {
                    self.stats.cache_reads += 1;
                }
                self.transition(id, State::Fetch(Fetch::Done(Arc::new(page))));
            }
            Completion::Local {
                index,
                page: Ok(None),
            } => {
                self.transition(id, State::Fetch(Fetch::Source(index)));
            }
            Completion::Local { page: Err(err), .. } => self.error(id, err),
            Completion::Fetched(Ok(page)) => {
                match kind {
                    Kind::Prefetch => self.stats.prefetches += 1,
                    _ => self.stats.net_reads += 1,
                }
                self.transition(id, State::Fetch(Fetch::Save(Arc::new(page))));
            }
            Completion::Fetched(Err(err)) => self.error(id, err),
            Completion::Saved { page, saved } => {
                if !saved && kind == Kind::Prefetch {
                    op.pending = 0;
                }
                self.transition(id, State::Fetch(Fetch::Done(page)));
                if self.writer == Some(id) {
                    self.writer = None;
                    self.change_state(Mode::Idle);
                }
            }
            Completion::Cleared(Ok(())) => self.complete(id),
            Completion::Cleared(Err(err)) => self.error(id, err),
        }
    }

    /// Spawn `request` and route its completion to operation `id`.
    ///
    /// Rejects the operation if the cache is already gone.
    fn spawn<F, Fut>(&mut self, id: OpId, request: F) -> Option<AbortHandle>
    where
        F: FnOnce(Arc<Core>) -> Fut,
        Fut: Future<Output = Completion> + Send + 'static,
    {
        let Some(core) = self.core.upgrade() else {
            error!("cache dropped while operation {id} was running");
            self.error(id, Error::Task("cache dropped".to_owned()));
            return None;
        };
        let request = request(Arc::clone(&core));
        let task = core.runtime.clone().spawn(async move {
            let completion = request.await;
            core.with_engine(|engine| engine.deliver(id, completion));
        });
        Some(task.abort_handle())
    }

    /// Account for a page persisted by operation `id` and return the ledger
    /// bytes to write next.
    fn commit_page(&mut self, id: OpId, page: &Page, page_bytes: u64) -> Result<Bytes> {
        if !self.ops.get(&id).is_some_and(|op| !op.canceled) {
            return Err(Error::Canceled);
        }
        self.ledger.record_page(page.index, page.count, page_bytes);
        self.ledger.encode()
    }

    /// Forget every saved page. Runs while a clear holds [Mode::Destroy].
    fn reset(&mut self) -> Result<Bytes> {
        debug_assert!(matches!(self.mode, Mode::Destroy));
        self.ledger.reset();
        self.overflowed = self.cache_size == 0;
        self.stats = Stats::default();
        self.ledger.encode()
    }

    /// Settings loaded (or failed to load): open the cache for business.
    pub fn initialized(&mut self, outcome: Result<Ledger>) {
        match outcome {
            Ok(ledger) => {
                debug!(
                    "cache initialized: {} bytes cached, collection count {:?}",
                    ledger.actual_cache_size, ledger.collection_count
                );
                self.ledger = ledger;
                self.change_state(Mode::Idle);
            }
            Err(err) => self.fail(err),
        }
    }

    /// Enter the permanent failure state.
    fn fail(&mut self, err: Error) {
        error!("cache failed: {err}");
        debug_assert!(self.prefetch_ops.is_empty(), "prefetch queued before init");
        for (_, mut op) in self.ops.drain() {
            op.abort_request();
            op.fire_rejected(err.clone());
        }
        self.clear_ops.clear();
        self.read_ops.clear();
        self.prefetch_ops.clear();
        self.pending_operations = 0;
        self.writer = None;
        self.clearing = None;
        self.failure = Some(err);
    }
}

fn label(state: &State) -> String {
    match state {
        State::Fetch(Fetch::Local(index)) => format!("local({index})"),
        State::Fetch(Fetch::Source(index)) => format!("source({index})"),
        State::Fetch(Fetch::Save(page)) => format!("save({}+{})", page.index, page.count),
        State::Fetch(Fetch::Done(page)) => format!("done({}+{})", page.index, page.count),
        State::Error(err) => format!("error({err})"),
        other => format!("{other:?}").to_lowercase(),
    }
}

/// Load the ledger, invalidating the store if it belongs to another shape or source.
pub(crate) async fn initialize(core: Arc<Core>) {
    let outcome = load_ledger(&core).await;
    core.with_engine(|engine| engine.initialized(outcome));
}

async fn load_ledger(core: &Core) -> Result<Ledger> {
    let page_size = core.page_size;
    let source_id = core.source.identifier().to_owned();
    let unreadable = |err| Error::failure("Unable to read settings from store.", Some(err));

    let stored = core.store.read(SETTINGS_KEY).await.map_err(unreadable)?;
    if let Some(bytes) = stored {
        let value: Value = serde_json::from_slice(&bytes)
            .map_err(Error::from)
            .map_err(unreadable)?;
        let version = value.get("version").and_then(Value::as_str).unwrap_or_default();
        if !is_supported_version(version) {
            return Err(Error::failure(
                format!("Unsupported cache store version {version}"),
                None,
            ));
        }
        let ledger: Ledger = serde_json::from_value(value)
            .map_err(Error::from)
            .map_err(unreadable)?;
        if ledger.matches(page_size, &source_id) {
            return Ok(ledger);
        }
        debug!("page size or source changed, invalidating store");
        core.store.clear().await.map_err(|err| {
            Error::failure("Unable to clear store during initialization", Some(err))
        })?;
    }

    let ledger = Ledger::new(page_size, source_id);
    let write = async { core.store.add_or_update(SETTINGS_KEY, ledger.encode()?).await };
    write.await.map_err(|err| {
        Error::failure("Unable to write settings during initialization.", Some(err))
    })?;
    Ok(ledger)
}

async fn read_page(core: Arc<Core>, index: u64) -> Completion {
    let key = page_key(index);
    let page: Result<Option<Page>> = async {
        if !core.store.contains(&key).await? {
            return Ok(None);
        }
        match core.store.read(&key).await? {
            Some(bytes) => Page::decode(&bytes).map(Some),
            None => Ok(None),
        }
    }
    .await;
    if let Err(err) = &page {
        warn!("reading page {key} from store failed: {err}");
    }
    Completion::Local { index, page }
}

async fn fetch_page(core: Arc<Core>, index: u64, count: u64) -> Completion {
    let page = core.source.read(index, count).await.map(|mut data| {
        data.truncate(count as usize);
        Page::new(index, data)
    });
    Completion::Fetched(page)
}

async fn save_page(core: Arc<Core>, id: OpId, page: Arc<Page>) -> Completion {
    let saved: Result<()> = async {
        let page_bytes = if page.count > 0 {
            core.store
                .add_or_update(&page_key(page.index), page.encode()?)
                .await?;
            page.estimated_size()
        } else {
            0
        };
        let settings = core.with_engine(|engine| engine.commit_page(id, &page, page_bytes))?;
        core.store.add_or_update(SETTINGS_KEY, settings).await
    }
    .await;
    if let Err(err) = &saved {
        warn!("page {} not saved: {err}", page.index);
    }
    Completion::Saved {
        page,
        saved: saved.is_ok(),
    }
}

async fn clear_store(core: Arc<Core>) -> Completion {
    let cleared: Result<()> = async {
        core.store.clear().await?;
        let settings = core.with_engine(Engine::reset)?;
        core.store.add_or_update(SETTINGS_KEY, settings).await
    }
    .await;
    Completion::Cleared(cleared)
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::{AtomicUsize, Ordering};

    fn engine(on_idle: Option<IdleCallback>) -> Engine {
        Engine::new(
            Weak::new(),
            EngineConfig {
                page_size: 10,
                prefetch_size: 10,
                cache_size: 1024,
                source_id: "numbers".to_owned(),
                on_idle,
            },
        )
    }

    #[test]
    fn test_operations_wait_for_init() {
        let mut engine = engine(None);
        let (_, mut rx) = engine.read(0, 10);
        assert_eq!(engine.mode(), Mode::Init);
        assert_eq!(engine.pending_operations(), 1);
        assert!(rx.try_recv().is_err());
        engine.check().unwrap();
    }

    #[tokio::test]
    async fn test_cancel_before_init() {
        let idle = Arc::new(AtomicUsize::new(0));
        let mut engine = engine(Some({
            let idle = idle.clone();
            Arc::new(move || {
                idle.fetch_add(1, Ordering::SeqCst);
            })
        }));
        let (id, rx) = engine.read(0, 10);
        engine.cancel(id);
        engine.cancel(id);
        assert_eq!(engine.pending_operations(), 0);
        assert!(rx.await.unwrap().unwrap_err().is_canceled());

        engine.take_idle().unwrap()();
        assert!(engine.take_idle().is_none());
        assert_eq!(idle.load(Ordering::SeqCst), 1);
        assert_eq!(engine.mode(), Mode::Init);
    }

    #[tokio::test]
    async fn test_clear_is_shared() {
        let mut engine = engine(None);
        let first = engine.clear();
        let second = engine.clear();
        assert_eq!(engine.pending_operations(), 1);

        engine.initialized(Err(Error::failure("Unable to read settings from store.", None)));
        for clearing in [first, second] {
            let err = clearing.await.unwrap_err();
            assert_eq!(err.to_string(), "Unable to read settings from store.");
        }
    }

    #[tokio::test]
    async fn test_failed_init_rejects_queued_reads() {
        let mut engine = engine(None);
        let (_, rx) = engine.read(0, 10);
        engine.initialized(Err(Error::failure("Unsupported cache store version 9.1", None)));

        assert!(matches!(rx.await.unwrap(), Err(Error::CacheFailure { .. })));
        assert!(matches!(engine.check(), Err(Error::CacheFailure { .. })));
        assert_eq!(engine.pending_operations(), 0);
    }

    #[test]
    fn test_late_completion_is_dropped() {
        let mut engine = engine(None);
        engine.initialized(Ok(Ledger::new(10, "numbers")));
        assert_eq!(engine.mode(), Mode::Idle);
        engine.deliver(42, Completion::Cleared(Ok(())));
        engine.deliver(
            7,
            Completion::Fetched(Ok(Page::new(0, vec![serde_json::json!(0)]))),
        );
        assert_eq!(engine.stats(), Stats::default());
        assert_eq!(engine.mode(), Mode::Idle);
    }

    #[tokio::test]
    async fn test_read_rejected_once_cache_is_gone() {
        let mut engine = engine(None);
        engine.initialized(Ok(Ledger::new(10, "numbers")));
        let (_, rx) = engine.read(0, 10);
        assert!(matches!(rx.await.unwrap(), Err(Error::Task(_))));
        assert_eq!(engine.pending_operations(), 0);
        assert_eq!(engine.mode(), Mode::Idle);
    }

    #[test]
    fn test_initialized_adopts_ledger() {
        let mut engine = engine(None);
        let mut ledger = Ledger::new(10, "numbers");
        ledger.record_page(0, 4, 64);
        engine.initialized(Ok(ledger));
        assert_eq!(engine.local_count(), Some(4));
        engine.record_count();
        assert_eq!(engine.stats().counts, 1);
    }
}
