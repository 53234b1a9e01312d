//! A single pending request against the cache.
//!
//! An [Operation] is created in [State::Start] by the façade, queued, and from
//! then on only moves through [Engine](crate::engine::Engine) transitions. It
//! carries the records gathered so far and the channel its caller waits on.

use std::mem;
use std::sync::Arc;

use tokio::{sync::oneshot, task::AbortHandle};

use crate::{
    paging::{Page, Record},
    range::{intersect, Range},
    Error, Result,
};

pub(crate) type OpId = u64;

/// Cache-wide activity selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Mode {
    /// Settings are still being loaded.
    Init,
    Idle,
    Read,
    Prefetch,
    /// A page and the ledger are being persisted.
    Write,
    /// A clear is wiping the store.
    Destroy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Kind {
    Read,
    Prefetch,
    Clear,
}

/// Page-level steps shared by reads and prefetches.
#[derive(Debug, Clone)]
pub(crate) enum Fetch {
    /// Look the page starting at this index up in the store.
    Local(u64),
    /// Fetch the page starting at this index from the source.
    Source(u64),
    Save(Arc<Page>),
    /// A page is available; fold it into the operation.
    Done(Arc<Page>),
}

#[derive(Debug, Clone)]
pub(crate) enum State {
    Start,
    /// An async request is outstanding.
    Wait,
    Cancel,
    Error(Error),
    End,
    Fetch(Fetch),
    /// Wiping the store.
    Clear,
}

impl State {
    pub(crate) fn is_terminal(&self) -> bool {
        matches!(self, Self::Cancel | Self::Error(_) | Self::End)
    }
}

/// Where the outcome of an operation is delivered.
#[derive(Debug)]
pub(crate) enum Reply {
    Detached,
    Records(oneshot::Sender<Result<Vec<Record>>>),
    Cleared(oneshot::Sender<Result<()>>),
}

#[derive(Debug)]
pub(crate) struct Operation {
    pub kind: Kind,
    pub state: State,
    /// Last mode broadcast to this operation.
    pub mode: Mode,
    pub index: u64,
    pub count: u64,
    pub data: Vec<Record>,
    /// Records a prefetch still wants.
    pub pending: u64,
    pub canceled: bool,
    cancelable: bool,
    request: Option<AbortHandle>,
    reply: Reply,
}

impl Operation {
    pub fn read(index: u64, count: u64, reply: oneshot::Sender<Result<Vec<Record>>>) -> Self {
        Self::new(Kind::Read, index, count, 0, true, Reply::Records(reply))
    }

    pub fn prefetch(index: u64, count: u64) -> Self {
        Self::new(Kind::Prefetch, index, count, count, true, Reply::Detached)
    }

    pub fn clear(reply: oneshot::Sender<Result<()>>) -> Self {
        Self::new(Kind::Clear, 0, 0, 0, false, Reply::Cleared(reply))
    }

    fn new(kind: Kind, index: u64, count: u64, pending: u64, cancelable: bool, reply: Reply) -> Self {
        Self {
            kind,
            state: State::Start,
            mode: Mode::Init,
            index,
            count,
            data: Vec::new(),
            pending,
            canceled: false,
            cancelable,
            request: None,
            reply,
        }
    }

    pub fn range(&self) -> Range {
        Range::new(self.index, self.count)
    }

    /// Whether [Engine::cancel](crate::engine::Engine) may move this operation to [State::Cancel].
    pub fn can_cancel(&self) -> bool {
        self.cancelable && !self.state.is_terminal()
    }

    /// Remember the handle of the request the operation now waits on.
    pub fn set_request(&mut self, request: AbortHandle) {
        self.request = Some(request);
    }

    /// Forget a request that has completed.
    pub fn finish_request(&mut self) {
        self.request = None;
    }

    pub fn abort_request(&mut self) {
        if let Some(request) = self.request.take() {
            request.abort();
        }
    }

    /// Append the part of `page` that falls inside the requested range.
    pub fn append_page(&mut self, page: &Page) {
        let Some(overlap) = intersect(self.range(), page.range()) else {
            return;
        };
        let remaining = self.count.saturating_sub(self.data.len() as u64);
        let start = (overlap.index - page.index) as usize;
        let end = start + remaining.min(overlap.count) as usize;
        let end = end.min(page.data.len());
        if start < end {
            self.data.extend_from_slice(&page.data[start..end]);
        }
    }

    /// Settle successfully. Later calls are no-ops.
    pub fn fire_resolved(&mut self) {
        match mem::replace(&mut self.reply, Reply::Detached) {
            Reply::Records(tx) => {
                let _ = tx.send(Ok(mem::take(&mut self.data)));
            }
            Reply::Cleared(tx) => {
                let _ = tx.send(Ok(()));
            }
            Reply::Detached => {}
        }
    }

    /// Settle with an error. Later calls are no-ops.
    pub fn fire_rejected(&mut self, err: Error) {
        match mem::replace(&mut self.reply, Reply::Detached) {
            Reply::Records(tx) => {
                let _ = tx.send(Err(err));
            }
            Reply::Cleared(tx) => {
                let _ = tx.send(Err(err));
            }
            Reply::Detached => {}
        }
    }

    pub fn fire_canceled(&mut self) {
        self.fire_rejected(Error::Canceled);
    }
}
