//! Per-kind state machines: destroy (clear), read, prefetch, and the
//! local/source/save page steps shared by reads and prefetches.
//!
//! Each machine first settles who owns the cache mode. Clear takes
//! [Mode::Destroy] unconditionally, reads take [Mode::Read] from an idle or
//! prefetching cache, and a prefetch only runs from an idle cache. An
//! operation that does not hold the mode it needs leaves its state untouched
//! and resumes from it on a later broadcast.

use std::sync::Arc;

use log::debug;

use super::{clear_store, fetch_page, read_page, save_page, Engine};
use crate::{
    operation::{Fetch, Mode, OpId, Operation, State},
    paging::Page,
    range::snap_to_page_boundaries,
};

impl Engine {
    /// Returns true if the operation was canceled; aborts its request on [State::Cancel].
    fn canceling(&mut self, id: OpId, state: &State) -> bool {
        let Some(op) = self.ops.get_mut(&id) else {
            return true;
        };
        let canceled = op.canceled && !matches!(state, State::End);
        if canceled && matches!(state, State::Cancel) {
            op.abort_request();
        }
        canceled
    }

    pub(super) fn destroy_machine(&mut self, id: OpId, state: State, mode: Mode) {
        if mode != Mode::Destroy && !state.is_terminal() {
            // the broadcast re-enters this operation under Destroy
            self.change_state(Mode::Destroy);
            return;
        }
        match state {
            State::Start => self.transition(id, State::Clear),
            State::Clear => {
                debug!("clearing cache store");
                if let Some(request) = self.spawn(id, clear_store) {
                    self.wait(id, request);
                }
            }
            State::Wait | State::Cancel | State::Error(_) | State::End => {}
            State::Fetch(_) => unreachable!("clear operation {id} cannot fetch pages"),
        }
    }

    pub(super) fn read_machine(&mut self, id: OpId, state: State, mode: Mode) {
        if self.canceling(id, &state) {
            return;
        }

        if mode != Mode::Read && !matches!(state, State::Start) && !state.is_terminal() {
            match mode {
                Mode::Destroy | Mode::Init => self.cancel(id),
                Mode::Idle | Mode::Prefetch => self.change_state(Mode::Read),
                // a page is being saved; resume once the writer is done
                Mode::Write | Mode::Read => {}
            }
            return;
        }

        match state {
            State::Start => {
                if !matches!(mode, Mode::Idle | Mode::Prefetch) {
                    return;
                }
                self.change_state(Mode::Read);
                let Some(op) = self.ops.get(&id) else {
                    return;
                };
                let first = snap_to_page_boundaries(op.index, op.index, self.page_size);
                self.transition(id, State::Fetch(Fetch::Local(first.index)));
            }
            State::Fetch(Fetch::Done(page)) => self.read_done(id, &page),
            State::Fetch(step) => self.fetch_step(id, step, mode),
            State::Wait | State::Cancel | State::Error(_) | State::End => {}
            State::Clear => unreachable!("read operation {id} cannot clear the store"),
        }
    }

    fn read_done(&mut self, id: OpId, page: &Page) {
        let page_size = self.page_size;
        let Some(op) = self.ops.get_mut(&id) else {
            return;
        };
        op.append_page(page);
        let satisfied = op.data.len() as u64 == op.count;
        if satisfied || page.count < page_size {
            self.prefetch(page.index + page.count);
            self.complete(id);
        } else {
            self.transition(id, State::Fetch(Fetch::Local(page.index + page_size)));
        }
    }

    /// Queue a speculative read of the pages following `start`.
    fn prefetch(&mut self, start: u64) {
        if self.ledger.all_data_local || self.prefetch_size == 0 || self.overflowed {
            return;
        }
        debug_assert_eq!(self.mode, Mode::Read, "prefetch requested outside a read");
        let start = snap_to_page_boundaries(start, start, self.page_size).index;
        let queued = self
            .prefetch_ops
            .iter()
            .any(|id| self.ops.get(id).is_some_and(|op| op.index == start));
        if !queued {
            self.enqueue(Operation::prefetch(start, self.prefetch_size));
        }
    }

    pub(super) fn prefetch_machine(&mut self, id: OpId, state: State, mode: Mode) {
        if self.canceling(id, &state) {
            return;
        }

        if mode != Mode::Prefetch && !state.is_terminal() {
            match mode {
                Mode::Destroy => self.cancel(id),
                Mode::Idle => self.change_state(Mode::Prefetch),
                // yield to reads and writers without giving up progress
                Mode::Init | Mode::Read | Mode::Write | Mode::Prefetch => {}
            }
            return;
        }

        match state {
            State::Start => {
                if self.prefetch_ops.first() != Some(&id) {
                    return;
                }
                let Some(op) = self.ops.get(&id) else {
                    return;
                };
                let index = op.index;
                self.transition(id, State::Fetch(Fetch::Local(index)));
            }
            State::Fetch(Fetch::Done(page)) => self.prefetch_done(id, &page),
            State::Fetch(step) => self.fetch_step(id, step, mode),
            State::Wait | State::Cancel | State::Error(_) | State::End => {}
            State::Clear => unreachable!("prefetch operation {id} cannot clear the store"),
        }
    }

    fn prefetch_done(&mut self, id: OpId, page: &Page) {
        let page_size = self.page_size;
        let finished = self.ledger.all_data_local || self.overflowed;
        let Some(op) = self.ops.get_mut(&id) else {
            return;
        };
        let pending = op.pending - op.pending.min(page.count);
        let next = page.index.checked_add(page_size);
        match next {
            Some(next) if !finished && pending > 0 && page.count == page_size => {
                op.pending = pending;
                self.transition(id, State::Fetch(Fetch::Local(next)));
            }
            _ => self.complete(id),
        }
    }

    /// The local, source and save steps. [Fetch::Done] is handled per kind.
    fn fetch_step(&mut self, id: OpId, step: Fetch, mode: Mode) {
        let request = match step {
            Fetch::Local(index) => self.spawn(id, move |core| read_page(core, index)),
            Fetch::Source(index) => {
                let count = self.page_size;
                self.spawn(id, move |core| fetch_page(core, index, count))
            }
            Fetch::Save(page) => {
                debug_assert_ne!(mode, Mode::Write, "operation {id} saving under Write");
                if page.count > 0 && self.overflows(&page) {
                    // serve the page without keeping it
                    self.transition(id, State::Fetch(Fetch::Done(page)));
                    return;
                }
                self.writer = Some(id);
                self.change_state(Mode::Write);
                self.spawn(id, move |core| save_page(core, id, page))
            }
            Fetch::Done(_) => unreachable!("operation {id} handles its own pages"),
        };
        if let Some(request) = request {
            self.wait(id, request);
        }
    }

    /// Trips the sticky overflow flag if `page` does not fit the budget.
    fn overflows(&mut self, page: &Arc<Page>) -> bool {
        if !self.overflowed
            && self
                .ledger
                .would_overflow(self.cache_size, page.estimated_size())
        {
            debug!(
                "cache overflowed at page {}: {} of {} bytes used",
                page.index, self.ledger.actual_cache_size, self.cache_size
            );
            self.overflowed = true;
        }
        self.overflowed
    }
}
