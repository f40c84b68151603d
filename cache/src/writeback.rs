//! Track dirty blocks and schedule their flush.
//!
//! Every dirty release hands the [Writeback] policy one [AioContext]. The policy owes exactly one
//! write completion per context: the [crate::Cache] only releases the pin taken for the block once
//! that completion arrives.

use crate::{serializer::Serializer, AioContext, BlockId, Page};
use std::{
    collections::{HashMap, VecDeque},
    num::NonZeroUsize,
};
use tracing::{debug, trace};

/// Dirty tracking and flush scheduling.
pub trait Writeback<U> {
    /// Begin scheduling flushes on its own (as opposed to only on [Writeback::flush]).
    fn start(&mut self) {}

    /// Record that `page` (the contents of `block`) must be flushed, completing `ctx` once it has
    /// been written.
    ///
    /// Returns the id the block will be written to, which may differ from `block` if the policy
    /// relocates dirty blocks.
    fn mark_dirty<S: Serializer<U>>(
        &mut self,
        serializer: &mut S,
        block: BlockId,
        page: Page,
        ctx: AioContext<U>,
    ) -> BlockId;

    /// Issue writes for all recorded dirty blocks, returning the number issued.
    fn flush<S: Serializer<U>>(&mut self, serializer: &mut S) -> usize;

    /// Whether a recorded write to `location` (the id returned by [Writeback::mark_dirty]) has not
    /// been issued yet.
    fn is_dirty(&self, location: BlockId) -> bool;

    /// The number of recorded writes that have not been issued yet.
    fn len(&self) -> usize;

    /// Whether there are no unissued writes.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Where [Deferred] writes a dirty block.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Placement {
    /// Overwrite the block at its current id.
    InPlace,

    /// Write the block to a fresh id on every flush (copy-on-write).
    Relocate,
}

/// A dirty write waiting to be issued.
struct Pending<U> {
    location: BlockId,
    page: Page,
    ctx: AioContext<U>,
}

/// Queues one write per dirty release and issues them in order.
///
/// Once started, a flush is triggered as soon as `flush_threshold` writes are queued. Until then
/// (or if no threshold is set), writes are only issued by [Writeback::flush].
pub struct Deferred<U> {
    placement: Placement,
    flush_threshold: Option<NonZeroUsize>,
    started: bool,

    queue: VecDeque<Pending<U>>,

    /// The number of queued writes to each location.
    dirty: HashMap<BlockId, usize>,
}

impl<U> Deferred<U> {
    /// Create a new policy.
    pub fn new(placement: Placement, flush_threshold: Option<NonZeroUsize>) -> Self {
        Self {
            placement,
            flush_threshold,
            started: false,
            queue: VecDeque::new(),
            dirty: HashMap::new(),
        }
    }

    /// The placement used for dirty blocks.
    pub fn placement(&self) -> Placement {
        self.placement
    }
}

impl<U> Default for Deferred<U> {
    fn default() -> Self {
        Self::new(Placement::InPlace, None)
    }
}

impl<U> Writeback<U> for Deferred<U> {
    fn start(&mut self) {
        debug!(threshold = ?self.flush_threshold, "started write-back");
        self.started = true;
    }

    fn mark_dirty<S: Serializer<U>>(
        &mut self,
        serializer: &mut S,
        block: BlockId,
        page: Page,
        ctx: AioContext<U>,
    ) -> BlockId {
        let location = match self.placement {
            Placement::InPlace => block,
            Placement::Relocate => serializer.new_block_id(),
        };
        trace!(%block, %location, "marked dirty");
        *self.dirty.entry(location).or_default() += 1;
        self.queue.push_back(Pending {
            location,
            page,
            ctx,
        });

        if let Some(threshold) = self.flush_threshold {
            if self.started && self.queue.len() >= threshold.get() {
                self.flush(serializer);
            }
        }
        location
    }

    fn flush<S: Serializer<U>>(&mut self, serializer: &mut S) -> usize {
        let issued = self.queue.len();
        for pending in self.queue.drain(..) {
            serializer.issue_write(pending.location, pending.page, pending.ctx);
            if let Some(count) = self.dirty.get_mut(&pending.location) {
                *count -= 1;
                if *count == 0 {
                    self.dirty.remove(&pending.location);
                }
            }
        }
        if issued > 0 {
            debug!(issued, "flushed dirty blocks");
        }
        issued
    }

    fn is_dirty(&self, location: BlockId) -> bool {
        self.dirty.contains_key(&location)
    }

    fn len(&self) -> usize {
        self.queue.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{serializer::memory, Completion, ExecutionContext};

    fn nz(n: usize) -> NonZeroUsize {
        NonZeroUsize::new(n).unwrap()
    }

    #[test]
    fn test_deferred_in_place() {
        let mut context = ExecutionContext::new();
        let mut store = memory::Store::<&str>::new(4).unwrap();
        let mut writeback = Deferred::default();
        let block = store.new_block_id();

        let page = Page::zeroed(4);
        page.write().copy_from_slice(b"abcd");
        let ctx = AioContext::new(block, "first", context.completer());
        assert_eq!(writeback.mark_dirty(&mut store, block, page.clone(), ctx), block);
        let ctx = AioContext::new(block, "second", context.completer());
        assert_eq!(writeback.mark_dirty(&mut store, block, page, ctx), block);
        assert!(writeback.is_dirty(block));
        assert_eq!(writeback.len(), 2);
        assert_eq!(store.pending(), 0);

        assert_eq!(writeback.flush(&mut store), 2);
        assert!(!writeback.is_dirty(block));
        assert!(writeback.is_empty());
        assert_eq!(store.process(), 2);
        assert_eq!(store.get(block).unwrap().as_ref(), b"abcd");

        // One completion per dirty release.
        for expected in ["first", "second"] {
            let Some(Completion::WriteCompleted { ctx, location, .. }) = context.try_next() else {
                panic!("expected a write completion");
            };
            assert_eq!(location, block);
            assert_eq!(*ctx.state(), expected);
        }
    }

    #[test]
    fn test_deferred_relocate() {
        let mut context = ExecutionContext::new();
        let mut store = memory::Store::<()>::new(4).unwrap();
        let mut writeback = Deferred::new(Placement::Relocate, None);
        assert_eq!(writeback.placement(), Placement::Relocate);
        let block = store.insert(b"old");

        let page = Page::zeroed(4);
        page.write().copy_from_slice(b"new!");
        let ctx = AioContext::new(block, (), context.completer());
        let location = writeback.mark_dirty(&mut store, block, page, ctx);
        assert_ne!(location, block);
        assert!(writeback.is_dirty(location));
        assert!(!writeback.is_dirty(block));

        writeback.flush(&mut store);
        store.process();
        assert_eq!(store.get(block).unwrap().as_ref(), b"old\0");
        assert_eq!(store.get(location).unwrap().as_ref(), b"new!");

        let Some(Completion::WriteCompleted { ctx, location: written, .. }) = context.try_next()
        else {
            panic!("expected a write completion");
        };
        assert_eq!(ctx.block(), block);
        assert_eq!(written, location);
    }

    #[test]
    fn test_deferred_threshold_requires_start() {
        let context = ExecutionContext::new();
        let mut store = memory::Store::<()>::new(4).unwrap();
        let mut writeback = Deferred::new(Placement::InPlace, Some(nz(2)));

        let mark = |writeback: &mut Deferred<()>, store: &mut memory::Store<()>| {
            let block = store.new_block_id();
            let ctx = AioContext::new(block, (), context.completer());
            writeback.mark_dirty(store, block, Page::zeroed(4), ctx);
        };

        // Not started: nothing is issued on its own.
        mark(&mut writeback, &mut store);
        mark(&mut writeback, &mut store);
        assert_eq!(writeback.len(), 2);
        assert_eq!(store.pending(), 0);

        // Started: reaching the threshold flushes everything queued.
        writeback.start();
        mark(&mut writeback, &mut store);
        assert!(writeback.is_empty());
        assert_eq!(store.pending(), 3);
    }
}
