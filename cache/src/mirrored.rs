use crate::{
    alloc::{Allocator, Heap},
    context::{self, ExecutionContext, ExecutionContextToken},
    map::{PageMap, Table},
    metrics::Metrics,
    replacement::{Clock, Replacement},
    serializer::Serializer,
    writeback::{Deferred, Writeback},
    AioContext, BlockId, Completion, Config, Error, Notification, Page,
};
use prometheus_client::registry::Registry;
use std::{collections::HashMap, iter};
use tracing::{debug, error, trace, warn};

/// The result of [Cache::acquire].
#[derive(Debug)]
pub enum Acquired {
    /// The block was resident and is now pinned. The page may be used immediately.
    Resident(Page),

    /// The block is being loaded into this page. Its contents are not valid until the load is
    /// reported by a [Notification::Loaded] (or [Notification::LoadFailed]) carrying the state
    /// passed to [Cache::acquire].
    Pending(Page),
}

impl Acquired {
    /// The page the block is (or will be) held in.
    pub fn page(&self) -> &Page {
        match self {
            Self::Resident(page) | Self::Pending(page) => page,
        }
    }

    /// Whether the block was already resident.
    pub fn is_resident(&self) -> bool {
        matches!(self, Self::Resident(_))
    }
}

/// Reads in flight for a block that is not yet resident.
struct Loading<U> {
    /// The buffer of the first outstanding read.
    page: Page,

    /// The number of outstanding reads.
    reads: usize,

    /// States of requests served by the outstanding read rather than their own (only populated
    /// when loads are coalesced).
    waiters: Vec<U>,
}

/// Orchestrates a [Serializer], [Allocator], [PageMap], [Replacement] policy and [Writeback]
/// policy into a page cache.
///
/// `U` is the caller's state, threaded through every asynchronous operation and returned in the
/// [Notification] produced when it completes. The cache never inspects it.
pub struct Cache<U, S, A = Heap, M = Table, R = Clock, W = Deferred<U>> {
    cfg: Config,

    serializer: S,
    allocator: A,
    page_map: M,
    replacement: R,
    writeback: W,

    /// Blocks with reads in flight.
    ///
    /// # Invariants
    ///
    /// A block in `loading` is only resident if a duplicate load of an already resident block is
    /// in flight (which can only happen when loads are not coalesced).
    loading: HashMap<BlockId, Loading<U>>,

    metrics: Metrics,
}

impl<U, S: Serializer<U>> Cache<U, S> {
    /// Create a cache over `serializer` using the default policies: [Heap] allocation, a [Table]
    /// page map, [Clock] replacement and in-place [Deferred] write-back.
    pub fn init(cfg: Config, serializer: S, registry: &mut Registry) -> Self {
        let page_map = Table::with_capacity(cfg.capacity.get());
        Self::new(
            cfg,
            serializer,
            Heap,
            page_map,
            Clock::new(),
            Deferred::default(),
            registry,
        )
    }
}

impl<U, S, A, M, R, W> Cache<U, S, A, M, R, W>
where
    S: Serializer<U>,
    A: Allocator,
    M: PageMap,
    R: Replacement,
    W: Writeback<U>,
{
    /// Compose a cache from the provided policies.
    pub fn new(
        cfg: Config,
        serializer: S,
        allocator: A,
        page_map: M,
        replacement: R,
        writeback: W,
        registry: &mut Registry,
    ) -> Self {
        Self {
            cfg,
            serializer,
            allocator,
            page_map,
            replacement,
            writeback,
            loading: HashMap::new(),
            metrics: Metrics::init(registry),
        }
    }

    /// Start the write-back policy.
    pub fn start(&mut self) {
        self.writeback.start();
    }

    /// Begin a sequence of operations on `context`, which must be the calling thread's current
    /// context.
    pub fn begin(&self, context: &ExecutionContext<U>) -> ExecutionContextToken<U> {
        if self.cfg.check_affinity {
            context::assert_current(context.id());
        }
        trace!(context = %context.id(), "began");
        ExecutionContextToken::new(context.completer())
    }

    /// Close `token`. This releases nothing: no resources are tied to a token.
    pub fn end(&self, token: ExecutionContextToken<U>) {
        self.check(&token);
        trace!(context = %token.context(), "ended");
    }

    /// Create a new block, resident and pinned.
    ///
    /// The page is zeroed; no I/O is performed. The block will not be written to the
    /// [Serializer] until it is released dirty.
    pub fn allocate(&mut self, token: &ExecutionContextToken<U>) -> (Page, BlockId) {
        self.check(token);
        self.make_room();

        let block = self.serializer.new_block_id();
        let page = self.allocator.alloc(self.serializer.block_size());
        let replaced = self.page_map.set(block, page.clone());
        assert!(replaced.is_none(), "serializer reused block id {block}");
        self.replacement.pin(block);

        self.metrics.allocations.inc();
        self.metrics.resident.set(self.page_map.len() as i64);
        debug!(%block, "allocated block");
        (page, block)
    }

    /// Pin `block`, loading it first if it is not resident.
    ///
    /// A resident block is pinned and returned immediately. Otherwise a buffer is allocated and a
    /// read into it is issued, with `state` returned in the [Notification] produced when the read
    /// completes. The block only becomes resident (and visible to eviction) at that point.
    ///
    /// Unless [Config::coalesce_loads] is set, a second request for a block that is still loading
    /// issues a second, independent read into a second buffer.
    pub fn acquire(
        &mut self,
        token: &ExecutionContextToken<U>,
        block: BlockId,
        state: U,
    ) -> Acquired {
        self.check(token);

        if let Some(page) = self.page_map.find(block) {
            let page = page.clone();
            self.replacement.pin(block);
            self.metrics.hits.inc();
            trace!(%block, "hit");
            return Acquired::Resident(page);
        }
        self.metrics.misses.inc();

        if self.cfg.coalesce_loads {
            if let Some(loading) = self.loading.get_mut(&block) {
                loading.waiters.push(state);
                trace!(%block, waiters = loading.waiters.len(), "joined load");
                return Acquired::Pending(loading.page.clone());
            }
        }

        self.make_room();
        let page = self.allocator.alloc(self.serializer.block_size());
        let ctx = AioContext::new(block, state, token.completer().clone());
        let loading = self.loading.entry(block).or_insert_with(|| Loading {
            page: page.clone(),
            reads: 0,
            waiters: Vec::new(),
        });
        loading.reads += 1;
        if loading.reads > 1 {
            debug!(%block, reads = loading.reads, "issuing duplicate load");
        }
        self.metrics.loading.set(self.loading.len() as i64);
        self.metrics.reads.inc();

        trace!(%block, "miss");
        self.serializer.issue_read(block, page.clone(), ctx);
        Acquired::Pending(page)
    }

    /// Release a pin on `block`, held in `page`.
    ///
    /// A clean block is unpinned immediately and its id is returned unchanged. A dirty block is
    /// handed to the [Writeback] policy and stays pinned until its flush completes, with `state`
    /// returned in the resulting [Notification]. The id returned for a dirty block is the one to
    /// use from now on, as the policy may relocate it: a relocated block is immediately resident
    /// under the new id (with all of its pins), and no longer under `block`.
    ///
    /// # Panics
    ///
    /// Panics if `block` is not resident or not pinned.
    pub fn release(
        &mut self,
        token: &ExecutionContextToken<U>,
        block: BlockId,
        page: &Page,
        dirty: bool,
        state: U,
    ) -> BlockId {
        self.check(token);
        assert!(
            self.page_map.find(block).is_some(),
            "release of non-resident block {block}"
        );

        if !dirty {
            self.replacement.unpin(block);
            trace!(%block, "released clean");
            return block;
        }

        // The pin taken when the block was acquired is released once the write completes.
        assert!(
            self.replacement.pins(block) > 0,
            "release of unpinned block {block}"
        );
        let ctx = AioContext::new(block, state, token.completer().clone());
        let location = self
            .writeback
            .mark_dirty(&mut self.serializer, block, page.clone(), ctx);
        if location != block {
            self.relocate(block, location);
        }
        self.metrics.writes.inc();
        debug!(%block, %location, "released dirty");
        location
    }

    /// Issue writes for every block released dirty, returning the number issued.
    pub fn flush(&mut self, token: &ExecutionContextToken<U>) -> usize {
        self.check(token);
        self.writeback.flush(&mut self.serializer)
    }

    /// Evict unpinned blocks until no more than [Config::capacity] are resident, returning the
    /// number evicted.
    pub fn evict(&mut self, token: &ExecutionContextToken<U>) -> usize {
        self.check(token);
        self.reclaim(self.cfg.capacity.get())
    }

    /// Handle a finished read or write.
    ///
    /// A successful read registers and pins the block. A successful write releases the pin owed
    /// since the block was released dirty. Failures leave the cache as if the operation had not
    /// been attempted, except that a failed read's buffer is freed and a failed write's pin is
    /// handed back to the caller.
    ///
    /// More than one [Notification] is returned when coalesced requests were waiting on a read.
    pub fn on_async_complete(&mut self, completion: Completion<U>) -> Vec<Notification<U>> {
        if self.cfg.check_affinity {
            context::assert_current(completion.context().origin());
        }

        match completion {
            Completion::ReadCompleted { ctx, page, result } => {
                let (block, state) = ctx.into_parts();
                let waiters = self.finish_load(block);
                match result {
                    Ok(()) => self.loaded(block, page, state, waiters),
                    Err(err) => self.load_failed(block, page, state, waiters, err),
                }
            }
            Completion::WriteCompleted {
                ctx,
                page,
                location,
                result,
            } => {
                let (block, state) = ctx.into_parts();
                match result {
                    Ok(()) => {
                        self.replacement.unpin(location);
                        debug!(%block, %location, "flushed");
                        vec![Notification::Flushed {
                            block,
                            location,
                            state,
                        }]
                    }
                    Err(err) => {
                        self.metrics.write_failures.inc();
                        error!(%block, %location, ?err, "flush failed");
                        vec![Notification::FlushFailed {
                            block,
                            location,
                            page,
                            state,
                            error: err,
                        }]
                    }
                }
            }
        }
    }

    /// Drive the cache until no I/O is outstanding: flush dirty blocks, let the [Serializer]
    /// complete its operations, and handle every completion delivered to `context`.
    ///
    /// Returns the notifications produced along the way.
    pub fn run_until_idle(
        &mut self,
        token: &ExecutionContextToken<U>,
        context: &mut ExecutionContext<U>,
    ) -> Vec<Notification<U>> {
        self.check(token);
        assert_eq!(
            token.context(),
            context.id(),
            "token and context do not match"
        );

        let mut notifications = Vec::new();
        loop {
            self.writeback.flush(&mut self.serializer);
            let processed = self.serializer.process();
            let mut delivered = 0;
            while let Some(completion) = context.try_next() {
                notifications.extend(self.on_async_complete(completion));
                delivered += 1;
            }
            if processed == 0 && delivered == 0 {
                return notifications;
            }
        }
    }

    /// Whether `block` is resident.
    pub fn is_resident(&self, block: BlockId) -> bool {
        self.page_map.find(block).is_some()
    }

    /// Whether a read of `block` is in flight.
    pub fn is_loading(&self, block: BlockId) -> bool {
        self.loading.contains_key(&block)
    }

    /// The pin count of `block`.
    pub fn pins(&self, block: BlockId) -> usize {
        self.replacement.pins(block)
    }

    /// The configuration of the cache.
    pub fn config(&self) -> &Config {
        &self.cfg
    }

    /// The underlying [Serializer].
    pub fn serializer(&self) -> &S {
        &self.serializer
    }

    /// The underlying [Serializer], mutably.
    pub fn serializer_mut(&mut self) -> &mut S {
        &mut self.serializer
    }

    /// The underlying [Allocator].
    pub fn allocator(&self) -> &A {
        &self.allocator
    }

    /// The underlying [PageMap].
    pub fn page_map(&self) -> &M {
        &self.page_map
    }

    /// The underlying [Replacement] policy.
    pub fn replacement(&self) -> &R {
        &self.replacement
    }

    /// The underlying [Writeback] policy.
    pub fn writeback(&self) -> &W {
        &self.writeback
    }

    fn check(&self, token: &ExecutionContextToken<U>) {
        if self.cfg.check_affinity {
            context::assert_current(token.context());
        }
    }

    /// Record that one read of `block` finished, returning any coalesced waiters.
    fn finish_load(&mut self, block: BlockId) -> Vec<U> {
        let Some(loading) = self.loading.get_mut(&block) else {
            panic!("completion for block {block} with no read in flight");
        };
        loading.reads -= 1;
        let waiters = std::mem::take(&mut loading.waiters);
        if loading.reads == 0 {
            self.loading.remove(&block);
        }
        self.metrics.loading.set(self.loading.len() as i64);
        waiters
    }

    fn loaded(
        &mut self,
        block: BlockId,
        page: Page,
        state: U,
        waiters: Vec<U>,
    ) -> Vec<Notification<U>> {
        if let Some(previous) = self.page_map.set(block, page.clone()) {
            warn!(%block, "duplicate load replaced resident page");
            self.allocator.free(previous);
        }
        self.replacement.pin(block);
        self.metrics.resident.set(self.page_map.len() as i64);
        debug!(%block, waiters = waiters.len(), "loaded");

        let mut notifications = Vec::with_capacity(1 + waiters.len());
        notifications.push(Notification::Loaded {
            block,
            page: page.clone(),
            state,
        });
        for state in waiters {
            self.replacement.pin(block);
            notifications.push(Notification::Loaded {
                block,
                page: page.clone(),
                state,
            });
        }
        notifications
    }

    fn load_failed(
        &mut self,
        block: BlockId,
        page: Page,
        state: U,
        waiters: Vec<U>,
        err: Error,
    ) -> Vec<Notification<U>> {
        self.metrics.read_failures.inc();
        error!(%block, ?err, "load failed");
        self.allocator.free(page);

        // Coalesced waiters see the same cause as the request that issued the read.
        iter::once(state)
            .chain(waiters)
            .map(|state| Notification::LoadFailed {
                block,
                state,
                error: err.clone(),
            })
            .collect()
    }

    /// Move resident `block`, along with its pins, to `location`.
    fn relocate(&mut self, block: BlockId, location: BlockId) {
        let Some(page) = self.page_map.remove(block) else {
            panic!("relocation of non-resident block {block}");
        };
        let replaced = self.page_map.set(location, page);
        assert!(
            replaced.is_none(),
            "relocation onto resident block {location}"
        );
        self.replacement.rename(block, location);
        trace!(%block, %location, "relocated");
    }

    /// Make room for one more resident block.
    fn make_room(&mut self) {
        let target = self.cfg.capacity.get() - 1;
        self.reclaim(target);
    }

    /// Evict unpinned blocks until at most `target` are resident, returning the number evicted.
    fn reclaim(&mut self, target: usize) -> usize {
        let mut evicted = 0;
        while self.page_map.len() > target {
            let Some(victim) = self.replacement.victim() else {
                warn!(
                    resident = self.page_map.len(),
                    capacity = self.cfg.capacity.get(),
                    "all resident blocks pinned, exceeding capacity"
                );
                break;
            };
            let Some(page) = self.page_map.remove(victim) else {
                panic!("evicted block {victim} is not resident");
            };
            self.allocator.free(page);
            self.metrics.evictions.inc();
            evicted += 1;
            trace!(block = %victim, "evicted");
        }
        self.metrics.resident.set(self.page_map.len() as i64);
        evicted
    }
}
