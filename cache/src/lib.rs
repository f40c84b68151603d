//! Compose pluggable page cache policies into a single block lifecycle.
//!
//! A [Cache] does not store, fetch, or evict anything by itself. Instead, it collects the
//! components of a page cache (block I/O, buffer allocation, page lookup, page replacement, and
//! write-back) into a coherent whole, and owns the protocol that ties them together: when a block
//! is resident, when it must be loaded, when it may be evicted, and when it is owed an unpin after
//! a flush. This makes it easy to experiment with each component independently.
//!
//! # Components
//!
//! - [serializer::Serializer] generates block ids, knows the block size, and performs asynchronous
//!   reads and writes.
//! - [alloc::Allocator] hands out and reclaims fixed-size [Page]s.
//! - [map::PageMap] maps a [BlockId] to the [Page] holding its contents. Presence in the map is
//!   what it means for a block to be _resident_.
//! - [replacement::Replacement] tracks pins and selects unpinned resident blocks for eviction.
//! - [writeback::Writeback] tracks dirty blocks and schedules their flush (possibly relocating them
//!   to a new [BlockId]).
//!
//! # Execution Contexts
//!
//! Every operation is performed on behalf of an [ExecutionContextToken], obtained from
//! [Cache::begin] while an [ExecutionContext] is entered on the calling thread. There are no locks
//! in the orchestrator: mutual exclusion comes from confining each token to the context that
//! created it, and asynchronous completions are always delivered back onto the issuing context's
//! queue. When [Config::check_affinity] is set (the default in debug builds), using a token from
//! any other context panics before any state is touched.
//!
//! # Lifecycle
//!
//! - [Cache::allocate] creates a new resident, pinned block.
//! - [Cache::acquire] pins a resident block, or starts loading a missing one. A loading block is
//!   not resident (and therefore invisible to eviction) until its read completes.
//! - [Cache::release] unpins a clean block immediately. A dirty block stays pinned until the
//!   write-back flush of that release completes.
//! - [Cache::on_async_complete] is the single entry point for finished reads and writes.
//!
//! # Example
//!
//! ```rust
//! use blockcache::{serializer::memory, Acquired, Cache, Config, ExecutionContext};
//! use prometheus_client::registry::Registry;
//!
//! let mut context = ExecutionContext::<&'static str>::new();
//! let _entered = context.enter();
//!
//! let mut registry = Registry::default();
//! let store = memory::Store::new(4096).unwrap();
//! let mut cache = Cache::init(Config::default(), store, &mut registry);
//! let token = cache.begin(&context);
//!
//! // Create a block, fill it, and flush it.
//! let (page, block) = cache.allocate(&token);
//! page.write()[..5].copy_from_slice(b"hello");
//! let block = cache.release(&token, block, &page, true, "flush");
//! let notifications = cache.run_until_idle(&token, &mut context);
//! assert_eq!(notifications.len(), 1);
//!
//! // The block is still resident, so acquiring it is a hit.
//! let Acquired::Resident(page) = cache.acquire(&token, block, "read") else {
//!     panic!("expected a resident block");
//! };
//! assert_eq!(&page.read()[..5], b"hello");
//! cache.release(&token, block, &page, false, "done");
//! cache.end(token);
//! ```

use std::{fmt, num::NonZeroUsize};
use thiserror::Error;

pub mod aio;
pub mod alloc;
pub mod context;
pub mod map;
mod metrics;
mod mirrored;
mod page;
pub mod replacement;
pub mod serializer;
pub mod writeback;

pub use aio::{AioContext, Completion, Notification};
pub use context::{ContextId, ExecutionContext, ExecutionContextToken};
pub use mirrored::{Acquired, Cache};
pub use page::Page;

/// Identifies a block on durable storage.
///
/// Block ids are only ever generated by a [serializer::Serializer]. A dirty flush may move a
/// block's contents to a new id, in which case the id returned by [Cache::release] is the one to
/// use from then on.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BlockId(u64);

impl BlockId {
    /// Create a block id from its raw value.
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// The raw value of this block id.
    pub const fn get(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Errors that can occur while performing block I/O.
///
/// Misuse of the cache (a token used on the wrong context, releasing a block that was never
/// pinned, etc.) is never reported here. Those are bugs and panic instead.
#[derive(Debug, Error)]
pub enum Error {
    #[error("read failed: {0}")]
    ReadFailed(BlockId),
    #[error("write failed: {0}")]
    WriteFailed(BlockId),
    #[error("block missing: {0}")]
    BlockMissing(BlockId),
    #[error("checksum mismatch: {0}")]
    ChecksumMismatch(BlockId),
    #[error("invalid block size: {0}")]
    InvalidBlockSize(usize),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Clone for Error {
    /// Clone the error. An [Error::Io] is rebuilt from its kind and message.
    fn clone(&self) -> Self {
        match self {
            Self::ReadFailed(block) => Self::ReadFailed(*block),
            Self::WriteFailed(block) => Self::WriteFailed(*block),
            Self::BlockMissing(block) => Self::BlockMissing(*block),
            Self::ChecksumMismatch(block) => Self::ChecksumMismatch(*block),
            Self::InvalidBlockSize(size) => Self::InvalidBlockSize(*size),
            Self::Io(err) => Self::Io(std::io::Error::new(err.kind(), err.to_string())),
        }
    }
}

/// Configuration for a [Cache].
#[derive(Clone, Debug)]
pub struct Config {
    /// The number of resident pages above which unpinned blocks are evicted.
    pub capacity: NonZeroUsize,

    /// Whether to verify that every operation runs on the execution context its token (or
    /// [AioContext]) was created on.
    ///
    /// Defaults to `cfg!(debug_assertions)`.
    pub check_affinity: bool,

    /// Whether to serve repeated requests for a block that is still loading from the read already
    /// in flight, rather than issuing another read.
    pub coalesce_loads: bool,
}

/// The default [Config::capacity].
const DEFAULT_CAPACITY: NonZeroUsize = match NonZeroUsize::new(1024) {
    Some(capacity) => capacity,
    None => unreachable!(),
};

impl Default for Config {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
            check_affinity: cfg!(debug_assertions),
            coalesce_loads: false,
        }
    }
}
