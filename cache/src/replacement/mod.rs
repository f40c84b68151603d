//! Track pins on resident blocks and select unpinned ones for eviction.
//!
//! A block becomes visible to a [Replacement] policy the first time it is pinned, which the
//! [crate::Cache] only does after registering the block in its [crate::map::PageMap]. A block
//! being loaded is therefore never a candidate for eviction.

mod clock;
pub use clock::Clock;

use crate::BlockId;

/// Pin tracking and victim selection.
pub trait Replacement {
    /// Increment the pin count of `block`, starting to track it if it is not yet tracked.
    fn pin(&mut self, block: BlockId);

    /// Decrement the pin count of `block`.
    ///
    /// # Panics
    ///
    /// Panics if `block` is not pinned.
    fn unpin(&mut self, block: BlockId);

    /// The pin count of `block` (zero if untracked).
    fn pins(&self, block: BlockId) -> usize;

    /// Whether `block` is tracked.
    fn contains(&self, block: BlockId) -> bool;

    /// Select a tracked block with no pins for eviction and stop tracking it.
    ///
    /// Returns `None` if every tracked block is pinned.
    fn victim(&mut self) -> Option<BlockId>;

    /// The number of tracked blocks.
    fn len(&self) -> usize;

    /// Move the tracking of `from` (its pins and recency) to `to`.
    ///
    /// # Panics
    ///
    /// Panics if `from` is not tracked or `to` already is.
    fn rename(&mut self, from: BlockId, to: BlockId);

    /// Whether no blocks are tracked.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
