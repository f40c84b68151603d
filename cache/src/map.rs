//! Map block ids to the pages holding their contents.

use crate::{BlockId, Page};
use std::collections::HashMap;

/// The map of record from [BlockId] to resident [Page].
///
/// A block is _resident_ if and only if it is present in the page map.
pub trait PageMap {
    /// Return the page holding `block`, if it is resident.
    fn find(&self, block: BlockId) -> Option<&Page>;

    /// Register `page` as the holder of `block`, returning the page it replaces (if any).
    fn set(&mut self, block: BlockId, page: Page) -> Option<Page>;

    /// Remove `block` from the map, returning its page.
    fn remove(&mut self, block: BlockId) -> Option<Page>;

    /// The number of resident blocks.
    fn len(&self) -> usize;

    /// Whether no blocks are resident.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A [PageMap] backed by a [HashMap].
#[derive(Debug, Default)]
pub struct Table {
    pages: HashMap<BlockId, Page>,
}

impl Table {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty table with room for `capacity` entries.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            pages: HashMap::with_capacity(capacity),
        }
    }
}

impl PageMap for Table {
    fn find(&self, block: BlockId) -> Option<&Page> {
        self.pages.get(&block)
    }

    fn set(&mut self, block: BlockId, page: Page) -> Option<Page> {
        self.pages.insert(block, page)
    }

    fn remove(&mut self, block: BlockId) -> Option<Page> {
        self.pages.remove(&block)
    }

    fn len(&self) -> usize {
        self.pages.len()
    }
}
