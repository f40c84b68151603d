//! Allocate and reclaim the fixed-size buffers that hold block contents.
//!
//! An [Allocator] knows nothing about block identity: it only hands out [Page]s of a requested size
//! and takes them back. No other component frees a page directly.

use crate::Page;
use tracing::trace;

/// Allocation authority for [Page]s.
pub trait Allocator {
    /// Return a zeroed page of `size` bytes.
    fn alloc(&mut self, size: usize) -> Page;

    /// Reclaim `page`. Other handles to the page remain valid.
    fn free(&mut self, page: Page);
}

/// Allocates a fresh buffer for every page and drops buffers when they are freed.
#[derive(Clone, Debug, Default)]
pub struct Heap;

impl Allocator for Heap {
    fn alloc(&mut self, size: usize) -> Page {
        Page::zeroed(size)
    }

    fn free(&mut self, page: Page) {
        drop(page);
    }
}

/// Keeps up to `max_free` freed buffers around for reuse.
///
/// A freed page is only recycled if no other handle to it is still alive. Buffers of a different
/// size than the one requested are discarded rather than handed out.
#[derive(Debug)]
pub struct Recycler {
    free: Vec<Box<[u8]>>,
    max_free: usize,
    recycled: u64,
}

impl Recycler {
    /// Create an allocator that retains at most `max_free` freed buffers.
    pub fn new(max_free: usize) -> Self {
        Self {
            free: Vec::with_capacity(max_free),
            max_free,
            recycled: 0,
        }
    }

    /// The number of buffers waiting to be reused.
    pub fn available(&self) -> usize {
        self.free.len()
    }

    /// The number of allocations served from the free list.
    pub fn recycled(&self) -> u64 {
        self.recycled
    }
}

impl Allocator for Recycler {
    fn alloc(&mut self, size: usize) -> Page {
        while let Some(mut data) = self.free.pop() {
            if data.len() != size {
                continue;
            }
            data.fill(0);
            self.recycled += 1;
            trace!(size, "recycled buffer");
            return Page::new(data);
        }
        Page::zeroed(size)
    }

    fn free(&mut self, page: Page) {
        if self.free.len() >= self.max_free {
            return;
        }
        if let Some(data) = page.into_inner() {
            self.free.push(data);
        }
    }
}
