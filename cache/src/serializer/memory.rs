//! A [Serializer] that keeps blocks in memory.
//!
//! Operations are queued when issued and only performed (in issue order) when [Store::process] is
//! called, which makes it straightforward to observe the cache while I/O is outstanding. Reads and
//! writes of specific blocks can be made to fail with [Store::fail].

use super::{Operation, Serializer};
use crate::{AioContext, BlockId, Error, Page};
use bytes::Bytes;
use std::collections::{HashMap, HashSet, VecDeque};
use tracing::{debug, trace};

/// An in-memory block store.
pub struct Store<U> {
    block_size: usize,
    next_id: u64,
    blocks: HashMap<BlockId, Bytes>,
    queue: VecDeque<Operation<U>>,
    failing: HashSet<BlockId>,
    reads: u64,
    writes: u64,
}

impl<U> Store<U> {
    /// Create an empty store of `block_size` byte blocks.
    pub fn new(block_size: usize) -> Result<Self, Error> {
        if block_size == 0 {
            return Err(Error::InvalidBlockSize(block_size));
        }
        Ok(Self {
            block_size,
            next_id: 0,
            blocks: HashMap::new(),
            queue: VecDeque::new(),
            failing: HashSet::new(),
            reads: 0,
            writes: 0,
        })
    }

    /// Store `data` (zero-padded to the block size) under a fresh block id.
    ///
    /// # Panics
    ///
    /// Panics if `data` is larger than a block.
    pub fn insert(&mut self, data: &[u8]) -> BlockId {
        assert!(data.len() <= self.block_size, "data larger than a block");
        let mut block = vec![0; self.block_size];
        block[..data.len()].copy_from_slice(data);
        let id = self.next_block_id();
        self.blocks.insert(id, Bytes::from(block));
        id
    }

    /// The durable contents of `block`, if it has been written.
    pub fn get(&self, block: BlockId) -> Option<&Bytes> {
        self.blocks.get(&block)
    }

    /// Make every subsequent read or write of `block` fail.
    pub fn fail(&mut self, block: BlockId) {
        self.failing.insert(block);
    }

    /// Undo [Store::fail].
    pub fn heal(&mut self, block: BlockId) {
        self.failing.remove(&block);
    }

    /// The number of reads performed.
    pub fn reads(&self) -> u64 {
        self.reads
    }

    /// The number of writes performed.
    pub fn writes(&self) -> u64 {
        self.writes
    }

    fn next_block_id(&mut self) -> BlockId {
        let id = BlockId::new(self.next_id);
        self.next_id += 1;
        id
    }

    fn read(&self, block: BlockId, page: &Page) -> Result<(), Error> {
        if self.failing.contains(&block) {
            return Err(Error::ReadFailed(block));
        }
        let data = self.blocks.get(&block).ok_or(Error::BlockMissing(block))?;
        page.write().copy_from_slice(data);
        Ok(())
    }

    fn write(&mut self, location: BlockId, page: &Page) -> Result<(), Error> {
        if self.failing.contains(&location) {
            return Err(Error::WriteFailed(location));
        }
        self.blocks.insert(location, page.snapshot());
        Ok(())
    }
}

impl<U> Serializer<U> for Store<U> {
    fn block_size(&self) -> usize {
        self.block_size
    }

    fn new_block_id(&mut self) -> BlockId {
        self.next_block_id()
    }

    fn issue_read(&mut self, block: BlockId, page: Page, ctx: AioContext<U>) {
        trace!(%block, "queued read");
        self.queue.push_back(Operation::Read { block, page, ctx });
    }

    fn issue_write(&mut self, location: BlockId, page: Page, ctx: AioContext<U>) {
        trace!(%location, "queued write");
        self.queue.push_back(Operation::Write {
            location,
            page,
            ctx,
        });
    }

    fn process(&mut self) -> usize {
        let mut completed = 0;
        while let Some(operation) = self.queue.pop_front() {
            match operation {
                Operation::Read { block, page, ctx } => {
                    self.reads += 1;
                    let result = self.read(block, &page);
                    if let Err(err) = &result {
                        debug!(%block, ?err, "read failed");
                    }
                    ctx.complete_read(page, result);
                }
                Operation::Write {
                    location,
                    page,
                    ctx,
                } => {
                    self.writes += 1;
                    let result = self.write(location, &page);
                    if let Err(err) = &result {
                        debug!(%location, ?err, "write failed");
                    }
                    ctx.complete_write(page, location, result);
                }
            }
            completed += 1;
        }
        completed
    }

    fn pending(&self) -> usize {
        self.queue.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Completion, ExecutionContext};

    #[test]
    fn test_store_rejects_empty_blocks() {
        assert!(matches!(
            Store::<()>::new(0),
            Err(Error::InvalidBlockSize(0))
        ));
    }

    #[test]
    fn test_store_ids_are_fresh() {
        let mut store = Store::<()>::new(4).unwrap();
        let first = store.new_block_id();
        let second = store.insert(b"ab");
        let third = store.new_block_id();
        assert_ne!(first, second);
        assert_ne!(second, third);
        assert_eq!(store.get(second).unwrap().as_ref(), b"ab\0\0");
        assert!(store.get(first).is_none());
    }

    #[test]
    fn test_store_defers_until_processed() {
        let mut context = ExecutionContext::new();
        let mut store = Store::new(4).unwrap();
        let block = store.insert(b"data");

        let page = Page::zeroed(4);
        let ctx = AioContext::new(block, (), context.completer());
        store.issue_read(block, page.clone(), ctx);
        assert_eq!(store.pending(), 1);
        assert!(context.try_next().is_none());
        assert_eq!(page.read().as_ref(), &[0; 4]);

        assert_eq!(store.process(), 1);
        assert_eq!(store.pending(), 0);
        assert_eq!(store.reads(), 1);
        assert_eq!(page.read().as_ref(), b"data");
        assert!(matches!(
            context.try_next(),
            Some(Completion::ReadCompleted { result: Ok(()), .. })
        ));
    }

    #[test]
    fn test_store_write_is_durable() {
        let mut context = ExecutionContext::new();
        let mut store = Store::new(4).unwrap();
        let location = store.new_block_id();

        let page = Page::zeroed(4);
        page.write().copy_from_slice(b"abcd");
        store.issue_write(location, page, AioContext::new(location, (), context.completer()));
        store.process();
        assert_eq!(store.writes(), 1);
        assert_eq!(store.get(location).unwrap().as_ref(), b"abcd");
        assert!(matches!(
            context.try_next(),
            Some(Completion::WriteCompleted { result: Ok(()), .. })
        ));
    }

    #[test]
    fn test_store_failures() {
        let mut context = ExecutionContext::new();
        let mut store = Store::new(4).unwrap();
        let missing = store.new_block_id();
        let failing = store.insert(b"x");
        store.fail(failing);

        for block in [missing, failing] {
            let ctx = AioContext::new(block, (), context.completer());
            store.issue_read(block, Page::zeroed(4), ctx);
        }
        let ctx = AioContext::new(failing, (), context.completer());
        store.issue_write(failing, Page::zeroed(4), ctx);
        assert_eq!(store.process(), 3);

        assert!(matches!(
            context.try_next(),
            Some(Completion::ReadCompleted {
                result: Err(Error::BlockMissing(_)),
                ..
            })
        ));
        assert!(matches!(
            context.try_next(),
            Some(Completion::ReadCompleted {
                result: Err(Error::ReadFailed(_)),
                ..
            })
        ));
        assert!(matches!(
            context.try_next(),
            Some(Completion::WriteCompleted {
                result: Err(Error::WriteFailed(_)),
                ..
            })
        ));

        // Healing restores access (and the failed write left the old contents in place).
        store.heal(failing);
        assert_eq!(store.get(failing).unwrap().as_ref(), b"x\0\0\0");
    }
}
