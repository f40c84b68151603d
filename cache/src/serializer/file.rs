//! A [Serializer] that keeps blocks in a single file.
//!
//! Block `n` is stored at offset `n * (block_size + 4)`, followed by a big-endian CRC32 of its
//! contents. A block whose slot lies beyond the end of the file (or was never written) is reported
//! as [Error::BlockMissing], and one whose checksum does not match as [Error::ChecksumMismatch].
//!
//! Like [super::memory::Store], operations are queued when issued and performed by
//! [Store::process] on the calling thread.

use super::{Operation, Serializer};
use crate::{AioContext, BlockId, Error, Page};
use std::{
    collections::VecDeque,
    fs::{File, OpenOptions},
    os::unix::fs::FileExt,
    path::Path,
};
use tracing::{debug, error, trace};

/// The size of the checksum stored after each block.
const CHECKSUM_SIZE: u64 = 4;

/// A file-backed block store.
pub struct Store<U> {
    file: File,
    block_size: usize,
    next_id: u64,
    len: u64,
    queue: VecDeque<Operation<U>>,
}

impl<U> Store<U> {
    /// Open (creating if necessary) the store at `path` with `block_size` byte blocks.
    ///
    /// Block ids continue after the last slot present in the file.
    pub fn open(path: impl AsRef<Path>, block_size: usize) -> Result<Self, Error> {
        if block_size == 0 {
            return Err(Error::InvalidBlockSize(block_size));
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path.as_ref())?;
        let len = file.metadata()?.len();
        let slot = block_size as u64 + CHECKSUM_SIZE;
        let next_id = len.div_ceil(slot);
        debug!(path = ?path.as_ref(), len, next_id, "opened block file");
        Ok(Self {
            file,
            block_size,
            next_id,
            len,
            queue: VecDeque::new(),
        })
    }

    /// Flush written blocks to stable storage.
    pub fn sync(&self) -> Result<(), Error> {
        self.file.sync_data()?;
        Ok(())
    }

    fn slot_size(&self) -> u64 {
        self.block_size as u64 + CHECKSUM_SIZE
    }

    fn offset(&self, block: BlockId) -> Result<u64, Error> {
        block
            .get()
            .checked_mul(self.slot_size())
            .ok_or(Error::BlockMissing(block))
    }

    fn read(&self, block: BlockId, page: &Page) -> Result<(), Error> {
        let offset = self.offset(block)?;
        if offset.saturating_add(self.slot_size()) > self.len {
            return Err(Error::BlockMissing(block));
        }
        let mut buf = vec![0; self.slot_size() as usize];
        self.file.read_exact_at(&mut buf, offset)?;

        let (data, checksum) = buf.split_at(self.block_size);
        let stored = u32::from_be_bytes(checksum.try_into().unwrap());
        if stored == 0 && data.iter().all(|b| *b == 0) {
            // A hole left behind by a write to a later slot.
            return Err(Error::BlockMissing(block));
        }
        if stored != crc32fast::hash(data) {
            return Err(Error::ChecksumMismatch(block));
        }
        page.write().copy_from_slice(data);
        Ok(())
    }

    fn write(&mut self, location: BlockId, page: &Page) -> Result<(), Error> {
        let offset = self.offset(location)?;
        let mut buf = Vec::with_capacity(self.slot_size() as usize);
        buf.extend_from_slice(&page.read());
        buf.extend_from_slice(&crc32fast::hash(&buf).to_be_bytes());
        self.file.write_all_at(&buf, offset)?;
        self.len = self.len.max(offset + self.slot_size());
        Ok(())
    }
}

impl<U> Serializer<U> for Store<U> {
    fn block_size(&self) -> usize {
        self.block_size
    }

    fn new_block_id(&mut self) -> BlockId {
        let id = BlockId::new(self.next_id);
        self.next_id += 1;
        id
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
                    let result = self.read(block, &page);
                    if let Err(err) = &result {
                        error!(%block, ?err, "read failed");
                    }
                    ctx.complete_read(page, result);
                }
                Operation::Write {
                    location,
                    page,
                    ctx,
                } => {
                    let result = self.write(location, &page);
                    if let Err(err) = &result {
                        error!(%location, ?err, "write failed");
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
    use rand::Rng as _;
    use std::{env, fs, path::PathBuf};

    const BLOCK_SIZE: usize = 16;

    fn temp_path(name: &str) -> PathBuf {
        env::temp_dir().join(format!("blockcache_{}_{}", name, rand::thread_rng().gen::<u64>()))
    }

    fn write(
        store: &mut Store<()>,
        context: &mut ExecutionContext<()>,
        location: BlockId,
        data: &[u8],
    ) {
        let page = Page::zeroed(BLOCK_SIZE);
        page.write()[..data.len()].copy_from_slice(data);
        let ctx = AioContext::new(location, (), context.completer());
        store.issue_write(location, page, ctx);
        store.process();
        assert!(matches!(
            context.try_next(),
            Some(Completion::WriteCompleted { result: Ok(()), .. })
        ));
    }

    fn read(
        store: &mut Store<()>,
        context: &mut ExecutionContext<()>,
        block: BlockId,
    ) -> Result<Page, Error> {
        let page = Page::zeroed(BLOCK_SIZE);
        let ctx = AioContext::new(block, (), context.completer());
        store.issue_read(block, page, ctx);
        store.process();
        match context.try_next() {
            Some(Completion::ReadCompleted { page, result, .. }) => result.map(|_| page),
            _ => panic!("expected a read completion"),
        }
    }

    #[test]
    fn test_file_store_round_trip_and_reopen() {
        let path = temp_path("reopen");
        let mut context = ExecutionContext::new();
        {
            let mut store = Store::open(&path, BLOCK_SIZE).unwrap();
            let first = store.new_block_id();
            let second = store.new_block_id();
            write(&mut store, &mut context, first, b"first");
            write(&mut store, &mut context, second, b"second");
            store.sync().unwrap();

            let page = read(&mut store, &mut context, first).unwrap();
            assert_eq!(&page.read()[..5], b"first");
        }

        // Ids continue after the last written slot.
        let mut store = Store::open(&path, BLOCK_SIZE).unwrap();
        assert_eq!(store.new_block_id(), BlockId::new(2));
        let page = read(&mut store, &mut context, BlockId::new(1)).unwrap();
        assert_eq!(&page.read()[..6], b"second");

        fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_file_store_missing_blocks() {
        let path = temp_path("missing");
        let mut context = ExecutionContext::new();
        let mut store = Store::open(&path, BLOCK_SIZE).unwrap();

        // Past the end of the file.
        assert!(matches!(
            read(&mut store, &mut context, BlockId::new(0)),
            Err(Error::BlockMissing(_))
        ));

        // A hole before a written slot.
        write(&mut store, &mut context, BlockId::new(2), b"later");
        assert!(matches!(
            read(&mut store, &mut context, BlockId::new(1)),
            Err(Error::BlockMissing(_))
        ));

        fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_file_store_detects_corruption() {
        let path = temp_path("corrupt");
        let mut context = ExecutionContext::new();
        let mut store = Store::open(&path, BLOCK_SIZE).unwrap();
        let block = store.new_block_id();
        write(&mut store, &mut context, block, b"intact");

        // Flip a byte of the stored block.
        let file = OpenOptions::new().write(true).open(&path).unwrap();
        file.write_all_at(b"X", 0).unwrap();
        assert!(matches!(
            read(&mut store, &mut context, block),
            Err(Error::ChecksumMismatch(_))
        ));

        fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_file_store_rejects_empty_blocks() {
        let path = temp_path("empty");
        assert!(matches!(
            Store::<()>::open(&path, 0),
            Err(Error::InvalidBlockSize(0))
        ));
    }
}
