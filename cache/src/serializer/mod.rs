//! Generate block ids and perform asynchronous block I/O.
//!
//! A [Serializer] accepts reads and writes along with the [AioContext] of each, and later
//! completes them through that context (see [AioContext::complete_read] and
//! [AioContext::complete_write]), which routes the completion back to the execution context that
//! issued the operation. Implementations are responsible for the on-disk format and for detecting
//! I/O failures, which they report in the completion's result.

use crate::{AioContext, BlockId, Page};

pub mod file;
pub mod memory;

/// The block store underlying a [crate::Cache].
pub trait Serializer<U> {
    /// The size of every block in bytes.
    fn block_size(&self) -> usize;

    /// Generate a fresh block id that has never been handed out before.
    fn new_block_id(&mut self) -> BlockId;

    /// Read the contents of `block` into `page`, completing `ctx` when done.
    fn issue_read(&mut self, block: BlockId, page: Page, ctx: AioContext<U>);

    /// Write the contents of `page` to `location`, completing `ctx` when done.
    fn issue_write(&mut self, location: BlockId, page: Page, ctx: AioContext<U>);

    /// Drive outstanding operations to completion, returning the number completed.
    fn process(&mut self) -> usize;

    /// The number of operations issued but not yet completed.
    fn pending(&self) -> usize;
}

/// An operation waiting to be performed by a store.
enum Operation<U> {
    Read {
        block: BlockId,
        page: Page,
        ctx: AioContext<U>,
    },
    Write {
        location: BlockId,
        page: Page,
        ctx: AioContext<U>,
    },
}
