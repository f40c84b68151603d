//! Bridge asynchronous block I/O back to the [crate::Cache].
//!
//! An [AioContext] is created exactly once for every read or write handed to a
//! [crate::serializer::Serializer], and is consumed by [crate::Cache::on_async_complete] when that
//! operation finishes. It cannot be cloned, reused, or cancelled.

use crate::{
    context::{Completer, ContextId},
    BlockId, Error, Page,
};
use std::fmt;

/// Single-use record tying one outstanding I/O operation to its eventual completion.
pub struct AioContext<U> {
    block: BlockId,
    state: U,
    completer: Completer<U>,
}

impl<U> AioContext<U> {
    pub(crate) fn new(block: BlockId, state: U, completer: Completer<U>) -> Self {
        Self {
            block,
            state,
            completer,
        }
    }

    /// The block this operation concerns.
    pub fn block(&self) -> BlockId {
        self.block
    }

    /// The caller's state, handed back in the resulting [Notification].
    pub fn state(&self) -> &U {
        &self.state
    }

    /// The execution context that issued this operation (and that its completion is delivered to).
    pub fn origin(&self) -> ContextId {
        self.completer.context()
    }

    /// Report that a read into `page` has finished.
    pub fn complete_read(self, page: Page, result: Result<(), Error>) {
        let completer = self.completer.clone();
        completer.deliver(Completion::ReadCompleted {
            ctx: self,
            page,
            result,
        });
    }

    /// Report that a write of `page` to `location` has finished.
    pub fn complete_write(self, page: Page, location: BlockId, result: Result<(), Error>) {
        let completer = self.completer.clone();
        completer.deliver(Completion::WriteCompleted {
            ctx: self,
            page,
            location,
            result,
        });
    }

    /// Destroy the context, returning the block it concerned and the caller's state.
    pub(crate) fn into_parts(self) -> (BlockId, U) {
        (self.block, self.state)
    }
}

impl<U> fmt::Debug for AioContext<U> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AioContext")
            .field("block", &self.block)
            .field("origin", &self.origin())
            .finish()
    }
}

/// A finished I/O operation, delivered to the context that issued it.
#[derive(Debug)]
pub enum Completion<U> {
    /// A read of `ctx.block()` into `page` finished.
    ReadCompleted {
        ctx: AioContext<U>,
        page: Page,
        result: Result<(), Error>,
    },
    /// A flush of `page` finished. `location` is where the contents were written, which differs
    /// from `ctx.block()` when the write-back relocated the block.
    WriteCompleted {
        ctx: AioContext<U>,
        page: Page,
        location: BlockId,
        result: Result<(), Error>,
    },
}

impl<U> Completion<U> {
    /// The context of the finished operation.
    pub fn context(&self) -> &AioContext<U> {
        match self {
            Self::ReadCompleted { ctx, .. } | Self::WriteCompleted { ctx, .. } => ctx,
        }
    }
}

/// The outcome of a finished operation, handing the caller's state back to it.
#[derive(Debug)]
pub enum Notification<U> {
    /// `block` is now resident in `page` and pinned on behalf of the caller.
    Loaded { block: BlockId, page: Page, state: U },

    /// `block` could not be read. This request took no pin (although an earlier load of the same
    /// block may have made it resident).
    LoadFailed {
        block: BlockId,
        state: U,
        error: Error,
    },

    /// `block` was flushed to `location` and the pin deferred until then was released. `location`
    /// is the id the block is resident under.
    Flushed {
        block: BlockId,
        location: BlockId,
        state: U,
    },

    /// `block` could not be flushed to `location`. The block stays resident under `location`, and
    /// the pin deferred until the flush is still held and now belongs to the caller, who must
    /// release `location` again.
    FlushFailed {
        block: BlockId,
        location: BlockId,
        page: Page,
        state: U,
        error: Error,
    },
}

impl<U> Notification<U> {
    /// The block the notification concerns.
    pub fn block(&self) -> BlockId {
        match self {
            Self::Loaded { block, .. }
            | Self::LoadFailed { block, .. }
            | Self::Flushed { block, .. }
            | Self::FlushFailed { block, .. } => *block,
        }
    }

    /// The caller's state.
    pub fn state(&self) -> &U {
        match self {
            Self::Loaded { state, .. }
            | Self::LoadFailed { state, .. }
            | Self::Flushed { state, .. }
            | Self::FlushFailed { state, .. } => state,
        }
    }

    /// Whether the operation succeeded.
    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Loaded { .. } | Self::Flushed { .. })
    }
}
