//! Execution contexts and the affinity tokens bound to them.
//!
//! An [ExecutionContext] is a single-threaded queue of I/O completions. While a context is entered
//! on a thread (see [ExecutionContext::enter]), it is that thread's _current_ context, and all
//! cache operations performed on the thread are expected to carry a token for it.
//!
//! Each [crate::AioContext] holds a route back into the queue of the context that issued it, so a
//! completion is always delivered to the same context that started the operation, regardless of
//! which [crate::serializer::Serializer] finished it.

use crate::Completion;
use futures::{
    channel::mpsc::{self, UnboundedReceiver, UnboundedSender},
    StreamExt,
};
use std::{
    cell::Cell,
    fmt,
    sync::atomic::{AtomicU64, Ordering},
};
use tracing::{trace, warn};

/// The next id to assign to a new [ExecutionContext].
static NEXT_ID: AtomicU64 = AtomicU64::new(0);

thread_local! {
    /// The context currently entered on this thread, if any.
    static CURRENT: Cell<Option<ContextId>> = const { Cell::new(None) };
}

/// Uniquely identifies an [ExecutionContext] within the process.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ContextId(u64);

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Return the context currently entered on this thread.
pub fn current() -> Option<ContextId> {
    CURRENT.with(|current| current.get())
}

/// A queue of completions owned by a single thread of execution.
///
/// `U` is the caller-supplied state threaded through each asynchronous operation.
pub struct ExecutionContext<U> {
    id: ContextId,
    sender: UnboundedSender<Completion<U>>,
    receiver: UnboundedReceiver<Completion<U>>,
}

impl<U> ExecutionContext<U> {
    /// Create a new context with an empty completion queue.
    pub fn new() -> Self {
        let id = ContextId(NEXT_ID.fetch_add(1, Ordering::Relaxed));
        let (sender, receiver) = mpsc::unbounded();
        Self {
            id,
            sender,
            receiver,
        }
    }

    /// The identity of this context.
    pub fn id(&self) -> ContextId {
        self.id
    }

    /// Make this context the current context of the calling thread until the returned guard is
    /// dropped.
    ///
    /// # Panics
    ///
    /// Panics if a different context is already entered on this thread.
    pub fn enter(&self) -> Entered {
        let previous = CURRENT.with(|current| current.replace(Some(self.id)));
        if let Some(previous) = previous {
            if previous != self.id {
                CURRENT.with(|current| current.set(Some(previous)));
                panic!(
                    "context {} entered while context {} is current",
                    self.id, previous
                );
            }
        }
        trace!(context = %self.id, "entered context");
        Entered {
            id: self.id,
            previous,
        }
    }

    /// Return a route for delivering completions into this context's queue.
    pub(crate) fn completer(&self) -> Completer<U> {
        Completer {
            context: self.id,
            sender: self.sender.clone(),
        }
    }

    /// Pop the next queued completion, if any, without waiting.
    pub fn try_next(&mut self) -> Option<Completion<U>> {
        // The context holds its own sender, so the queue is never closed.
        self.receiver.try_next().ok().flatten()
    }

    /// Wait for the next completion to be delivered.
    pub async fn next(&mut self) -> Option<Completion<U>> {
        self.receiver.next().await
    }
}

impl<U> Default for ExecutionContext<U> {
    fn default() -> Self {
        Self::new()
    }
}

/// Guard returned by [ExecutionContext::enter].
///
/// Restores the previously entered context (if any) on drop.
#[must_use = "the context is only current while the guard is alive"]
pub struct Entered {
    id: ContextId,
    previous: Option<ContextId>,
}

impl Drop for Entered {
    fn drop(&mut self) {
        CURRENT.with(|current| current.set(self.previous));
        trace!(context = %self.id, "exited context");
    }
}

/// A route back into the completion queue of a specific [ExecutionContext].
pub(crate) struct Completer<U> {
    context: ContextId,
    sender: UnboundedSender<Completion<U>>,
}

impl<U> Completer<U> {
    /// The context completions are delivered to.
    pub(crate) fn context(&self) -> ContextId {
        self.context
    }

    /// Deliver `completion` to the context.
    pub(crate) fn deliver(&self, completion: Completion<U>) {
        if self.sender.unbounded_send(completion).is_err() {
            warn!(context = %self.context, "dropping completion for closed context");
        }
    }
}

impl<U> Clone for Completer<U> {
    fn clone(&self) -> Self {
        Self {
            context: self.context,
            sender: self.sender.clone(),
        }
    }
}

/// Identifies the execution context performing a sequence of cache operations.
///
/// This is an affinity token, not a unit of atomicity: it guarantees nothing about rollback or
/// isolation. It only asserts that every operation performed with it runs on the context that
/// created it. Tokens are created by [crate::Cache::begin] and consumed by [crate::Cache::end];
/// they cannot be cloned, so a closed token can never be used again.
pub struct ExecutionContextToken<U> {
    completer: Completer<U>,
}

impl<U> ExecutionContextToken<U> {
    pub(crate) fn new(completer: Completer<U>) -> Self {
        Self { completer }
    }

    /// The context this token is bound to.
    pub fn context(&self) -> ContextId {
        self.completer.context()
    }

    pub(crate) fn completer(&self) -> &Completer<U> {
        &self.completer
    }
}

impl<U> fmt::Debug for ExecutionContextToken<U> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionContextToken")
            .field("context", &self.context())
            .finish()
    }
}

/// Panic unless `expected` is the context entered on the calling thread.
pub(crate) fn assert_current(expected: ContextId) {
    let actual = current();
    assert_eq!(
        actual,
        Some(expected),
        "operation bound to context {expected} invoked from context {actual:?}"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{AioContext, BlockId, Page};
    use futures::executor::block_on;
    use std::thread;

    #[test]
    fn test_enter_sets_and_restores_current() {
        let context = ExecutionContext::<()>::new();
        assert_eq!(current(), None);
        {
            let _entered = context.enter();
            assert_eq!(current(), Some(context.id()));

            // Re-entering the same context is allowed.
            let inner = context.enter();
            drop(inner);
            assert_eq!(current(), Some(context.id()));
        }
        assert_eq!(current(), None);
    }

    #[test]
    #[should_panic(expected = "entered while context")]
    fn test_enter_second_context_panics() {
        let first = ExecutionContext::<()>::new();
        let second = ExecutionContext::<()>::new();
        let _entered = first.enter();
        let _ = second.enter();
    }

    #[test]
    fn test_current_is_per_thread() {
        let context = ExecutionContext::<()>::new();
        let _entered = context.enter();
        let other = thread::spawn(current).join().unwrap();
        assert_eq!(other, None);
        assert_eq!(current(), Some(context.id()));
    }

    #[test]
    fn test_context_ids_are_unique() {
        let first = ExecutionContext::<()>::new();
        let second = ExecutionContext::<()>::new();
        assert_ne!(first.id(), second.id());
    }

    #[test]
    fn test_next_waits_for_completion_from_other_thread() {
        let mut context = ExecutionContext::new();
        let ctx = AioContext::new(BlockId::new(4), "remote", context.completer());
        let handle = thread::spawn(move || ctx.complete_read(Page::zeroed(4), Ok(())));

        let completion = block_on(context.next()).unwrap();
        handle.join().unwrap();
        assert_eq!(completion.context().block(), BlockId::new(4));
        assert_eq!(*completion.context().state(), "remote");
    }

    #[test]
    fn test_assert_current_accepts_entered_context() {
        let context = ExecutionContext::<()>::new();
        let _entered = context.enter();
        assert_current(context.id());
    }

    #[test]
    #[should_panic(expected = "invoked from context None")]
    fn test_assert_current_rejects_missing_context() {
        let context = ExecutionContext::<()>::new();
        assert_current(context.id());
    }
}
