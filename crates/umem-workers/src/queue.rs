//! Blocking FIFO work queue and the per-fault completion handshake.

use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use tracing::warn;
use umem_error::Result;

/// Typed FIFO with blocking pop and shutdown semantics.
///
/// One instance exists per worker role. `pop` drains remaining items
/// before reporting shutdown, so work enqueued before the flag was set is
/// never dropped.
pub struct WorkQueue<T> {
    inner: Mutex<QueueState<T>>,
    cv: Condvar,
}

struct QueueState<T> {
    items: VecDeque<T>,
    shutdown: bool,
}

impl<T> WorkQueue<T> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(QueueState {
                items: VecDeque::new(),
                shutdown: false,
            }),
            cv: Condvar::new(),
        }
    }

    /// Append an item and wake one waiter. Items pushed after shutdown are
    /// discarded.
    pub fn push(&self, item: T) {
        let mut state = self.inner.lock();
        if state.shutdown {
            warn!(target: "umem::workers", event = "push_after_shutdown");
            return;
        }
        state.items.push_back(item);
        drop(state);
        self.cv.notify_one();
    }

    /// Block until an item is available or the queue has shut down and
    /// drained. `None` means clean exit.
    pub fn pop(&self) -> Option<T> {
        let mut state = self.inner.lock();
        loop {
            if let Some(item) = state.items.pop_front() {
                return Some(item);
            }
            if state.shutdown {
                return None;
            }
            self.cv.wait(&mut state);
        }
    }

    /// Set the shutdown flag and wake every waiter.
    pub fn shutdown(&self) {
        let mut state = self.inner.lock();
        state.shutdown = true;
        drop(state);
        self.cv.notify_all();
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().items.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.lock().items.is_empty()
    }
}

impl<T> Default for WorkQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// One-shot handshake between a fault handler and the fill worker that
/// services its read-in.
///
/// The fault handler blocks in [`wait`](Self::wait); the worker calls
/// [`complete`](Self::complete) exactly once. The result is consumed by a
/// single waiter.
#[derive(Debug, Default)]
pub struct FillCompletion {
    state: Mutex<Option<Result<()>>>,
    cv: Condvar,
}

impl FillCompletion {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver the fill outcome and wake the waiter.
    pub fn complete(&self, result: Result<()>) {
        let mut state = self.state.lock();
        debug_assert!(state.is_none(), "fill completion delivered twice");
        *state = Some(result);
        drop(state);
        self.cv.notify_all();
    }

    /// Block until the fill outcome arrives, then take it.
    pub fn wait(&self) -> Result<()> {
        let mut state = self.state.lock();
        loop {
            if let Some(result) = state.take() {
                return result;
            }
            self.cv.wait(&mut state);
        }
    }
}
