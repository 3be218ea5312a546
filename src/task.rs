//! Exactly-once settlement over native asynchronous operations.
use std::{
    fmt,
    pin::Pin,
    sync::{Arc, Mutex, MutexGuard},
    task::{Poll, ready},
};
use tokio::sync::oneshot;

use crate::log::debug;

/// Teardown thunk registered by a native operation.
pub type Teardown = Box<dyn FnOnce() + Send>;

/// One native asynchronous operation, settling exactly once.
///
/// A task is pending until the operation settles it with a `Result<T, E>`
/// through its [`Settle`] callback. Awaiting the task yields that result.
/// The operation may register a [`Teardown`] thunk, reachable through
/// [`CancelHandle`], which runs at most once and only while unsettled.
///
/// Dropping a task detaches it: the operation keeps running and its
/// settlement is discarded.
pub struct Task<T, E> {
    rx: oneshot::Receiver<Result<T, E>>,
    cancel: CancelHandle,
}

/// Completion callback handed to a native operation.
///
/// Settling consumes the callback, so a second settlement does not
/// typecheck. Whichever of settle and cancel comes first wins; the loser
/// finds the shared slot already spent and does nothing destructive.
pub struct Settle<T, E> {
    tx: oneshot::Sender<Result<T, E>>,
    slot: Arc<Mutex<Thunk>>,
}

/// Cancellation capability of a [`Task`].
///
/// Clones all point at the same teardown slot.
#[derive(Clone)]
pub struct CancelHandle {
    slot: Arc<Mutex<Thunk>>,
}

/// The operation was torn down before settling.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Canceled;

enum Thunk {
    /// No teardown registered.
    Idle,
    /// Teardown registered, operation unsettled.
    Armed(Teardown),
    /// Settled or canceled, nothing left to run.
    Spent,
}

fn lock(slot: &Mutex<Thunk>) -> MutexGuard<'_, Thunk> {
    slot.lock().unwrap_or_else(|e| e.into_inner())
}

// ===== Task =====

impl<T, E> Task<T, E> {
    /// Adapt a native operation that settles its callback exactly once.
    ///
    /// `op` starts the operation, which may settle synchronously. A returned
    /// teardown thunk is armed only when the operation is still unsettled.
    pub fn bind<F>(op: F) -> Self
    where
        F: FnOnce(Settle<T, E>) -> Option<Teardown>,
    {
        let (tx, rx) = oneshot::channel();
        let slot = Arc::new(Mutex::new(Thunk::Idle));

        let teardown = op(Settle { tx, slot: Arc::clone(&slot) });

        if let Some(teardown) = teardown {
            let mut thunk = lock(&slot);
            if matches!(*thunk, Thunk::Idle) {
                *thunk = Thunk::Armed(teardown);
            }
        }

        Self { rx, cancel: CancelHandle { slot } }
    }

    /// Run a future-shaped operation on the runtime.
    ///
    /// The task settles with the future's output. Teardown aborts the
    /// driving tokio task, which leaves the settlement side unresolved and
    /// surfaces as [`Canceled`] to an awaiting caller.
    pub fn spawn<F>(fut: F) -> Self
    where
        F: Future<Output = Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: Send + 'static,
    {
        Self::bind(|settle| {
            let abort = tokio::spawn(async move {
                settle.resolve(fut.await);
            })
            .abort_handle();
            Some(Box::new(move || abort.abort()))
        })
    }

    /// An already-settled task.
    pub fn ready(result: Result<T, E>) -> Self {
        Self::bind(|settle| {
            settle.resolve(result);
            None
        })
    }

    /// Cancellation capability of this task.
    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }
}

impl<T, E> Future for Task<T, E>
where
    E: From<Canceled>,
{
    type Output = Result<T, E>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut std::task::Context) -> Poll<Self::Output> {
        let result = match ready!(Pin::new(&mut self.rx).poll(cx)) {
            Ok(result) => result,
            // settle side dropped without resolving, the operation was torn down
            Err(_) => Err(E::from(Canceled)),
        };
        self.cancel.disarm();
        Poll::Ready(result)
    }
}

// ===== Settle =====

impl<T, E> Settle<T, E> {
    /// Settle with success.
    pub fn succeed(self, value: T) {
        self.resolve(Ok(value));
    }

    /// Settle with failure.
    pub fn fail(self, error: E) {
        self.resolve(Err(error));
    }

    /// Settle with `result`, disarming the teardown thunk.
    ///
    /// Delivery is discarded when the task side is gone.
    pub fn resolve(self, result: Result<T, E>) {
        *lock(&self.slot) = Thunk::Spent;
        if self.tx.send(result).is_err() {
            debug!("settlement discarded, task detached");
        }
    }
}

// ===== CancelHandle =====

impl CancelHandle {
    /// Run the registered teardown, if the operation is still unsettled.
    ///
    /// At most one invocation ever happens; calling again, or after
    /// settlement, does nothing.
    pub fn cancel(&self) {
        let thunk = std::mem::replace(&mut *lock(&self.slot), Thunk::Spent);
        // run outside the lock, teardown may settle synchronously
        if let Thunk::Armed(teardown) = thunk {
            teardown();
        }
    }

    fn disarm(&self) {
        *lock(&self.slot) = Thunk::Spent;
    }
}

// ===== std impls =====

impl<T, E> fmt::Debug for Task<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Task").finish_non_exhaustive()
    }
}

impl<T, E> fmt::Debug for Settle<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Settle").finish_non_exhaustive()
    }
}

impl fmt::Debug for CancelHandle {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("CancelHandle").finish_non_exhaustive()
    }
}

impl fmt::Display for Canceled {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("operation canceled")
    }
}

impl std::error::Error for Canceled {}
