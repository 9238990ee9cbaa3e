//! Queued task type for the session dispatcher.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;

use super::token::Completer;
use crate::error::DebugError;

type Starter = Box<dyn FnOnce(Result<(), DebugError>) -> Option<BoxFuture<'static, ()>> + Send>;

/// A task waiting for its turn on the dispatcher.
///
/// Holds the completer of the originating token: starting the task yields
/// the future that settles it, rejecting the task settles it with an error.
pub struct QueuedTask {
    pub seq: u64,
    /// Runs alone: starts after every earlier task finished and holds back
    /// every later one until it finishes.
    pub exclusive: bool,
    cancelled: Arc<AtomicBool>,
    starter: Starter,
}

impl std::fmt::Debug for QueuedTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueuedTask")
            .field("seq", &self.seq)
            .field("exclusive", &self.exclusive)
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

impl QueuedTask {
    pub(crate) fn new<T, F, Fut>(
        seq: u64,
        exclusive: bool,
        cancelled: Arc<AtomicBool>,
        completer: Completer<T>,
        task: F,
    ) -> Self
    where
        T: Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, DebugError>> + Send + 'static,
    {
        let starter: Starter = Box::new(move |admission| match admission {
            Ok(()) => Some(
                async move {
                    let result = task().await;
                    completer.settle(result);
                }
                .boxed(),
            ),
            Err(error) => {
                completer.fail(error);
                None
            }
        });
        Self { seq, exclusive, cancelled, starter }
    }

    /// Check if the originating token has been cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Admit the task, returning the future to drive.
    pub(crate) fn start(self) -> Option<BoxFuture<'static, ()>> {
        (self.starter)(Ok(()))
    }

    /// Settle the originating token with `error` without running the task.
    pub(crate) fn reject(self, error: DebugError) {
        let _ = (self.starter)(Err(error));
    }
}
