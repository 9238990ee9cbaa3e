//! Session dispatcher: the single logical thread of control of a session.
//!
//! Every operation against shared debugger state of a session is scheduled
//! here. Tasks start in submission order and never run in parallel with
//! each other. Plain tasks may interleave where they await; exclusive tasks
//! act as barriers, so state changes are seen in scheduling order.

mod queue;
pub mod token;
mod worker;

use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::runtime::RuntimeFlavor;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::DebugError;
use crate::shutdown::{ShutdownCoordinator, ShutdownResult, ShutdownState};

pub use queue::QueuedTask;
pub use token::{Completer, CompletionToken};

static NEXT_DISPATCHER_ID: AtomicU64 = AtomicU64::new(1);

/// Configuration for a session dispatcher.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Maximum queued, not yet started tasks (0 = unbounded).
    pub max_pending: usize,
    /// Grace period for in-flight tasks during shutdown.
    pub shutdown_timeout: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self { max_pending: 0, shutdown_timeout: Duration::from_secs(5) }
    }
}

/// Counters kept by the worker.
#[derive(Debug, Default)]
pub struct DispatchStats {
    scheduled: AtomicU64,
    started: AtomicU64,
    skipped: AtomicU64,
    rejected: AtomicU64,
}

/// Point-in-time copy of [`DispatchStats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DispatchStatsSnapshot {
    pub scheduled: u64,
    pub started: u64,
    pub skipped: u64,
    pub rejected: u64,
}

impl DispatchStats {
    fn record_scheduled(&self) {
        self.scheduled.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_started(&self) {
        self.started.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_skipped(&self) {
        self.skipped.fetch_add(1, Ordering::Relaxed);
    }

    fn record_rejected(&self) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> DispatchStatsSnapshot {
        DispatchStatsSnapshot {
            scheduled: self.scheduled.load(Ordering::Relaxed),
            started: self.started.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
        }
    }
}

struct Inner {
    id: u64,
    tx: mpsc::UnboundedSender<QueuedTask>,
    nested_tx: mpsc::UnboundedSender<QueuedTask>,
    clock: AtomicU64,
    pending: Arc<AtomicUsize>,
    config: DispatcherConfig,
    coordinator: Arc<ShutdownCoordinator>,
    stats: Arc<DispatchStats>,
    drain: CancellationToken,
    stop: CancellationToken,
    worker: Mutex<Option<JoinHandle<()>>>,
}

/// Handle to a session's dispatcher. Clones share the same session.
#[derive(Clone)]
pub struct SessionDispatcher {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for SessionDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionDispatcher")
            .field("id", &self.inner.id)
            .field("clock", &self.clock())
            .field("state", &self.state())
            .finish()
    }
}

impl SessionDispatcher {
    /// Start a dispatcher on the ambient tokio runtime.
    pub fn spawn(config: DispatcherConfig) -> Self {
        let id = NEXT_DISPATCHER_ID.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        let (nested_tx, nested_rx) = mpsc::unbounded_channel();
        let pending = Arc::new(AtomicUsize::new(0));
        let coordinator = Arc::new(ShutdownCoordinator::new());
        let stats = Arc::new(DispatchStats::default());
        let drain = CancellationToken::new();
        let stop = CancellationToken::new();

        let handle = worker::spawn_worker(worker::WorkerContext {
            id,
            rx,
            nested_rx,
            pending: Arc::clone(&pending),
            coordinator: Arc::clone(&coordinator),
            stats: Arc::clone(&stats),
            drain: drain.clone(),
            stop: stop.clone(),
        });
        tracing::info!(dispatcher = id, max_pending = config.max_pending, "dispatcher: started");

        Self {
            inner: Arc::new(Inner {
                id,
                tx,
                nested_tx,
                clock: AtomicU64::new(0),
                pending,
                config,
                coordinator,
                stats,
                drain,
                stop,
                worker: Mutex::new(Some(handle)),
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Current logical clock tick. Every scheduled task takes the next tick.
    pub fn clock(&self) -> u64 {
        self.inner.clock.load(Ordering::Acquire)
    }

    pub fn state(&self) -> ShutdownState {
        self.inner.coordinator.state()
    }

    /// True while called from a task running on this dispatcher.
    pub fn is_current(&self) -> bool {
        worker::current_dispatcher() == Some(self.inner.id)
    }

    /// Number of queued tasks that have not started yet.
    pub fn pending(&self) -> usize {
        self.inner.pending.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> DispatchStatsSnapshot {
        self.inner.stats.snapshot()
    }

    /// Schedule `task` on this session.
    ///
    /// Tasks start in submission order. Once started, a task may interleave
    /// with other non-exclusive tasks where it awaits.
    ///
    /// The returned token settles with the task's result, with `Cancelled`
    /// if it was cancelled before starting, or with `SessionClosed` /
    /// `QueueFull` if it could not be queued at all.
    pub fn schedule<T, F, Fut>(&self, task: F) -> CompletionToken<T>
    where
        T: Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, DebugError>> + Send + 'static,
    {
        self.enqueue(false, task)
    }

    /// Schedule `task` to run alone.
    ///
    /// It starts once every earlier task has finished, and no later task
    /// starts before it finishes. Tasks scheduled from inside a running task
    /// are part of that task's turn and are never held back.
    pub fn schedule_exclusive<T, F, Fut>(&self, task: F) -> CompletionToken<T>
    where
        T: Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, DebugError>> + Send + 'static,
    {
        self.enqueue(true, task)
    }

    fn enqueue<T, F, Fut>(&self, exclusive: bool, task: F) -> CompletionToken<T>
    where
        T: Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, DebugError>> + Send + 'static,
    {
        let seq = self.inner.clock.fetch_add(1, Ordering::AcqRel) + 1;
        let (completer, token) = token::bound(seq, Some(self.clone()));
        let task = QueuedTask::new(seq, exclusive, token.cancel_flag(), completer, task);

        if !self.inner.coordinator.is_accepting() {
            self.inner.stats.record_rejected();
            tracing::debug!(dispatcher = self.inner.id, seq, "dispatcher: rejected, session closed");
            task.reject(DebugError::SessionClosed);
            return token;
        }

        let max = self.inner.config.max_pending;
        if max > 0 && self.pending() >= max {
            self.inner.stats.record_rejected();
            task.reject(DebugError::QueueFull { max });
            return token;
        }

        self.inner.pending.fetch_add(1, Ordering::AcqRel);
        let queue = if self.is_current() { &self.inner.nested_tx } else { &self.inner.tx };
        if let Err(mpsc::error::SendError(task)) = queue.send(task) {
            self.inner.pending.fetch_sub(1, Ordering::AcqRel);
            self.inner.stats.record_rejected();
            task.reject(DebugError::SessionClosed);
            return token;
        }
        self.inner.stats.record_scheduled();
        token
    }

    /// Schedule `task` and await its result.
    pub async fn submit<T, F, Fut>(&self, task: F) -> Result<T, DebugError>
    where
        T: Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, DebugError>> + Send + 'static,
    {
        self.schedule(task).await
    }

    /// Schedule `task` and block the calling thread until it finishes.
    ///
    /// For synchronous callers outside the async runtime, or on a blocking
    /// thread of a multi-threaded one. Returns `Deadlock` when called from a
    /// task of this same dispatcher, or from anywhere on a current-thread
    /// runtime, since blocking there stalls the worker too.
    pub fn submit_and_wait<T, F, Fut>(&self, task: F) -> Result<T, DebugError>
    where
        T: Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, DebugError>> + Send + 'static,
    {
        if self.is_current() {
            tracing::error!(dispatcher = self.inner.id, "dispatcher: blocking wait on own thread");
            return Err(DebugError::Deadlock);
        }
        let current_thread = tokio::runtime::Handle::try_current()
            .is_ok_and(|handle| handle.runtime_flavor() == RuntimeFlavor::CurrentThread);
        if current_thread {
            tracing::error!(dispatcher = self.inner.id, "dispatcher: blocking wait on current-thread runtime");
            return Err(DebugError::Deadlock);
        }
        futures::executor::block_on(self.schedule(task))
    }

    /// Shut down with the configured grace period.
    pub async fn shutdown(&self) -> Result<ShutdownResult, DebugError> {
        self.shutdown_with_timeout(self.inner.config.shutdown_timeout).await
    }

    /// Stop accepting, cancel queued tasks, give in-flight tasks up to
    /// `grace` to finish, then abandon the rest.
    pub async fn shutdown_with_timeout(&self, grace: Duration) -> Result<ShutdownResult, DebugError> {
        if self.is_current() {
            return Err(DebugError::Deadlock);
        }
        self.inner.coordinator.begin_drain();
        self.inner.drain.cancel();

        let result = self.inner.coordinator.wait_for_drain(grace).await;
        self.inner.stop.cancel();

        let handle = self.inner.worker.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                tracing::error!(dispatcher = self.inner.id, error = %e, "dispatcher: worker panicked");
            }
        }
        self.inner.coordinator.mark_stopped();
        tracing::info!(dispatcher = self.inner.id, ?result, "dispatcher: stopped");
        Ok(result)
    }
}
