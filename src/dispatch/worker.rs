//! Single worker loop: admit queued tasks and drive them to completion.
//!
//! Every task of a session is polled from inside this one tokio task, so no
//! two tasks ever run in parallel. Plain tasks interleave only where they
//! await. An exclusive task waits for the in-flight set to empty, then runs
//! alone; tasks it schedules itself still start, as part of its turn.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::stream::FuturesUnordered;
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::queue::QueuedTask;
use super::DispatchStats;
use crate::error::DebugError;
use crate::shutdown::ShutdownCoordinator;
use crate::telemetry;

tokio::task_local! {
    static ACTIVE_DISPATCHER: u64;
}

/// Id of the dispatcher whose worker is polling the current task, if any.
pub(crate) fn current_dispatcher() -> Option<u64> {
    ACTIVE_DISPATCHER.try_with(|id| *id).ok()
}

pub(crate) struct WorkerContext {
    pub id: u64,
    pub rx: mpsc::UnboundedReceiver<QueuedTask>,
    /// Tasks scheduled from inside running tasks; admitted even past a barrier.
    pub nested_rx: mpsc::UnboundedReceiver<QueuedTask>,
    pub pending: Arc<AtomicUsize>,
    pub coordinator: Arc<ShutdownCoordinator>,
    pub stats: Arc<DispatchStats>,
    /// Stop admitting; reject everything still queued.
    pub drain: CancellationToken,
    /// Abandon tasks that are still in flight.
    pub stop: CancellationToken,
}

/// Spawn the worker loop. Returns a handle for shutdown.
pub(crate) fn spawn_worker(ctx: WorkerContext) -> JoinHandle<()> {
    let id = ctx.id;
    tokio::spawn(ACTIVE_DISPATCHER.scope(id, worker_loop(ctx)))
}

async fn worker_loop(mut ctx: WorkerContext) {
    tracing::debug!(dispatcher = ctx.id, "dispatcher: worker started");
    let mut in_flight: FuturesUnordered<BoxFuture<'static, ()>> = FuturesUnordered::new();
    // An exclusive task is running; nothing else is admitted.
    let mut exclusive = false;
    // An exclusive task waiting for the tasks ahead of it to finish.
    let mut held: Option<QueuedTask> = None;

    loop {
        tokio::select! {
            biased;
            Some(()) = in_flight.next(), if !in_flight.is_empty() => {
                if in_flight.is_empty() {
                    exclusive = false;
                    if let Some(task) = held.take() {
                        exclusive = start(&ctx, task, &mut in_flight);
                    }
                }
            }
            () = ctx.drain.cancelled() => {
                tracing::info!(dispatcher = ctx.id, "dispatcher: drain signal received");
                break;
            }
            Some(task) = ctx.nested_rx.recv() => {
                ctx.pending.fetch_sub(1, Ordering::AcqRel);
                start(&ctx, task, &mut in_flight);
            }
            task = ctx.rx.recv(), if held.is_none() && !exclusive => match task {
                Some(task) => {
                    ctx.pending.fetch_sub(1, Ordering::AcqRel);
                    if task.exclusive && !in_flight.is_empty() {
                        held = Some(task);
                    } else {
                        let is_exclusive = task.exclusive;
                        exclusive = start(&ctx, task, &mut in_flight) && is_exclusive;
                    }
                }
                None => {
                    tracing::debug!(dispatcher = ctx.id, "dispatcher: all handles dropped");
                    break;
                }
            }
        }
    }

    if let Some(task) = held.take() {
        ctx.stats.record_skipped();
        task.reject(DebugError::Cancelled);
    }
    reject_queued(&mut ctx);
    finish_in_flight(&ctx, &mut in_flight).await;
    tracing::debug!(dispatcher = ctx.id, "dispatcher: worker stopped");
}

/// Start `task` unless it was cancelled. Returns true if it was started.
fn start(
    ctx: &WorkerContext,
    task: QueuedTask,
    in_flight: &mut FuturesUnordered<BoxFuture<'static, ()>>,
) -> bool {
    if task.is_cancelled() {
        tracing::debug!(dispatcher = ctx.id, seq = task.seq, "dispatcher: skipping cancelled task");
        ctx.stats.record_skipped();
        telemetry::record_task_skipped();
        task.reject(DebugError::Cancelled);
        return false;
    }

    let guard = ctx.coordinator.enter();
    match task.start() {
        Some(run) => {
            ctx.stats.record_started();
            in_flight.push(Box::pin(async move {
                run.await;
                drop(guard);
            }));
            true
        }
        None => false,
    }
}

/// Fail every task that was queued but never started.
fn reject_queued(ctx: &mut WorkerContext) {
    ctx.rx.close();
    ctx.nested_rx.close();
    let mut rejected = 0u64;
    while let Ok(task) = ctx.nested_rx.try_recv().or_else(|_| ctx.rx.try_recv()) {
        ctx.pending.fetch_sub(1, Ordering::AcqRel);
        ctx.stats.record_skipped();
        task.reject(DebugError::Cancelled);
        rejected += 1;
    }
    if rejected > 0 {
        tracing::info!(dispatcher = ctx.id, rejected, "dispatcher: cancelled queued tasks");
    }
}

async fn finish_in_flight(
    ctx: &WorkerContext,
    in_flight: &mut FuturesUnordered<BoxFuture<'static, ()>>,
) {
    while !in_flight.is_empty() {
        tokio::select! {
            biased;
            () = ctx.stop.cancelled() => {
                tracing::warn!(
                    dispatcher = ctx.id,
                    abandoned = in_flight.len(),
                    "dispatcher: abandoning in-flight tasks",
                );
                // Dropping the futures drops their completers; the tokens
                // resolve as cancelled.
                in_flight.clear();
                return;
            }
            _ = in_flight.next() => {}
        }
    }
}

#[cfg(test)]
#[path = "worker_tests.rs"]
mod tests;
