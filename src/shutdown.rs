//! Graceful shutdown coordination for session dispatchers.
//!
//! Provides a state machine that gates admission of new tasks and tracks
//! in-flight work so a dispatcher can drain before it stops.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::Notify;

/// Shutdown state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownState {
    Running,
    Draining,
    Stopped,
}

/// Result of a shutdown operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownResult {
    Complete,
    Timeout { remaining: u32 },
}

/// Coordinates admission and draining for one dispatcher.
pub struct ShutdownCoordinator {
    state: RwLock<ShutdownState>,
    in_flight: Arc<AtomicU32>,
    notify: Arc<Notify>,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(ShutdownState::Running),
            in_flight: Arc::new(AtomicU32::new(0)),
            notify: Arc::new(Notify::new()),
        }
    }

    /// Get current shutdown state.
    pub fn state(&self) -> ShutdownState {
        *self.state.read()
    }

    /// Check if accepting new tasks.
    pub fn is_accepting(&self) -> bool {
        self.state() == ShutdownState::Running
    }

    /// Track a newly submitted unit of work. Returns None if shutting down.
    pub fn track(&self) -> Option<ShutdownGuard> {
        if !self.is_accepting() {
            return None;
        }
        Some(self.enter())
    }

    /// Track work that was already admitted, regardless of state.
    pub fn enter(&self) -> ShutdownGuard {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        ShutdownGuard {
            counter: self.in_flight.clone(),
            notify: self.notify.clone(),
        }
    }

    /// Current in-flight count.
    pub fn in_flight_count(&self) -> u32 {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Stop accepting. Returns false if shutdown had already begun.
    pub fn begin_drain(&self) -> bool {
        let mut state = self.state.write();
        if *state != ShutdownState::Running {
            return false;
        }
        *state = ShutdownState::Draining;
        true
    }

    /// Mark the coordinator as fully stopped.
    pub fn mark_stopped(&self) {
        *self.state.write() = ShutdownState::Stopped;
    }

    /// Initiate shutdown: stop accepting, wait for drain, then stop.
    pub async fn initiate(&self, timeout: Duration) -> ShutdownResult {
        self.begin_drain();
        let result = self.wait_for_drain(timeout).await;
        self.mark_stopped();
        result
    }

    /// Wait until every tracked unit of work has finished or `timeout` passes.
    pub async fn wait_for_drain(&self, timeout: Duration) -> ShutdownResult {
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            // Register interest before re-checking so a guard dropped in
            // between cannot be missed.
            let notified = self.notify.notified();
            let count = self.in_flight_count();
            if count == 0 {
                return ShutdownResult::Complete;
            }

            let remaining_time = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining_time.is_zero() {
                return ShutdownResult::Timeout { remaining: count };
            }

            tokio::select! {
                _ = notified => continue,
                _ = tokio::time::sleep(remaining_time) => {
                    let final_count = self.in_flight_count();
                    if final_count == 0 {
                        return ShutdownResult::Complete;
                    }
                    return ShutdownResult::Timeout { remaining: final_count };
                }
            }
        }
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

/// RAII guard for in-flight tracking.
pub struct ShutdownGuard {
    counter: Arc<AtomicU32>,
    notify: Arc<Notify>,
}

impl Drop for ShutdownGuard {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::SeqCst);
        self.notify.notify_waiters();
    }
}
