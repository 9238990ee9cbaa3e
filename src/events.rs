//! In-session publish/subscribe.
//!
//! Handlers run synchronously, in subscription order, on the session's
//! dispatcher. `publish` delivers as an exclusive dispatcher task; code that
//! already runs on the dispatcher emits inline, so its notification is seen
//! before the task that caused it resolves.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::dispatch::{CompletionToken, SessionDispatcher};

/// Identifies one subscription for [`EventBus::unsubscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Handler<E> = Arc<dyn Fn(&E) + Send + Sync>;

/// Publish/subscribe bus bound to one session dispatcher.
pub struct EventBus<E> {
    dispatcher: SessionDispatcher,
    handlers: Arc<Mutex<Vec<(SubscriptionId, Handler<E>)>>>,
    next_id: AtomicU64,
}

impl<E> EventBus<E>
where
    E: Send + Sync + 'static,
{
    pub fn new(dispatcher: SessionDispatcher) -> Self {
        Self {
            dispatcher,
            handlers: Arc::new(Mutex::new(Vec::new())),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register a handler. It sees every event whose delivery starts after
    /// this call.
    pub fn subscribe<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.handlers.lock().push((id, Arc::new(handler)));
        id
    }

    /// Remove a handler. Returns false if it was not registered.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut handlers = self.handlers.lock();
        let before = handlers.len();
        handlers.retain(|(sid, _)| *sid != id);
        handlers.len() != before
    }

    pub fn subscriber_count(&self) -> usize {
        self.handlers.lock().len()
    }

    /// Deliver `event` to all subscribers on the dispatcher.
    ///
    /// The token resolves with the number of handlers invoked.
    pub fn publish(&self, event: E) -> CompletionToken<usize> {
        let handlers = Arc::clone(&self.handlers);
        self.dispatcher
            .schedule_exclusive(move || async move { Ok(deliver(&handlers, &event)) })
    }

    /// Deliver `event` right now, on the calling task.
    ///
    /// Only for code already running on the bus's dispatcher.
    pub(crate) fn emit(&self, event: &E) -> usize {
        debug_assert!(self.dispatcher.is_current(), "emit off the dispatcher");
        deliver(&self.handlers, event)
    }
}

fn deliver<E>(handlers: &Mutex<Vec<(SubscriptionId, Handler<E>)>>, event: &E) -> usize {
    // Snapshot so a handler may (un)subscribe without deadlocking.
    let snapshot: Vec<Handler<E>> = handlers.lock().iter().map(|(_, h)| Arc::clone(h)).collect();
    for handler in &snapshot {
        handler(event);
    }
    snapshot.len()
}
