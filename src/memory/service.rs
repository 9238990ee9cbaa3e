//! Public memory surface of a session: get, set and fill.
//!
//! Parameters are validated on the caller's thread; a bad request yields an
//! already-failed token and never reaches the dispatcher. Everything else
//! runs as a dispatcher task, so cache state is only touched from the
//! session's single logical thread. Reads may overlap each other while they
//! wait on the target; anything that changes state is an exclusive task, so
//! a read scheduled after a write sees the write.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::Instrument;

use super::cache::{CacheConfig, CacheStats, MemoryCache};
use super::target::MemoryTarget;
use super::types::{request_range, ByteRange, ChangeNotification, ChangeOrigin, ContextId, MemoryByte};
use crate::dispatch::{CompletionToken, SessionDispatcher};
use crate::error::DebugError;
use crate::events::EventBus;
use crate::telemetry::{self, OperationSpan, SpanExt};

/// Memory service bound to one session.
#[derive(Clone)]
pub struct MemoryService {
    dispatcher: SessionDispatcher,
    events: Arc<EventBus<ChangeNotification>>,
    cache: MemoryCache,
}

impl std::fmt::Debug for MemoryService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryService")
            .field("dispatcher", &self.dispatcher.id())
            .field("cache", &self.cache)
            .finish()
    }
}

impl MemoryService {
    pub fn new(
        dispatcher: SessionDispatcher,
        events: Arc<EventBus<ChangeNotification>>,
        target: Arc<dyn MemoryTarget>,
        config: CacheConfig,
    ) -> Self {
        Self { dispatcher, events, cache: MemoryCache::new(target, config) }
    }

    pub fn dispatcher(&self) -> &SessionDispatcher {
        &self.dispatcher
    }

    pub fn events(&self) -> &Arc<EventBus<ChangeNotification>> {
        &self.events
    }

    pub fn cache(&self) -> &MemoryCache {
        &self.cache
    }

    pub fn stats(&self) -> CacheStats {
        self.cache.stats()
    }

    /// Start serving `context`. Resolves false if it was already attached.
    pub fn attach_context(&self, context: ContextId) -> CompletionToken<bool> {
        let cache = self.cache.clone();
        self.dispatcher.schedule_exclusive(move || async move { Ok(cache.attach(context)) })
    }

    /// Stop serving `context` and drop its cached blocks.
    pub fn detach_context(&self, context: ContextId) -> CompletionToken<bool> {
        let cache = self.cache.clone();
        self.dispatcher.schedule_exclusive(move || async move { Ok(cache.detach(context)) })
    }

    /// Drop everything cached for `context` without notifying subscribers.
    ///
    /// Resolves with the number of units dropped.
    pub fn flush_cache(&self, context: ContextId) -> CompletionToken<u64> {
        let cache = self.cache.clone();
        self.dispatcher.schedule_exclusive(move || async move {
            cache.ensure_attached(context)?;
            Ok(cache.flush(context))
        })
    }

    /// Read `count` units of `word_size` bytes at `address + offset`.
    pub fn get(
        &self,
        context: ContextId,
        address: u64,
        offset: i64,
        word_size: u32,
        count: i64,
    ) -> CompletionToken<Vec<MemoryByte>> {
        let range = match request_range(context, address, offset, word_size, count) {
            Ok(range) => range,
            Err(e) => return self.rejected("get", context, address, e),
        };
        let cache = self.cache.clone();
        let span = OperationSpan::new("get", context, address, count as u64);
        self.dispatcher.schedule(move || {
            let op_span = span.clone();
            async move {
                let result = match range {
                    Some(range) => cache.read(range).await,
                    None => cache.ensure_attached(context).map(|()| Vec::new()),
                };
                op_span.record_result(&result);
                result
            }
            .instrument(span)
        })
    }

    /// Write `buffer` to `count` units of `word_size` bytes at
    /// `address + offset`.
    ///
    /// The token resolves after subscribers have seen the change
    /// notification.
    pub fn set(
        &self,
        context: ContextId,
        address: u64,
        offset: i64,
        word_size: u32,
        count: i64,
        buffer: &[u8],
    ) -> CompletionToken<()> {
        let range = match request_range(context, address, offset, word_size, count) {
            Ok(range) => range,
            Err(e) => return self.rejected("set", context, address, e),
        };
        let data = match range {
            Some(range) if buffer.len() < range.byte_len() => {
                let e = DebugError::BufferTooShort { required: range.byte_len(), actual: buffer.len() };
                return self.rejected("set", context, address, e);
            }
            Some(range) => buffer[..range.byte_len()].to_vec(),
            None => Vec::new(),
        };
        self.mutate("set", context, address, count as u64, range, data)
    }

    /// Write `pattern` `count` times in a row starting at `address + offset`.
    ///
    /// The pattern is used in whole units; trailing bytes that do not make
    /// up a unit are ignored.
    pub fn fill(
        &self,
        context: ContextId,
        address: u64,
        offset: i64,
        word_size: u32,
        count: i64,
        pattern: &[u8],
    ) -> CompletionToken<()> {
        let range = match fill_range(context, address, offset, word_size, count, pattern) {
            Ok(range) => range,
            Err(e) => return self.rejected("fill", context, address, e),
        };
        let data = match range {
            Some(range) => {
                let unit_bytes = pattern.len() - pattern.len() % word_size as usize;
                pattern[..unit_bytes].iter().copied().cycle().take(range.byte_len()).collect()
            }
            None => Vec::new(),
        };
        self.mutate("fill", context, address, count as u64, range, data)
    }

    /// Apply a change reported by the target, then pass it on to subscribers.
    ///
    /// Notifications for contexts that are not attached are ignored.
    pub fn on_change_notification(&self, notification: ChangeNotification) -> CompletionToken<()> {
        let cache = self.cache.clone();
        let events = Arc::clone(&self.events);
        self.dispatcher.schedule_exclusive(move || async move {
            let context = notification.context;
            if !cache.is_attached(context) {
                tracing::debug!(%context, "memory: ignoring change for unknown context");
                return Ok(());
            }
            cache.invalidate(context, notification.word_size, &notification.scope);
            let notification = ChangeNotification { origin: ChangeOrigin::Target, ..notification };
            deliver(&events, &notification);
            Ok(())
        })
    }

    /// Apply every notification from `changes` in arrival order.
    ///
    /// The pump stops when the sender side closes or the session shuts down.
    pub fn spawn_event_pump(&self, mut changes: mpsc::Receiver<ChangeNotification>) -> JoinHandle<()> {
        let service = self.clone();
        tokio::spawn(async move {
            while let Some(notification) = changes.recv().await {
                match service.on_change_notification(notification).await {
                    Ok(()) => {}
                    Err(e) if e.is_fatal() => {
                        tracing::info!(error = %e, "memory: event pump stopping");
                        break;
                    }
                    Err(e) => tracing::warn!(error = %e, "memory: change notification not applied"),
                }
            }
        })
    }

    fn mutate(
        &self,
        op: &'static str,
        context: ContextId,
        address: u64,
        count: u64,
        range: Option<ByteRange>,
        data: Vec<u8>,
    ) -> CompletionToken<()> {
        let cache = self.cache.clone();
        let events = Arc::clone(&self.events);
        let span = OperationSpan::new(op, context, address, count);
        self.dispatcher.schedule_exclusive(move || {
            let op_span = span.clone();
            async move {
                let result = match range {
                    Some(range) => cache
                        .write(range, &data)
                        .await
                        .map(|()| deliver(&events, &ChangeNotification::overwritten(&range))),
                    None => cache.ensure_attached(context),
                };
                op_span.record_result(&result);
                result
            }
            .instrument(span)
        })
    }

    fn rejected<T>(&self, op: &'static str, context: ContextId, address: u64, error: DebugError) -> CompletionToken<T> {
        tracing::debug!(op, %context, address, error = %error, "memory: request rejected");
        CompletionToken::ready_on(&self.dispatcher, Err(error))
    }
}

/// Hand `notification` to every subscriber on the running task.
fn deliver(events: &EventBus<ChangeNotification>, notification: &ChangeNotification) {
    let origin = match notification.origin {
        ChangeOrigin::Service => "service",
        ChangeOrigin::Target => "target",
    };
    telemetry::record_change_notification(origin);
    let handlers = events.emit(notification);
    tracing::trace!(origin, handlers, "memory: change notification delivered");
}

/// Unit range covered by `count` repetitions of `pattern`.
fn fill_range(
    context: ContextId,
    address: u64,
    offset: i64,
    word_size: u32,
    count: i64,
    pattern: &[u8],
) -> Result<Option<ByteRange>, DebugError> {
    if word_size < 1 {
        return Err(DebugError::InvalidWordSize);
    }
    if count < 0 {
        return Err(DebugError::InvalidCount);
    }
    if pattern.is_empty() {
        return Err(DebugError::EmptyPattern);
    }
    let units_per_pattern = (pattern.len() / word_size as usize) as i64;
    if units_per_pattern == 0 {
        return Err(DebugError::BufferTooShort { required: word_size as usize, actual: pattern.len() });
    }
    let units = count.checked_mul(units_per_pattern).ok_or(DebugError::AddressOverflow)?;
    request_range(context, address, offset, word_size, units)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fill_range_counts_whole_pattern_units() {
        let ctx = ContextId::new();
        let range = fill_range(ctx, 0, 0, 2, 3, &[1, 2, 3, 4, 5]).unwrap().unwrap();
        assert_eq!(range.count, 6);
        assert_eq!(fill_range(ctx, 0, 0, 1, 0, &[1]), Ok(None));
    }

    #[test]
    fn fill_range_validation_order() {
        let ctx = ContextId::new();
        assert_eq!(fill_range(ctx, 0, 0, 0, -1, &[]), Err(DebugError::InvalidWordSize));
        assert_eq!(fill_range(ctx, 0, 0, 1, -1, &[]), Err(DebugError::InvalidCount));
        assert_eq!(fill_range(ctx, 0, 0, 1, 1, &[]), Err(DebugError::EmptyPattern));
        assert_eq!(
            fill_range(ctx, 0, 0, 4, 1, &[1, 2]),
            Err(DebugError::BufferTooShort { required: 4, actual: 2 })
        );
        assert_eq!(fill_range(ctx, 0, 0, 1, i64::MAX, &[1, 2]), Err(DebugError::AddressOverflow));
    }
}
