//! Counters recorded through the `metrics` facade.
//!
//! No recorder is installed here; an embedding application chooses the
//! exporter. Without one, every call is a no-op.

/// A queued task was skipped because its token was cancelled.
pub fn record_task_skipped() {
    metrics::counter!("dbg_core_tasks_skipped_total").increment(1);
}

/// Downstream reads issued by the cache.
pub fn record_fetches(count: u64) {
    metrics::counter!("dbg_core_cache_fetch_total").increment(count);
}

/// Units of one read served from cache and units that had to be fetched.
pub fn record_cache_units(hits: u64, misses: u64) {
    metrics::counter!("dbg_core_cache_hit_units_total").increment(hits);
    metrics::counter!("dbg_core_cache_miss_units_total").increment(misses);
}

/// A change notification was published to subscribers.
pub fn record_change_notification(origin: &'static str) {
    metrics::counter!("dbg_core_change_notifications_total", "origin" => origin).increment(1);
}
