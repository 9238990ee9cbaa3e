//! Telemetry: structured logging, operation spans and metric counters.

mod logging;
mod metrics;
mod spans;

pub use logging::{init_logging, LogConfig, LogError, LogFormat};
pub use metrics::{
    record_cache_units, record_change_notification, record_fetches, record_task_skipped,
};
pub use spans::{OperationSpan, SpanExt};
