//! Span utilities and extension traits for memory operations.

use tracing::{info_span, Span};

use crate::memory::ContextId;

/// Extension trait for adding context to spans.
pub trait SpanExt {
    /// Record the result of an operation into the span.
    fn record_result<T, E>(&self, result: &Result<T, E>)
    where
        E: std::fmt::Display;
}

impl SpanExt for Span {
    fn record_result<T, E>(&self, result: &Result<T, E>)
    where
        E: std::fmt::Display,
    {
        match result {
            Ok(_) => {
                self.record("status", "ok");
            }
            Err(e) => {
                self.record("status", "error");
                self.record("error.message", e.to_string().as_str());
            }
        }
    }
}

/// Factory for memory operation spans.
pub struct OperationSpan;

impl OperationSpan {
    /// Create a `memory_op` span.
    ///
    /// `status` and `error.message` are filled in by
    /// [`SpanExt::record_result`].
    pub fn new(op: &'static str, context: ContextId, address: u64, count: u64) -> Span {
        info_span!(
            "memory_op",
            op,
            context = %context,
            address,
            count,
            status = tracing::field::Empty,
            error.message = tracing::field::Empty,
        )
    }
}
