//! Error types for DBG-CORE services.
//!
//! Every failure reaches the completion token of the call that caused it.
//! Parameter errors are detected before any downstream work is issued.

use thiserror::Error;

/// Errors surfaced by the dispatcher, the memory cache and the memory service.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DebugError {
    #[error("Word size not supported (< 1)")]
    InvalidWordSize,

    #[error("Invalid count (< 0)")]
    InvalidCount,

    #[error("Buffer too short: need {required} bytes, got {actual}")]
    BufferTooShort { required: usize, actual: usize },

    #[error("Empty pattern")]
    EmptyPattern,

    #[error("Unknown context type")]
    UnknownContext,

    #[error("Address range exceeds the target address space")]
    AddressOverflow,

    #[error("{0}")]
    Transport(String),

    #[error("Request cancelled")]
    Cancelled,

    #[error("Session closed")]
    SessionClosed,

    #[error("Deadlock: blocking wait issued from the session's own dispatcher")]
    Deadlock,

    #[error("Dispatcher queue full: {max} pending tasks")]
    QueueFull { max: usize },
}

impl DebugError {
    /// Convenience constructor for downstream communication failures.
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport(message.into())
    }

    /// Returns true for errors raised by parameter validation.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::InvalidWordSize
                | Self::InvalidCount
                | Self::BufferTooShort { .. }
                | Self::EmptyPattern
                | Self::UnknownContext
                | Self::AddressOverflow
        )
    }

    /// Returns true if the session can no longer serve this caller.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::SessionClosed | Self::Deadlock)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_errors_are_classified() {
        assert!(DebugError::InvalidWordSize.is_validation());
        assert!(DebugError::BufferTooShort { required: 4, actual: 1 }.is_validation());
        assert!(!DebugError::transport("lost connection").is_validation());
        assert!(!DebugError::Cancelled.is_validation());
    }

    #[test]
    fn transport_message_passes_through() {
        let err = DebugError::transport("Cannot access memory at address 0x0");
        assert_eq!(err.to_string(), "Cannot access memory at address 0x0");
    }

    #[test]
    fn fatal_errors() {
        assert!(DebugError::SessionClosed.is_fatal());
        assert!(DebugError::Deadlock.is_fatal());
        assert!(!DebugError::QueueFull { max: 1 }.is_fatal());
    }
}
