//! Error types for capture operations
//!
//! Every failure the core can raise maps onto one [`ErrorCategory`], which
//! decides how callers react: configuration problems fail fast before any
//! phase starts, shutdown errors are expected during an orderly stop, and
//! ordering violations indicate a bug and are never corrected silently.

use crate::offset::Offset;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error categories for metrics and alerting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Invalid or unsupported configuration (fatal, raised before start)
    Configuration,
    /// I/O against the upstream database after its own retries ran out
    Upstream,
    /// Queue closed while an operation was in progress
    Shutdown,
    /// Lifecycle operation exceeded its configured wait
    Timeout,
    /// Offset regression or buffering misuse (programming error)
    Ordering,
    /// Transformation or consumer failure during delivery
    Delivery,
    /// Serialization errors (JSON, YAML)
    Serialization,
    /// Other/unknown errors
    Other,
}

/// Capture-specific errors
#[derive(Error, Debug)]
pub enum CaptureError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Transient I/O error reported by the upstream collaborator
    #[error("Transient I/O error: {0}")]
    TransientIo(String),

    /// Unrecoverable read/connect error from a phase source
    #[error("Source error: {0}")]
    Source(String),

    /// The event queue has been closed
    #[error("Event queue shut down")]
    Shutdown,

    /// Timeout error
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Offset regression or buffering misuse
    #[error("Ordering violation: {0}")]
    OrderingViolation(String),

    /// Record transformation failed
    #[error("Transform error: {0}")]
    Transform(String),

    /// Downstream consumer rejected a record
    #[error("Consumer error: {0}")]
    Consumer(String),

    /// Invalid state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML configuration parse error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl CaptureError {
    /// Create a new config error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a new transient I/O error
    pub fn transient_io(msg: impl Into<String>) -> Self {
        Self::TransientIo(msg.into())
    }

    /// Create a new source error
    pub fn source(msg: impl Into<String>) -> Self {
        Self::Source(msg.into())
    }

    /// Create a timeout error
    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::Timeout(msg.into())
    }

    /// Create an ordering violation
    pub fn ordering_violation(msg: impl Into<String>) -> Self {
        Self::OrderingViolation(msg.into())
    }

    /// Create a transform error
    pub fn transform(msg: impl Into<String>) -> Self {
        Self::Transform(msg.into())
    }

    /// Create a consumer error
    pub fn consumer(msg: impl Into<String>) -> Self {
        Self::Consumer(msg.into())
    }

    /// Create an invalid state error
    pub fn invalid_state(msg: impl Into<String>) -> Self {
        Self::InvalidState(msg.into())
    }

    /// Check if this error is expected during an orderly stop.
    pub fn is_shutdown(&self) -> bool {
        matches!(self, Self::Shutdown)
    }

    /// Check if this error is retriable.
    ///
    /// Returns true for transient errors that may succeed on retry.
    pub fn is_retriable(&self) -> bool {
        match self {
            Self::TransientIo(_) | Self::Timeout(_) => true,
            Self::Transform(_) | Self::Consumer(_) => true,
            Self::Io(e) => {
                use std::io::ErrorKind;
                matches!(
                    e.kind(),
                    ErrorKind::ConnectionReset
                        | ErrorKind::ConnectionAborted
                        | ErrorKind::TimedOut
                        | ErrorKind::Interrupted
                )
            }
            Self::Config(_)
            | Self::Source(_)
            | Self::Shutdown
            | Self::OrderingViolation(_)
            | Self::InvalidState(_)
            | Self::Json(_)
            | Self::Yaml(_) => false,
        }
    }

    /// Get the error category for metrics and alerting.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Config(_) => ErrorCategory::Configuration,
            Self::TransientIo(_) | Self::Source(_) | Self::Io(_) => ErrorCategory::Upstream,
            Self::Shutdown => ErrorCategory::Shutdown,
            Self::Timeout(_) => ErrorCategory::Timeout,
            Self::OrderingViolation(_) => ErrorCategory::Ordering,
            Self::Transform(_) | Self::Consumer(_) => ErrorCategory::Delivery,
            Self::Json(_) | Self::Yaml(_) => ErrorCategory::Serialization,
            Self::InvalidState(_) => ErrorCategory::Other,
        }
    }

    /// Get a metric-safe error code.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Config(_) => "config_error",
            Self::TransientIo(_) => "transient_io",
            Self::Source(_) => "source_error",
            Self::Shutdown => "shutdown",
            Self::Timeout(_) => "timeout",
            Self::OrderingViolation(_) => "ordering_violation",
            Self::Transform(_) => "transform_error",
            Self::Consumer(_) => "consumer_error",
            Self::InvalidState(_) => "invalid_state",
            Self::Json(_) => "json_error",
            Self::Yaml(_) => "yaml_error",
            Self::Io(_) => "io_error",
        }
    }
}

/// Fatal capture failure surfaced to the caller of the orchestrator.
///
/// Carries the last offset admitted to the event queue so a restart can
/// resume without a gap (at worst with benign duplication).
#[derive(Error, Debug)]
#[error("capture failed (last offset: {}): {cause}", offset.as_ref().map(ToString::to_string).unwrap_or_else(|| "none".to_string()))]
pub struct CaptureFailure {
    /// Root cause
    #[source]
    pub cause: CaptureError,
    /// Last admitted offset, if any event was admitted
    pub offset: Option<Offset>,
}

impl CaptureFailure {
    pub fn new(cause: CaptureError, offset: Option<Offset>) -> Self {
        Self { cause, offset }
    }
}

/// Result type for capture operations
pub type Result<T> = std::result::Result<T, CaptureError>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::offset::LogPosition;

    #[test]
    fn test_error_display() {
        let err = CaptureError::config("read-only requires GTIDs");
        assert!(err.to_string().contains("Configuration error"));
        assert!(err.to_string().contains("read-only requires GTIDs"));
    }

    #[test]
    fn test_error_is_retriable() {
        assert!(CaptureError::transient_io("reset").is_retriable());
        assert!(CaptureError::timeout("5s").is_retriable());
        assert!(CaptureError::transform("bad field").is_retriable());

        assert!(!CaptureError::config("bad").is_retriable());
        assert!(!CaptureError::Shutdown.is_retriable());
        assert!(!CaptureError::ordering_violation("regress").is_retriable());
    }

    #[test]
    fn test_error_category() {
        assert_eq!(
            CaptureError::config("x").category(),
            ErrorCategory::Configuration
        );
        assert_eq!(CaptureError::Shutdown.category(), ErrorCategory::Shutdown);
        assert_eq!(
            CaptureError::ordering_violation("x").category(),
            ErrorCategory::Ordering
        );
        assert_eq!(
            CaptureError::source("x").category(),
            ErrorCategory::Upstream
        );
        assert_eq!(
            CaptureError::consumer("x").category(),
            ErrorCategory::Delivery
        );
    }

    #[test]
    fn test_error_code() {
        assert_eq!(CaptureError::Shutdown.error_code(), "shutdown");
        assert_eq!(CaptureError::timeout("x").error_code(), "timeout");
        assert!(CaptureError::Shutdown.is_shutdown());
        assert!(!CaptureError::timeout("x").is_shutdown());
    }

    #[test]
    fn test_failure_surfaces_offset() {
        let failure = CaptureFailure::new(
            CaptureError::source("connection lost"),
            Some(Offset::Log(LogPosition::new("mysql-bin.000003", 154))),
        );
        let msg = failure.to_string();
        assert!(msg.contains("mysql-bin.000003:154"));
        assert!(msg.contains("connection lost"));

        let failure = CaptureFailure::new(CaptureError::Shutdown, None);
        assert!(failure.to_string().contains("none"));
    }
}
