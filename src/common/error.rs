//! Error types for the connector
//!
//! One taxonomy covers configuration problems, server preconditions,
//! recoverable per-table failures, fatal protocol failures, and
//! cooperative cancellation. The snapshot orchestrator decides which
//! transient failures it can absorb; everything else surfaces through the
//! reader's failure channel after cleanup has run.

use thiserror::Error;

/// Connector errors.
#[derive(Error, Debug)]
pub enum CdcError {
    /// Invalid or conflicting configuration. Reported before start; fatal.
    #[error("configuration error: {0}")]
    Config(String),

    /// The server cannot satisfy a snapshot invariant (binlog disabled,
    /// missing grants). Fatal.
    #[error("precondition failed: {0}")]
    Precondition(String),

    /// A single metadata read failed. The orchestrator may skip the
    /// affected object and continue.
    #[error("transient error: {0}")]
    Transient(String),

    /// A protocol step failed in a way that aborts the snapshot: lock
    /// acquisition, transaction start, or a row scan mid-table.
    #[error("fatal snapshot error: {0}")]
    Fatal(String),

    /// Cooperative stop observed. The reader reports `Stopped`, not
    /// `Failed`.
    #[error("snapshot cancelled")]
    Cancelled,

    /// Connection establishment failed.
    #[error("connection error: {0}")]
    Connection(String),

    /// A lifecycle operation was invoked in the wrong state.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl CdcError {
    /// Create a new configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a new precondition error
    pub fn precondition(msg: impl Into<String>) -> Self {
        Self::Precondition(msg.into())
    }

    /// Create a new transient error
    pub fn transient(msg: impl Into<String>) -> Self {
        Self::Transient(msg.into())
    }

    /// Create a new fatal error
    pub fn fatal(msg: impl Into<String>) -> Self {
        Self::Fatal(msg.into())
    }

    /// Create a new connection error
    pub fn connection(msg: impl Into<String>) -> Self {
        Self::Connection(msg.into())
    }

    /// Create a new invalid-state error
    pub fn invalid_state(msg: impl Into<String>) -> Self {
        Self::InvalidState(msg.into())
    }

    /// True for cooperative cancellation.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// True when the failure affected a single object and the caller may
    /// skip it.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    /// Escalate a transient failure observed at a step where the protocol
    /// cannot continue. Other variants pass through unchanged.
    pub fn into_fatal(self) -> Self {
        match self {
            Self::Transient(msg) => Self::Fatal(msg),
            other => other,
        }
    }

    /// Metric-safe error code.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Config(_) => "config_error",
            Self::Precondition(_) => "precondition_error",
            Self::Transient(_) => "transient_error",
            Self::Fatal(_) => "fatal_error",
            Self::Cancelled => "cancelled",
            Self::Connection(_) => "connection_error",
            Self::InvalidState(_) => "invalid_state",
            Self::Json(_) => "json_error",
            Self::Io(_) => "io_error",
        }
    }
}

/// Result type for connector operations
pub type Result<T> = std::result::Result<T, CdcError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = CdcError::precondition("binlog is not enabled");
        assert!(err.to_string().contains("precondition failed"));
        assert!(err.to_string().contains("binlog is not enabled"));
    }

    #[test]
    fn test_transient_escalation() {
        let err = CdcError::transient("SHOW TABLES failed").into_fatal();
        assert!(matches!(err, CdcError::Fatal(_)));

        // Non-transient variants pass through untouched.
        assert!(CdcError::Cancelled.into_fatal().is_cancellation());
        assert!(matches!(
            CdcError::config("bad").into_fatal(),
            CdcError::Config(_)
        ));
    }

    #[test]
    fn test_classification() {
        assert!(CdcError::Cancelled.is_cancellation());
        assert!(!CdcError::fatal("x").is_cancellation());
        assert!(CdcError::transient("x").is_transient());
        assert!(!CdcError::fatal("x").is_transient());
    }

    #[test]
    fn test_error_code() {
        assert_eq!(CdcError::Cancelled.error_code(), "cancelled");
        assert_eq!(CdcError::config("x").error_code(), "config_error");
        assert_eq!(
            CdcError::precondition("x").error_code(),
            "precondition_error"
        );
    }
}
