//! Error types for the sync engine.

use thiserror::Error;
use vaultsync_protocol::Version;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Sentinel status synthesized for transport-level failures that never
/// produced an HTTP response (connection reset, DNS failure, abort).
pub const NETWORK_ERROR_STATUS: i32 = -1;

/// Errors that can occur during sync operations.
#[derive(Error, Debug)]
pub enum SyncError {
    /// The user is not logged in; the session must not start.
    #[error("not authenticated")]
    NotAuthenticated,

    /// The client has no network connectivity.
    #[error("network offline")]
    Offline,

    /// Client build is older than the server accepts. Fatal; surfaced to
    /// the user with an upgrade instruction.
    #[error("incompatible client version, server requires at least {required}")]
    Incompatible {
        /// Minimum version the server accepts.
        required: Version,
    },

    /// Internal unwind signal: the session must tear down and wait for an
    /// external restart. Never surfaced past the orchestrator.
    #[error("received network error, should disconnect")]
    ShouldDisconnect,

    /// A gateway call came back with a non-success envelope.
    #[error("gateway error: status {status}: {message}")]
    Gateway {
        /// Envelope status (HTTP status or the network sentinel).
        status: i32,
        /// Status text from the envelope.
        message: String,
    },

    /// The local store rejected a read or write. Surfaced unchanged.
    #[error("local store error: {0}")]
    Store(String),

    /// Payload encryption or decryption failed.
    #[error("crypto error: {0}")]
    Crypto(String),

    /// The realtime channel failed.
    #[error("realtime channel error: {0}")]
    Channel(String),

    /// An operation exceeded its time ceiling.
    #[error("operation timed out")]
    Timeout,

    /// A session for this scope is already running.
    #[error("session already active for {0}")]
    SessionActive(String),

    /// The session was shut down while the operation was in flight.
    #[error("session cancelled")]
    Cancelled,
}

impl SyncError {
    /// Creates a gateway error from an envelope.
    pub fn gateway(status: i32, message: impl Into<String>) -> Self {
        SyncError::Gateway {
            status,
            message: message.into(),
        }
    }

    /// Returns true if this error tears the whole session down rather
    /// than retrying in place.
    pub fn is_disconnect(&self) -> bool {
        matches!(
            self,
            SyncError::ShouldDisconnect
                | SyncError::NotAuthenticated
                | SyncError::Offline
                | SyncError::Incompatible { .. }
        )
    }

    /// Returns true if the error may succeed on retry with backoff.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Gateway { status, .. } => {
                matches!(StatusClass::classify(*status), StatusClass::RetryableRequest)
            }
            SyncError::Timeout => true,
            _ => false,
        }
    }
}

/// Buckets a gateway envelope status for retry decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusClass {
    /// 2xx.
    Ok,
    /// Worth retrying the same request: timeout or rate limiting.
    RetryableRequest,
    /// Likely a data problem isolated to the batch: retried at batch
    /// granularity, never escalated to a session-wide disconnect.
    BatchIssue,
    /// The service is unreachable or unhealthy: reconnect the session.
    Disconnect,
    /// Anything else (including auth failures handled upstream).
    Other,
}

impl StatusClass {
    /// Classifies an envelope status.
    pub fn classify(status: i32) -> Self {
        match status {
            200..=299 => StatusClass::Ok,
            408 | 429 => StatusClass::RetryableRequest,
            400 | 404 | 413 | 500 => StatusClass::BatchIssue,
            502 | 503 | 504 | NETWORK_ERROR_STATUS => StatusClass::Disconnect,
            _ => StatusClass::Other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_classification() {
        assert_eq!(StatusClass::classify(200), StatusClass::Ok);
        assert_eq!(StatusClass::classify(201), StatusClass::Ok);
        assert_eq!(StatusClass::classify(408), StatusClass::RetryableRequest);
        assert_eq!(StatusClass::classify(429), StatusClass::RetryableRequest);
        assert_eq!(StatusClass::classify(400), StatusClass::BatchIssue);
        assert_eq!(StatusClass::classify(404), StatusClass::BatchIssue);
        assert_eq!(StatusClass::classify(413), StatusClass::BatchIssue);
        assert_eq!(StatusClass::classify(500), StatusClass::BatchIssue);
        assert_eq!(StatusClass::classify(502), StatusClass::Disconnect);
        assert_eq!(StatusClass::classify(503), StatusClass::Disconnect);
        assert_eq!(StatusClass::classify(504), StatusClass::Disconnect);
        assert_eq!(
            StatusClass::classify(NETWORK_ERROR_STATUS),
            StatusClass::Disconnect
        );
        assert_eq!(StatusClass::classify(403), StatusClass::Other);
    }

    #[test]
    fn disconnect_errors() {
        assert!(SyncError::ShouldDisconnect.is_disconnect());
        assert!(SyncError::NotAuthenticated.is_disconnect());
        assert!(SyncError::Offline.is_disconnect());
        assert!(SyncError::Incompatible {
            required: Version::new(2, 0, 0)
        }
        .is_disconnect());
        assert!(!SyncError::Timeout.is_disconnect());
    }

    #[test]
    fn retryable_errors() {
        assert!(SyncError::gateway(429, "too many requests").is_retryable());
        assert!(SyncError::Timeout.is_retryable());
        assert!(!SyncError::gateway(400, "bad request").is_retryable());
        assert!(!SyncError::Cancelled.is_retryable());
    }

    #[test]
    fn error_display() {
        let err = SyncError::Incompatible {
            required: Version::new(2, 0, 0),
        };
        assert!(err.to_string().contains("2.0.0"));

        let err = SyncError::gateway(503, "service unavailable");
        assert!(err.to_string().contains("503"));
    }
}
