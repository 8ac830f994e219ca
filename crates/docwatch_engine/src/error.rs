//! Error types for the watch engine.

use docwatch_protocol::ProtocolError;
use thiserror::Error;

/// Result type for watch operations.
pub type WatchResult<T> = Result<T, WatchError>;

/// Errors that can occur while watching a change feed.
#[derive(Error, Debug)]
pub enum WatchError {
    /// Options failed validation. Reported before any I/O.
    #[error("invalid {field}: {reason}")]
    InvalidOptions {
        /// Offending field.
        field: &'static str,
        /// Why the value was rejected.
        reason: String,
    },

    /// Change source failure.
    #[error("change source error: {message}")]
    Source {
        /// Error message.
        message: String,
        /// Whether polling may continue from the same position.
        retryable: bool,
    },

    /// The start position is no longer covered by the feed's retained history.
    #[error("resume position lost: {0}")]
    HistoryLost(String),

    /// Resume token store failure.
    #[error("token store error: {0}")]
    TokenStore(String),

    /// Document codec error.
    #[error("codec error: {0}")]
    Codec(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Checkpoint serialization error.
    #[error("checkpoint encoding error: {0}")]
    Json(#[from] serde_json::Error),

    /// The fatal-error callback failed; the watch cannot continue.
    #[error("fatal error callback failed: {0}")]
    FatalCallback(String),

    /// The watch was stopped.
    #[error("watch stopped")]
    Cancelled,
}

impl WatchError {
    pub(crate) fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidOptions {
            field,
            reason: reason.into(),
        }
    }

    /// Creates a retryable source error.
    pub fn source_retryable(message: impl Into<String>) -> Self {
        Self::Source {
            message: message.into(),
            retryable: true,
        }
    }

    /// Creates a non-retryable source error.
    pub fn source_fatal(message: impl Into<String>) -> Self {
        Self::Source {
            message: message.into(),
            retryable: false,
        }
    }

    /// Returns true if tailing may resume from the last durable position.
    ///
    /// Only a lost history (or a source error flagged non-retryable) forces
    /// the caller to pick a new starting point.
    pub fn is_resumable(&self) -> bool {
        match self {
            WatchError::Source { retryable, .. } => *retryable,
            WatchError::HistoryLost(_) => false,
            WatchError::TokenStore(_) | WatchError::Io(_) => true,
            _ => false,
        }
    }

    /// Returns true if this error means the stored position must be replaced.
    pub fn is_history_lost(&self) -> bool {
        matches!(
            self,
            WatchError::HistoryLost(_) | WatchError::Source { retryable: false, .. }
        )
    }
}

impl From<ProtocolError> for WatchError {
    fn from(err: ProtocolError) -> Self {
        match err {
            ProtocolError::Codec(msg) => WatchError::Codec(msg),
            other => WatchError::invalid("position", other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resumable_errors() {
        assert!(WatchError::source_retryable("connection reset").is_resumable());
        assert!(!WatchError::source_fatal("token expired").is_resumable());
        assert!(!WatchError::HistoryLost("oplog rolled over".into()).is_resumable());
        assert!(WatchError::TokenStore("busy".into()).is_resumable());
        assert!(!WatchError::Cancelled.is_resumable());
    }

    #[test]
    fn history_lost_classification() {
        assert!(WatchError::HistoryLost("gone".into()).is_history_lost());
        assert!(WatchError::source_fatal("gone").is_history_lost());
        assert!(!WatchError::source_retryable("blip").is_history_lost());
    }

    #[test]
    fn error_display() {
        let err = WatchError::invalid("page_size", "must be within [200, 2000], got 10");
        assert_eq!(
            err.to_string(),
            "invalid page_size: must be within [200, 2000], got 10"
        );
        assert_eq!(WatchError::Cancelled.to_string(), "watch stopped");
    }

    #[test]
    fn protocol_errors_convert() {
        let err: WatchError = ProtocolError::Codec("bad cbor".into()).into();
        assert!(matches!(err, WatchError::Codec(_)));
        let err: WatchError = ProtocolError::InvalidToken("empty".into()).into();
        assert!(matches!(err, WatchError::InvalidOptions { .. }));
    }
}
