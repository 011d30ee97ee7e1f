//! Error types for the Scribe partition worker.

/// The result type used throughout `scribe-lambda`.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the worker and its collaborators.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A storage collaborator failed for reasons that may succeed on retry.
    ///
    /// Suppressed into a nack (client summaries) or a logged continue
    /// (service summaries) when `ignore_storage_exception` is set;
    /// otherwise the error bubbles out of `handle` and the upstream driver
    /// decides whether to restart the worker.
    #[error("transient storage failure: {message}")]
    TransientStorage {
        /// Description of the failure.
        message: String,
        /// The underlying cause, if any.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// The protocol state machine rejected an op. Fatal for the document:
    /// the worker marks it corrupt and pins progress without acknowledging
    /// the stream offset.
    #[error("protocol violation: {message}")]
    ProtocolViolation {
        /// Description of the violation.
        message: String,
    },

    /// An op sequence gap was observed with no pending message reader to
    /// heal it. Fatal for the document.
    #[error("invalid sequence gap: expected {expected}, received {received}")]
    InvalidSequenceGap {
        /// The sequence number the worker expected next.
        expected: u64,
        /// The sequence number that actually arrived.
        received: u64,
    },

    /// The worker was closed; no further batches are accepted.
    #[error("scribe lambda is closed")]
    Closed,

    /// A serialization or deserialization error occurred.
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of the serialization failure.
        message: String,
    },

    /// An error from the core data model or protocol handler.
    #[error("core error: {0}")]
    Core(#[from] scribe_core::Error),
}

impl Error {
    /// Creates a new transient storage error.
    #[must_use]
    pub fn transient(message: impl Into<String>) -> Self {
        Self::TransientStorage {
            message: message.into(),
            source: None,
        }
    }

    /// Creates a new transient storage error with a source cause.
    #[must_use]
    pub fn transient_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::TransientStorage {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Creates a new protocol violation error.
    #[must_use]
    pub fn protocol_violation(message: impl Into<String>) -> Self {
        Self::ProtocolViolation {
            message: message.into(),
        }
    }

    /// Returns true if `ignore_storage_exception` may suppress this error.
    #[must_use]
    pub fn is_transient_storage(&self) -> bool {
        matches!(self, Self::TransientStorage { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as StdError;

    #[test]
    fn sequence_gap_display_names_both_positions() {
        let err = Error::InvalidSequenceGap {
            expected: 5,
            received: 7,
        };
        let message = err.to_string();
        assert!(message.contains('5'));
        assert!(message.contains('7'));
    }

    #[test]
    fn transient_error_keeps_its_source() {
        let source = std::io::Error::new(std::io::ErrorKind::TimedOut, "socket timeout");
        let err = Error::transient_with_source("checkpoint write failed", source);
        assert!(err.is_transient_storage());
        assert!(StdError::source(&err).is_some());
    }

    #[test]
    fn core_errors_convert() {
        let core = scribe_core::Error::protocol_violation("duplicate join");
        let err: Error = core.into();
        assert!(err.to_string().contains("duplicate join"));
    }
}
