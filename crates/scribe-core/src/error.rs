//! Error types and result aliases shared across the Scribe crates.

use std::fmt;

/// The result type used throughout `scribe-core`.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors produced by the core data model and protocol state machine.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// An invalid identifier was provided.
    #[error("invalid identifier: {message}")]
    InvalidId {
        /// Description of what made the identifier invalid.
        message: String,
    },

    /// The protocol state machine observed an op it cannot accept.
    ///
    /// This is fatal for the document: the caller is expected to mark the
    /// document corrupt and stop emitting summary side effects.
    #[error("protocol violation: {message}")]
    ProtocolViolation {
        /// Description of the violation.
        message: String,
    },

    /// An op arrived out of order for a strictly ordered buffer.
    #[error("out-of-order op: previous sequence number {previous}, received {received}")]
    OutOfOrder {
        /// The highest sequence number already buffered.
        previous: u64,
        /// The sequence number that was rejected.
        received: u64,
    },

    /// A serialization or deserialization error occurred.
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of the serialization failure.
        message: String,
    },
}

impl Error {
    /// Creates a new protocol violation error.
    #[must_use]
    pub fn protocol_violation(message: impl Into<String>) -> Self {
        Self::ProtocolViolation {
            message: message.into(),
        }
    }

    /// Creates a new serialization error from a display-able cause.
    #[must_use]
    pub fn serialization(cause: impl fmt::Display) -> Self {
        Self::Serialization {
            message: cause.to_string(),
        }
    }
}
