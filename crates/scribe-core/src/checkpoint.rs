//! The durable checkpoint record and the reasons a checkpoint fires.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::protocol::ProtocolState;

/// Durable per-document progress, persisted to the document repository.
///
/// Replaying the op stream from `log_offset + 1` against a worker
/// reconstructed from this record yields exactly the in-memory state the
/// worker had when the record was written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScribeCheckpoint {
    /// Sequence number of the last op the worker observed.
    pub sequence_number: u64,
    /// Minimum sequence number of the last op the worker observed.
    pub minimum_sequence_number: u64,
    /// Snapshot of the protocol handler at its drain position.
    pub protocol_state: ProtocolState,
    /// Stream offset of the last batch folded into this record.
    pub log_offset: i64,
    /// Sequence number of the op that produced the last summary.
    pub last_summary_sequence_number: u64,
    /// Handle of the last accepted client summary, if any.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub last_client_summary_head: Option<String>,
    /// Service-summary handles written since the last client summary,
    /// oldest first, bounded by configuration.
    #[serde(default)]
    pub valid_parent_summaries: Vec<String>,
    /// Sequence number of the last op covered by a successful summary.
    pub protocol_head: u64,
    /// Set when the document can no longer be processed safely. Once set,
    /// no further summary side effects are emitted.
    #[serde(default)]
    pub is_corrupt: bool,
    /// When this record was assembled.
    pub checkpoint_timestamp: DateTime<Utc>,
}

impl ScribeCheckpoint {
    /// The checkpoint a brand-new document starts from: everything at zero
    /// and the offset before the first possible batch.
    #[must_use]
    pub fn cold_start() -> Self {
        Self {
            sequence_number: 0,
            minimum_sequence_number: 0,
            protocol_state: ProtocolState::empty(0, 0),
            log_offset: -1,
            last_summary_sequence_number: 0,
            last_client_summary_head: None,
            valid_parent_summaries: Vec::new(),
            protocol_head: 0,
            is_corrupt: false,
            checkpoint_timestamp: Utc::now(),
        }
    }
}

/// Why a checkpoint fired, in descending priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CheckpointReason {
    /// The worker marked the document corrupt; progress must be pinned
    /// without acknowledging the stream offset.
    MarkAsCorrupt,
    /// A `NoClient` op was observed; the session is idle.
    NoClients,
    /// Heuristics are disabled; every processed batch checkpoints.
    EveryMessage,
    /// The configured raw-message budget since the last checkpoint was hit.
    MaxMessages,
    /// The configured wall-clock budget since the last checkpoint was hit.
    MaxTime,
    /// No other condition applied; a deferred idle checkpoint fired.
    IdleTime,
}

impl CheckpointReason {
    /// Stable label for metrics and logs.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::MarkAsCorrupt => "mark_as_corrupt",
            Self::NoClients => "no_clients",
            Self::EveryMessage => "every_message",
            Self::MaxMessages => "max_messages",
            Self::MaxTime => "max_time",
            Self::IdleTime => "idle_time",
        }
    }
}
