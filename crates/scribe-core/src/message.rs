//! Sequenced op data model: message kinds, payload encoding, and the
//! boxcar batch delivered from the upstream bus.
//!
//! Ops occasionally arrive with their contents embedded as a JSON-encoded
//! string (a quirk of older producers). [`Payload`] models that as a tagged
//! union with a single decode point, so downstream components never parse
//! strings ad hoc and never share mutable payloads.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};
use crate::id::{DocumentId, TenantId};

/// The kind of a sequenced op.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    /// An ordinary application op; opaque to the protocol layer.
    Op,
    /// A client joined the session.
    ClientJoin,
    /// A client left the session.
    ClientLeave,
    /// A client proposed a consensus value.
    Propose,
    /// A client proposed a new summary.
    Summarize,
    /// The service accepted a summary proposal.
    SummaryAck,
    /// The service rejected a summary proposal.
    SummaryNack,
    /// The last client disconnected; the session is idle.
    NoClient,
    /// A service-internal control op.
    Control,
}

/// Op contents: either still JSON-encoded as a string, or already decoded.
///
/// Decoding happens in exactly one place ([`Payload::decode`]); the decoded
/// value is always a fresh copy, never a shared reference into the op.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Payload {
    /// Contents serialized as a JSON string by the producer.
    Encoded(String),
    /// Contents already in structured form.
    Decoded(Value),
}

impl Default for Payload {
    fn default() -> Self {
        Self::Decoded(Value::Null)
    }
}

impl Payload {
    /// Creates a decoded payload from any serializable value.
    ///
    /// # Errors
    ///
    /// Returns an error if the value cannot be represented as JSON.
    pub fn from_value<T: Serialize>(value: &T) -> Result<Self> {
        Ok(Self::Decoded(
            serde_json::to_value(value).map_err(Error::serialization)?,
        ))
    }

    /// Decodes the payload into a structured JSON value.
    ///
    /// # Errors
    ///
    /// Returns an error if an encoded payload is not valid JSON.
    pub fn decode(&self) -> Result<Value> {
        match self {
            Self::Encoded(text) => serde_json::from_str(text).map_err(Error::serialization),
            Self::Decoded(value) => Ok(value.clone()),
        }
    }

    /// Decodes the payload into a typed contents struct.
    ///
    /// # Errors
    ///
    /// Returns an error if decoding or shaping into `T` fails.
    pub fn decode_as<T: serde::de::DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(self.decode()?).map_err(Error::serialization)
    }

    /// Returns true if the payload carries no contents.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        matches!(self, Self::Decoded(Value::Null))
    }
}

/// Metadata attached by upstream service stages.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerMetadata {
    /// Whether the sequencing stage already acknowledged this op's summary.
    #[serde(default)]
    pub deli_acked: bool,
}

/// A timing trace recorded by a service stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Trace {
    /// The service that recorded the trace.
    pub service: String,
    /// The action taken (e.g. "start", "end").
    pub action: String,
    /// Milliseconds since the epoch.
    pub timestamp: u64,
}

/// A single sequenced op in the document's log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SequencedMessage {
    /// Strictly monotonic per document.
    pub sequence_number: u64,
    /// Non-decreasing watermark below which all clients have caught up.
    pub minimum_sequence_number: u64,
    /// The sequence number the submitting client had seen.
    pub reference_sequence_number: u64,
    /// The submitting client, absent for service-generated ops.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub client_id: Option<String>,
    /// The op kind.
    pub kind: MessageKind,
    /// Op contents; see [`Payload`].
    #[serde(default)]
    pub contents: Payload,
    /// Auxiliary payload, used by some producers instead of `contents`.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub data: Option<String>,
    /// Metadata attached by upstream service stages.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub server_metadata: Option<ServerMetadata>,
    /// Timing traces accumulated across service stages.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub traces: Option<Vec<Trace>>,
}

impl SequencedMessage {
    /// Creates a bare op of the given kind with empty contents.
    #[must_use]
    pub fn new(
        kind: MessageKind,
        sequence_number: u64,
        minimum_sequence_number: u64,
        reference_sequence_number: u64,
    ) -> Self {
        Self {
            sequence_number,
            minimum_sequence_number,
            reference_sequence_number,
            client_id: None,
            kind,
            contents: Payload::default(),
            data: None,
            server_metadata: None,
            traces: None,
        }
    }

    /// Returns true if the sequencing stage already acknowledged this op.
    #[must_use]
    pub fn deli_acked(&self) -> bool {
        self.server_metadata.is_some_and(|m| m.deli_acked)
    }

    /// Decodes the op's effective payload.
    ///
    /// Some producers place the real contents in `data` as a JSON string
    /// and leave `contents` empty; `data` wins when present.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload is not valid JSON.
    pub fn payload(&self) -> Result<Value> {
        match &self.data {
            Some(text) => serde_json::from_str(text).map_err(Error::serialization),
            None => self.contents.decode(),
        }
    }

    /// Decodes the op's effective payload into a typed contents struct.
    ///
    /// # Errors
    ///
    /// Returns an error if decoding or shaping into `T` fails.
    pub fn payload_as<T: serde::de::DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(self.payload()?).map_err(Error::serialization)
    }
}

/// An ordered batch of sequenced ops (boxcar) delivered under one offset.
///
/// The offset is the unit of acknowledgement to the upstream bus. A fresh
/// document starts from offset `-1`, hence the signed type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageBatch {
    /// The stream offset covering every op in this batch.
    pub offset: i64,
    /// The stream partition the batch was read from.
    pub partition: i32,
    /// The tenant owning the document.
    pub tenant_id: TenantId,
    /// The document these ops belong to.
    pub document_id: DocumentId,
    /// Ops in boxcar order.
    pub messages: Vec<SequencedMessage>,
}

// ============================================================================
// Typed op contents
// ============================================================================

/// Identity of the user behind a client connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserInfo {
    /// Stable user identifier.
    pub id: String,
    /// Display name, when the identity provider supplies one.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub name: Option<String>,
}

/// Connection details carried by a join op.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientDetail {
    /// The user behind the connection.
    pub user: UserInfo,
    /// Connection mode (e.g. "write", "read").
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub mode: Option<String>,
}

/// Contents of a [`MessageKind::ClientJoin`] op.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientJoinContents {
    /// The joining client's connection ID.
    pub client_id: String,
    /// Connection details.
    pub detail: ClientDetail,
}

/// Contents of a [`MessageKind::ClientLeave`] op.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientLeaveContents {
    /// The leaving client's connection ID.
    pub client_id: String,
}

/// Contents of a [`MessageKind::Propose`] op.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProposeContents {
    /// The consensus key being proposed.
    pub key: String,
    /// The proposed value.
    pub value: Value,
}

/// Contents of a [`MessageKind::Summarize`] op: a client summary proposal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SummarizeContents {
    /// Handle of the content tree the client uploaded.
    pub handle: String,
    /// Handle of the parent summary the client built upon, if any.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub head: Option<String>,
    /// Free-form proposal message.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub message: Option<String>,
    /// Additional parent handles the client considers valid.
    #[serde(default)]
    pub parents: Vec<String>,
}

/// Identifies the summary proposal an ack or nack responds to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SummaryProposal {
    /// Sequence number of the Summarize op being answered.
    pub summary_sequence_number: u64,
}

/// Contents of a [`MessageKind::SummaryAck`] op.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SummaryAckContents {
    /// Handle of the accepted, fully assembled summary.
    pub handle: String,
    /// The proposal being accepted.
    pub summary_proposal: SummaryProposal,
}

/// Contents of a [`MessageKind::SummaryNack`] op.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SummaryNackContents {
    /// Human-readable rejection reason.
    pub message: String,
    /// The proposal being rejected.
    pub summary_proposal: SummaryProposal,
}

/// Contents of a [`MessageKind::Control`] op.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ControlContents {
    /// Informs the sequencing stage that durable progress advanced.
    UpdateDurableSequenceNumber {
        /// The new durable sequence number.
        durable_sequence_number: u64,
        /// Whether a client summary (vs a service summary) produced it.
        is_client_summary: bool,
        /// Whether cached checkpoint state should be dropped.
        clear_cache: bool,
    },
}

/// A service-generated op emitted through the outbound producer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SystemMessage {
    /// Accept a client summary proposal.
    SummaryAck(SummaryAckContents),
    /// Reject a client summary proposal.
    SummaryNack(SummaryNackContents),
    /// A control op for the sequencing stage.
    Control(ControlContents),
}
