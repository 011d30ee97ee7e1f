//! Summary writers: client summary acceptance and service summaries.
//!
//! A summary is a single content-addressed object holding the app tree
//! handle, the serialized (optionally scrubbed) protocol state, and the
//! logtail of ops past the protocol head, referencing its parent summaries
//! by handle. Readers load the newest summary and replay the logtail
//! instead of re-fetching the op stream.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use serde::Serialize;
use sha2::{Digest, Sha256};

use scribe_core::{
    ScribeCheckpoint, ScribeConfig, SequencedMessage, SummarizeContents, SummaryAckContents,
    SummaryNackContents, SummaryProposal,
};

use crate::error::{Error, Result};
use crate::store::{SummaryStore, WritePrecondition};

/// The service's answer to a client summary proposal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SummaryResponse {
    /// The proposal was accepted; carries the assembled summary handle.
    Ack(SummaryAckContents),
    /// The proposal was rejected; carries a human-readable reason.
    Nack(SummaryNackContents),
}

/// Outcome of a client summary attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientSummaryResult {
    /// True if the summary was written and should be acked.
    pub status: bool,
    /// The ack or nack to emit (unless an external writer owns emission).
    pub response: SummaryResponse,
}

impl ClientSummaryResult {
    fn ack(handle: String, summary_sequence_number: u64) -> Self {
        Self {
            status: true,
            response: SummaryResponse::Ack(SummaryAckContents {
                handle,
                summary_proposal: SummaryProposal {
                    summary_sequence_number,
                },
            }),
        }
    }

    fn nack(message: String, summary_sequence_number: u64) -> Self {
        Self {
            status: false,
            response: SummaryResponse::Nack(SummaryNackContents {
                message,
                summary_proposal: SummaryProposal {
                    summary_sequence_number,
                },
            }),
        }
    }
}

/// Writes client and service summaries to the content store.
#[async_trait]
pub trait SummaryWriter: Send + Sync + 'static {
    /// True when a separate service is authoritative for uploading client
    /// summaries. The worker then emits no acks or nacks itself and only
    /// advances its protocol head upon seeing a `SummaryAck` op.
    fn is_external(&self) -> bool;

    /// Assembles and writes a client summary from a `Summarize` op.
    ///
    /// `checkpoint` is the worker's state at the op's reference sequence
    /// number; `pending_ops` is the logtail candidate buffer.
    ///
    /// # Errors
    ///
    /// Returns a transient storage error if the content store fails. A
    /// rejected proposal is a normal result (`status == false`), not an
    /// error.
    async fn write_client_summary(
        &self,
        op: &SequencedMessage,
        last_client_summary_head: Option<&str>,
        checkpoint: &ScribeCheckpoint,
        pending_ops: &[SequencedMessage],
        is_ephemeral: bool,
    ) -> Result<ClientSummaryResult>;

    /// Writes a server-initiated summary when no clients are connected.
    ///
    /// Returns `None` when there is nothing new to summarize.
    ///
    /// # Errors
    ///
    /// Returns a transient storage error if the content store fails.
    async fn write_service_summary(
        &self,
        op: &SequencedMessage,
        protocol_head: u64,
        checkpoint: &ScribeCheckpoint,
        pending_ops: &[SequencedMessage],
    ) -> Result<Option<String>>;
}

/// The persisted summary object.
#[derive(Debug, Clone, Serialize)]
struct SummaryObject {
    /// "client" or "service".
    kind: &'static str,
    /// Handle of the app content tree, absent for a document that has
    /// never had a client summary.
    #[serde(skip_serializing_if = "Option::is_none")]
    app_handle: Option<String>,
    /// Parent summary handles.
    parents: Vec<String>,
    /// Sequence number the protocol state is positioned at.
    sequence_number: u64,
    /// Serialized protocol state.
    protocol_state: scribe_core::ProtocolState,
    /// Ops past the protocol head, for reader catch-up.
    logtail: Vec<SequencedMessage>,
}

/// Summary writer backed by a content-addressed object store.
pub struct StoreSummaryWriter {
    store: Arc<dyn SummaryStore>,
    external: bool,
    scrub_user_data: bool,
}

impl StoreSummaryWriter {
    /// Creates a writer over the given store. Whether user data is
    /// scrubbed from summary protocol trees follows
    /// `scrub_user_data_in_summaries`.
    #[must_use]
    pub fn new(store: Arc<dyn SummaryStore>, external: bool, config: &ScribeConfig) -> Self {
        Self {
            store,
            external,
            scrub_user_data: config.scrub_user_data_in_summaries,
        }
    }

    async fn persist(&self, object: &SummaryObject) -> Result<String> {
        let bytes = serde_json::to_vec(object).map_err(|e| Error::Serialization {
            message: format!("failed to serialize summary object: {e}"),
        })?;
        let handle = hex::encode(Sha256::digest(&bytes));
        self.store
            .put(
                &summary_key(&handle),
                Bytes::from(bytes),
                WritePrecondition::DoesNotExist,
            )
            .await?;
        Ok(handle)
    }

    fn protocol_tree(&self, checkpoint: &ScribeCheckpoint) -> scribe_core::ProtocolState {
        if self.scrub_user_data {
            checkpoint.protocol_state.scrubbed()
        } else {
            checkpoint.protocol_state.clone()
        }
    }
}

/// Storage key for a summary handle.
#[must_use]
pub fn summary_key(handle: &str) -> String {
    format!("summaries/{handle}")
}

/// Logtail: ops strictly past the protocol head, in order.
fn logtail(pending_ops: &[SequencedMessage], protocol_head: u64) -> Vec<SequencedMessage> {
    pending_ops
        .iter()
        .filter(|op| op.sequence_number > protocol_head)
        .cloned()
        .collect()
}

#[async_trait]
impl SummaryWriter for StoreSummaryWriter {
    fn is_external(&self) -> bool {
        self.external
    }

    #[tracing::instrument(skip_all, fields(sequence_number = op.sequence_number))]
    async fn write_client_summary(
        &self,
        op: &SequencedMessage,
        last_client_summary_head: Option<&str>,
        checkpoint: &ScribeCheckpoint,
        pending_ops: &[SequencedMessage],
        is_ephemeral: bool,
    ) -> Result<ClientSummaryResult> {
        let summary_sequence_number = op.sequence_number;

        let contents: SummarizeContents = match op.payload_as() {
            Ok(contents) => contents,
            Err(e) => {
                return Ok(ClientSummaryResult::nack(
                    format!("invalid summary contents: {e}"),
                    summary_sequence_number,
                ));
            }
        };

        // The proposal must build on a summary the service still recognizes:
        // the current head or one of the tracked service-summary parents.
        if let Some(expected) = last_client_summary_head {
            let claimed = contents.head.as_deref();
            let recognized = claimed == Some(expected)
                || claimed.is_some_and(|c| {
                    checkpoint
                        .valid_parent_summaries
                        .iter()
                        .any(|p| p.as_str() == c)
                });
            if !recognized {
                return Ok(ClientSummaryResult::nack(
                    format!(
                        "summary parent mismatch: proposal builds on {claimed:?}, service head is {expected}"
                    ),
                    summary_sequence_number,
                ));
            }
        }

        // Ephemeral containers are not durably summarized; the proposal
        // handle is acked as-is.
        if is_ephemeral {
            return Ok(ClientSummaryResult::ack(
                contents.handle,
                summary_sequence_number,
            ));
        }

        if !self.store.exists(&contents.handle).await? {
            return Ok(ClientSummaryResult::nack(
                format!("proposed summary tree {} not found", contents.handle),
                summary_sequence_number,
            ));
        }

        let mut parents: Vec<String> = contents.head.clone().into_iter().collect();
        parents.extend(contents.parents.iter().cloned());
        parents.dedup();

        let object = SummaryObject {
            kind: "client",
            app_handle: Some(contents.handle.clone()),
            parents,
            sequence_number: checkpoint.protocol_state.sequence_number,
            protocol_state: self.protocol_tree(checkpoint),
            logtail: logtail(pending_ops, checkpoint.protocol_head),
        };
        let handle = self.persist(&object).await?;
        tracing::debug!(handle, "client summary written");

        Ok(ClientSummaryResult::ack(handle, summary_sequence_number))
    }

    #[tracing::instrument(skip_all, fields(sequence_number = op.sequence_number))]
    async fn write_service_summary(
        &self,
        op: &SequencedMessage,
        protocol_head: u64,
        checkpoint: &ScribeCheckpoint,
        pending_ops: &[SequencedMessage],
    ) -> Result<Option<String>> {
        if op.sequence_number <= checkpoint.last_summary_sequence_number {
            tracing::debug!("no ops since the last summary; skipping service summary");
            return Ok(None);
        }

        // The app tree is inherited from the last client summary; the
        // newest tracked service summary (if any) is the direct parent.
        let parent = checkpoint
            .valid_parent_summaries
            .last()
            .cloned()
            .or_else(|| checkpoint.last_client_summary_head.clone());

        let object = SummaryObject {
            kind: "service",
            app_handle: checkpoint.last_client_summary_head.clone(),
            parents: parent.into_iter().collect(),
            sequence_number: checkpoint.protocol_state.sequence_number,
            protocol_state: self.protocol_tree(checkpoint),
            logtail: logtail(pending_ops, protocol_head),
        };
        let handle = self.persist(&object).await?;
        tracing::debug!(handle, "service summary written");

        Ok(Some(handle))
    }
}

// ============================================================================
// Scripted writer for tests
// ============================================================================

/// Scripted outcome for a client summary attempt.
#[derive(Debug, Clone)]
pub enum ScriptedClientSummary {
    /// Accept the proposal with the given handle.
    Accept {
        /// Handle returned in the ack.
        handle: String,
    },
    /// Reject the proposal with the given reason.
    Reject {
        /// Reason returned in the nack.
        message: String,
    },
    /// Fail with a transient storage error.
    Fail {
        /// Error message.
        message: String,
    },
}

/// Scripted outcome for a service summary attempt.
#[derive(Debug, Clone)]
pub enum ScriptedServiceSummary {
    /// Write a summary with the given handle.
    Write {
        /// Handle of the written summary.
        handle: String,
    },
    /// Report that there was nothing to summarize.
    Skip,
    /// Fail with a transient storage error.
    Fail {
        /// Error message.
        message: String,
    },
}

/// Test double with queued outcomes; defaults to accepting everything.
#[derive(Debug, Default)]
pub struct ScriptedSummaryWriter {
    external: bool,
    client_outcomes: Mutex<VecDeque<ScriptedClientSummary>>,
    service_outcomes: Mutex<VecDeque<ScriptedServiceSummary>>,
}

impl ScriptedSummaryWriter {
    /// Creates a writer that accepts every summary.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an external writer (a separate service owns ack emission).
    #[must_use]
    pub fn external() -> Self {
        Self {
            external: true,
            ..Self::default()
        }
    }

    /// Queues the outcome for the next client summary attempt.
    ///
    /// # Panics
    ///
    /// Panics if the internal lock is poisoned.
    pub fn script_client(&self, outcome: ScriptedClientSummary) {
        self.client_outcomes
            .lock()
            .expect("script lock poisoned")
            .push_back(outcome);
    }

    /// Queues the outcome for the next service summary attempt.
    ///
    /// # Panics
    ///
    /// Panics if the internal lock is poisoned.
    pub fn script_service(&self, outcome: ScriptedServiceSummary) {
        self.service_outcomes
            .lock()
            .expect("script lock poisoned")
            .push_back(outcome);
    }
}

#[async_trait]
impl SummaryWriter for ScriptedSummaryWriter {
    fn is_external(&self) -> bool {
        self.external
    }

    async fn write_client_summary(
        &self,
        op: &SequencedMessage,
        _last_client_summary_head: Option<&str>,
        _checkpoint: &ScribeCheckpoint,
        _pending_ops: &[SequencedMessage],
        _is_ephemeral: bool,
    ) -> Result<ClientSummaryResult> {
        let outcome = self
            .client_outcomes
            .lock()
            .map_err(|_| Error::transient("script lock poisoned"))?
            .pop_front()
            .unwrap_or(ScriptedClientSummary::Accept {
                handle: format!("summary-{}", op.sequence_number),
            });

        match outcome {
            ScriptedClientSummary::Accept { handle } => {
                Ok(ClientSummaryResult::ack(handle, op.sequence_number))
            }
            ScriptedClientSummary::Reject { message } => {
                Ok(ClientSummaryResult::nack(message, op.sequence_number))
            }
            ScriptedClientSummary::Fail { message } => Err(Error::transient(message)),
        }
    }

    async fn write_service_summary(
        &self,
        op: &SequencedMessage,
        _protocol_head: u64,
        _checkpoint: &ScribeCheckpoint,
        _pending_ops: &[SequencedMessage],
    ) -> Result<Option<String>> {
        let outcome = self
            .service_outcomes
            .lock()
            .map_err(|_| Error::transient("script lock poisoned"))?
            .pop_front()
            .unwrap_or(ScriptedServiceSummary::Write {
                handle: format!("service-summary-{}", op.sequence_number),
            });

        match outcome {
            ScriptedServiceSummary::Write { handle } => Ok(Some(handle)),
            ScriptedServiceSummary::Skip => Ok(None),
            ScriptedServiceSummary::Fail { message } => Err(Error::transient(message)),
        }
    }
}
