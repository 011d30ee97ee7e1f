//! Protocol state machine: quorum membership, proposals, and accepted values.
//!
//! The handler is a pure fold over the ordered op stream. Given the same
//! starting snapshot and the same ops in the same order it always produces
//! the same state, which is what makes checkpoint replay exact: a snapshot
//! taken at sequence number `n` plus the ops `(n, m]` equals a snapshot
//! taken at `m`.
//!
//! Any error returned from [`ProtocolHandler::process_message`] is fatal for
//! the document; the caller marks the document corrupt and stops emitting
//! summary side effects.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};
use crate::message::{
    ClientDetail, ClientJoinContents, ClientLeaveContents, MessageKind, ProposeContents,
    SequencedMessage, UserInfo,
};

/// A member of the document's quorum.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuorumClient {
    /// Connection details captured from the join op.
    pub detail: ClientDetail,
    /// Sequence number of the join op.
    pub sequence_number: u64,
}

/// A proposal that has been sequenced but not yet accepted.
///
/// A proposal is accepted once the minimum sequence number reaches its
/// sequence number: at that point every connected client has seen it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SequencedProposal {
    /// Sequence number of the propose op.
    pub sequence_number: u64,
    /// The consensus key.
    pub key: String,
    /// The proposed value.
    pub value: Value,
}

/// Serializable snapshot of the protocol state machine.
///
/// Maps are ordered so two snapshots of the same logical state serialize
/// identically, which checkpoint replay equivalence depends on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProtocolState {
    /// Sequence number of the last op folded into this state.
    pub sequence_number: u64,
    /// Minimum sequence number of the last op folded into this state.
    pub minimum_sequence_number: u64,
    /// Quorum members keyed by client ID.
    pub members: BTreeMap<String, QuorumClient>,
    /// Pending proposals keyed by their sequence number.
    pub proposals: BTreeMap<u64, SequencedProposal>,
    /// Accepted consensus values keyed by proposal key.
    pub values: BTreeMap<String, Value>,
}

impl ProtocolState {
    /// An empty state positioned at the given counters.
    #[must_use]
    pub fn empty(sequence_number: u64, minimum_sequence_number: u64) -> Self {
        Self {
            sequence_number,
            minimum_sequence_number,
            members: BTreeMap::new(),
            proposals: BTreeMap::new(),
            values: BTreeMap::new(),
        }
    }

    /// Returns a copy with identifying member fields replaced by
    /// placeholders derived from the join sequence number. The same logical
    /// state always scrubs to the same snapshot, so scrubbing is idempotent.
    #[must_use]
    pub fn scrubbed(&self) -> Self {
        let mut scrubbed = self.clone();
        for client in scrubbed.members.values_mut() {
            client.detail.user = UserInfo {
                id: format!("user_{}", client.sequence_number),
                name: None,
            };
        }
        scrubbed
    }
}

/// The protocol state machine over the document's op stream.
#[derive(Debug, Clone)]
pub struct ProtocolHandler {
    state: ProtocolState,
    closed: bool,
}

impl ProtocolHandler {
    /// Creates a handler resuming from a persisted snapshot.
    #[must_use]
    pub fn from_state(state: ProtocolState) -> Self {
        Self {
            state,
            closed: false,
        }
    }

    /// Creates a handler for a brand-new document.
    #[must_use]
    pub fn new() -> Self {
        Self::from_state(ProtocolState::empty(0, 0))
    }

    /// Sequence number of the last op folded into the handler.
    #[must_use]
    pub fn sequence_number(&self) -> u64 {
        self.state.sequence_number
    }

    /// Minimum sequence number of the last op folded into the handler.
    #[must_use]
    pub fn minimum_sequence_number(&self) -> u64 {
        self.state.minimum_sequence_number
    }

    /// Number of currently connected quorum members.
    #[must_use]
    pub fn member_count(&self) -> usize {
        self.state.members.len()
    }

    /// Folds the next op into the state machine.
    ///
    /// `local` marks ops this service submitted itself; it only affects
    /// trace output, never the folded state.
    ///
    /// # Errors
    ///
    /// Returns a [`Error::ProtocolViolation`] if the op is out of order,
    /// regresses the minimum sequence number, or is inconsistent with the
    /// current quorum (duplicate join, unknown leave). All such errors are
    /// fatal for the document.
    pub fn process_message(&mut self, message: &SequencedMessage, local: bool) -> Result<()> {
        if self.closed {
            return Err(Error::protocol_violation(
                "op processed after the handler was closed",
            ));
        }
        if message.sequence_number != self.state.sequence_number + 1 {
            return Err(Error::protocol_violation(format!(
                "non-contiguous sequence number: at {}, received {}",
                self.state.sequence_number, message.sequence_number
            )));
        }
        if message.minimum_sequence_number < self.state.minimum_sequence_number {
            return Err(Error::protocol_violation(format!(
                "minimum sequence number regressed from {} to {}",
                self.state.minimum_sequence_number, message.minimum_sequence_number
            )));
        }

        self.state.sequence_number = message.sequence_number;
        self.state.minimum_sequence_number = message.minimum_sequence_number;

        match message.kind {
            MessageKind::ClientJoin => self.process_join(message)?,
            MessageKind::ClientLeave => self.process_leave(message)?,
            MessageKind::Propose => self.process_propose(message)?,
            _ => {
                tracing::trace!(
                    sequence_number = message.sequence_number,
                    kind = ?message.kind,
                    local,
                    "op folded with no quorum effect"
                );
            }
        }

        self.commit_proposals();
        Ok(())
    }

    /// Returns a serializable snapshot of the current state.
    ///
    /// With `scrub_user_data` set, identifying member fields are replaced
    /// with placeholders derived from the join sequence number, so the same
    /// logical state always scrubs to the same snapshot.
    #[must_use]
    pub fn protocol_state(&self, scrub_user_data: bool) -> ProtocolState {
        if scrub_user_data {
            self.state.scrubbed()
        } else {
            self.state.clone()
        }
    }

    /// Marks the handler closed. Further ops are rejected.
    pub fn close(&mut self) {
        self.closed = true;
    }

    fn process_join(&mut self, message: &SequencedMessage) -> Result<()> {
        let contents: ClientJoinContents = message.payload_as()?;
        if self.state.members.contains_key(&contents.client_id) {
            return Err(Error::protocol_violation(format!(
                "duplicate join for client {}",
                contents.client_id
            )));
        }
        self.state.members.insert(
            contents.client_id,
            QuorumClient {
                detail: contents.detail,
                sequence_number: message.sequence_number,
            },
        );
        Ok(())
    }

    fn process_leave(&mut self, message: &SequencedMessage) -> Result<()> {
        let contents: ClientLeaveContents = message.payload_as()?;
        if self.state.members.remove(&contents.client_id).is_none() {
            return Err(Error::protocol_violation(format!(
                "leave for unknown client {}",
                contents.client_id
            )));
        }
        Ok(())
    }

    fn process_propose(&mut self, message: &SequencedMessage) -> Result<()> {
        let contents: ProposeContents = message.payload_as()?;
        self.state.proposals.insert(
            message.sequence_number,
            SequencedProposal {
                sequence_number: message.sequence_number,
                key: contents.key,
                value: contents.value,
            },
        );
        Ok(())
    }

    /// Accepts proposals the minimum sequence number has passed.
    fn commit_proposals(&mut self) {
        let msn = self.state.minimum_sequence_number;
        loop {
            let Some(sequence_number) = self.state.proposals.keys().next().copied() else {
                break;
            };
            if sequence_number > msn {
                break;
            }
            if let Some(proposal) = self.state.proposals.remove(&sequence_number) {
                self.state.values.insert(proposal.key, proposal.value);
            }
        }
    }
}

impl Default for ProtocolHandler {
    fn default() -> Self {
        Self::new()
    }
}
