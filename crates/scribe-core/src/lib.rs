//! # scribe-core
//!
//! Core primitives for the Scribe partition worker.
//!
//! This crate holds everything the worker shares with its collaborators:
//!
//! - **Identifiers**: strongly-typed tenant and document IDs
//! - **Data Model**: sequenced ops, boxcar batches, typed op contents
//! - **Protocol Handler**: the pure fold of ops into quorum state
//! - **Op Buffers**: the pending-op and pending-checkpoint buffers
//! - **Checkpoint Record**: the durable per-document progress record
//! - **Configuration**: worker knobs with conservative defaults
//!
//! Nothing in this crate performs I/O; every type is a pure function of its
//! inputs, which is what makes checkpoint replay exact.

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod checkpoint;
pub mod config;
pub mod error;
pub mod id;
pub mod message;
pub mod observability;
pub mod pending;
pub mod protocol;

// Re-export key types at crate root for ergonomics
pub use checkpoint::{CheckpointReason, ScribeCheckpoint};
pub use config::{CheckpointHeuristicConfig, ScribeConfig};
pub use error::{Error, Result};
pub use id::{DocumentId, TenantId};
pub use message::{
    ClientDetail, ClientJoinContents, ClientLeaveContents, ControlContents, MessageBatch,
    MessageKind, Payload, ProposeContents, SequencedMessage, ServerMetadata, SummarizeContents,
    SummaryAckContents, SummaryNackContents, SummaryProposal, SystemMessage, Trace, UserInfo,
};
pub use observability::{LogFormat, init_logging, session_span};
pub use pending::{CheckpointMessageBuffer, PendingOpBuffer};
pub use protocol::{ProtocolHandler, ProtocolState, QuorumClient, SequencedProposal};
