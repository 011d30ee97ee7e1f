//! Checkpoint manager: routes durable progress to the document repository.
//!
//! A checkpoint is **global** (the canonical document record) iff no
//! clients are connected or the worker is pinned to global-only mode;
//! otherwise it is **local** (the partition record), and only when local
//! checkpoints are enabled at all.

use std::sync::Arc;

use scribe_core::{DocumentId, ScribeCheckpoint, SequencedMessage};

use crate::error::Result;
use crate::repository::{CheckpointWriteOptions, DocumentRepository};

/// Coordinates checkpoint persistence for one document.
pub struct CheckpointManager {
    document_id: DocumentId,
    repository: Arc<dyn DocumentRepository>,
    local_checkpoint_enabled: bool,
}

impl CheckpointManager {
    /// Creates a manager for the given document.
    #[must_use]
    pub fn new(
        document_id: DocumentId,
        repository: Arc<dyn DocumentRepository>,
        local_checkpoint_enabled: bool,
    ) -> Self {
        Self {
            document_id,
            repository,
            local_checkpoint_enabled,
        }
    }

    /// Returns whether a checkpoint under these conditions goes to the
    /// canonical document record.
    #[must_use]
    pub fn is_global(&self, no_active_clients: bool, global_only: bool) -> bool {
        !self.local_checkpoint_enabled || no_active_clients || global_only
    }

    /// Persists a checkpoint and the pending ops that back it.
    ///
    /// Ops at or below the protocol head are already covered by a summary
    /// and are not re-inserted.
    ///
    /// # Errors
    ///
    /// Returns a transient storage error if persistence fails; the caller
    /// must then skip the upstream offset acknowledgement.
    #[tracing::instrument(
        skip_all,
        fields(
            document_id = %self.document_id,
            sequence_number = checkpoint.sequence_number,
            log_offset = checkpoint.log_offset,
        )
    )]
    pub async fn write(
        &self,
        checkpoint: &ScribeCheckpoint,
        protocol_head: u64,
        ops_to_insert: &[SequencedMessage],
        no_active_clients: bool,
        global_only: bool,
        mark_corrupt: bool,
    ) -> Result<()> {
        let is_global = self.is_global(no_active_clients, global_only);
        let ops: Vec<SequencedMessage> = ops_to_insert
            .iter()
            .filter(|op| op.sequence_number > protocol_head)
            .cloned()
            .collect();

        self.repository
            .update_checkpoint(
                &self.document_id,
                checkpoint,
                &ops,
                CheckpointWriteOptions {
                    is_global,
                    mark_corrupt,
                    no_active_clients,
                },
            )
            .await?;

        tracing::debug!(
            is_global,
            ops_inserted = ops.len(),
            mark_corrupt,
            "checkpoint written"
        );
        Ok(())
    }

    /// Invalidates cached checkpoint state after a cache-clearing service
    /// summary.
    ///
    /// # Errors
    ///
    /// Returns a transient storage error if the delete fails.
    #[tracing::instrument(skip_all, fields(document_id = %self.document_id, protocol_head))]
    pub async fn delete(&self, protocol_head: u64, deferred: bool) -> Result<()> {
        self.repository
            .delete_checkpoint(&self.document_id, protocol_head, deferred)
            .await
    }
}
