//! Document repository: durable checkpoint records and the per-document
//! op store.
//!
//! A checkpoint is written either to the canonical **global** document
//! record (visible to every partition) or to the partition-**local**
//! record, which is cheaper and skips cross-partition coordination. Op
//! inserts are upserts keyed by sequence number, so re-delivered batches
//! re-insert the same ops without harm.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;

use scribe_core::{DocumentId, ScribeCheckpoint, SequencedMessage};

use crate::error::{Error, Result};

/// Routing and flags for a checkpoint write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckpointWriteOptions {
    /// Write the canonical document record rather than the local one.
    pub is_global: bool,
    /// The worker is pinning progress for a corrupt document.
    pub mark_corrupt: bool,
    /// No clients were connected when the checkpoint was taken.
    pub no_active_clients: bool,
}

/// Durable storage for checkpoint records and pending ops.
#[async_trait]
pub trait DocumentRepository: Send + Sync + 'static {
    /// Persists a checkpoint and its backing ops atomically.
    ///
    /// # Errors
    ///
    /// Returns a transient storage error if persistence fails; the caller
    /// skips the upstream acknowledgement so the batch can be re-delivered.
    async fn update_checkpoint(
        &self,
        document_id: &DocumentId,
        checkpoint: &ScribeCheckpoint,
        ops_to_insert: &[SequencedMessage],
        options: CheckpointWriteOptions,
    ) -> Result<()>;

    /// Invalidates cached checkpoint state after a cache-clearing service
    /// summary.
    ///
    /// # Errors
    ///
    /// Returns a transient storage error if the delete fails.
    async fn delete_checkpoint(
        &self,
        document_id: &DocumentId,
        protocol_head: u64,
        deferred: bool,
    ) -> Result<()>;

    /// Loads the most recent checkpoint for a document, if any.
    ///
    /// # Errors
    ///
    /// Returns a transient storage error if the read fails.
    async fn load_checkpoint(&self, document_id: &DocumentId) -> Result<Option<ScribeCheckpoint>>;
}

/// A recorded checkpoint write, kept for test assertions.
#[derive(Debug, Clone)]
pub struct RecordedWrite {
    /// The persisted checkpoint.
    pub checkpoint: ScribeCheckpoint,
    /// How the write was routed.
    pub options: CheckpointWriteOptions,
}

#[derive(Debug, Default)]
struct DocumentRecord {
    global: Option<ScribeCheckpoint>,
    local: Option<ScribeCheckpoint>,
    ops: BTreeMap<u64, SequencedMessage>,
    writes: Vec<RecordedWrite>,
    deletes: Vec<(u64, bool)>,
}

/// In-memory document repository for testing.
///
/// Thread-safe via `RwLock`. Not suitable for production.
#[derive(Debug, Default)]
pub struct MemoryDocumentRepository {
    documents: Arc<RwLock<HashMap<DocumentId, DocumentRecord>>>,
    fail_writes: AtomicBool,
}

impl MemoryDocumentRepository {
    /// Creates a new empty repository.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent checkpoint write fail until cleared.
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Returns the canonical (global) checkpoint for a document.
    ///
    /// # Panics
    ///
    /// Panics if the internal lock is poisoned.
    #[must_use]
    pub fn global_checkpoint(&self, document_id: &DocumentId) -> Option<ScribeCheckpoint> {
        self.documents
            .read()
            .expect("repository lock poisoned")
            .get(document_id)
            .and_then(|record| record.global.clone())
    }

    /// Returns the partition-local checkpoint for a document.
    ///
    /// # Panics
    ///
    /// Panics if the internal lock is poisoned.
    #[must_use]
    pub fn local_checkpoint(&self, document_id: &DocumentId) -> Option<ScribeCheckpoint> {
        self.documents
            .read()
            .expect("repository lock poisoned")
            .get(document_id)
            .and_then(|record| record.local.clone())
    }

    /// Returns every checkpoint write recorded for a document, in order.
    ///
    /// # Panics
    ///
    /// Panics if the internal lock is poisoned.
    #[must_use]
    pub fn writes(&self, document_id: &DocumentId) -> Vec<RecordedWrite> {
        self.documents
            .read()
            .expect("repository lock poisoned")
            .get(document_id)
            .map(|record| record.writes.clone())
            .unwrap_or_default()
    }

    /// Returns every recorded checkpoint delete as `(protocol_head, deferred)`.
    ///
    /// # Panics
    ///
    /// Panics if the internal lock is poisoned.
    #[must_use]
    pub fn deletes(&self, document_id: &DocumentId) -> Vec<(u64, bool)> {
        self.documents
            .read()
            .expect("repository lock poisoned")
            .get(document_id)
            .map(|record| record.deletes.clone())
            .unwrap_or_default()
    }

    /// Returns the ops persisted for a document, ordered by sequence number.
    ///
    /// # Panics
    ///
    /// Panics if the internal lock is poisoned.
    #[must_use]
    pub fn ops(&self, document_id: &DocumentId) -> Vec<SequencedMessage> {
        self.documents
            .read()
            .expect("repository lock poisoned")
            .get(document_id)
            .map(|record| record.ops.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Seeds a checkpoint directly, used by bootstrap tests.
    ///
    /// # Panics
    ///
    /// Panics if the internal lock is poisoned.
    pub fn seed_checkpoint(&self, document_id: &DocumentId, checkpoint: ScribeCheckpoint) {
        let mut documents = self.documents.write().expect("repository lock poisoned");
        documents
            .entry(document_id.clone())
            .or_default()
            .global
            .replace(checkpoint);
    }
}

#[async_trait]
impl DocumentRepository for MemoryDocumentRepository {
    async fn update_checkpoint(
        &self,
        document_id: &DocumentId,
        checkpoint: &ScribeCheckpoint,
        ops_to_insert: &[SequencedMessage],
        options: CheckpointWriteOptions,
    ) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(Error::transient("injected checkpoint write failure"));
        }

        let mut documents = self
            .documents
            .write()
            .map_err(|_| Error::transient("repository lock poisoned"))?;
        let record = documents.entry(document_id.clone()).or_default();

        if options.is_global {
            record.global = Some(checkpoint.clone());
        } else {
            record.local = Some(checkpoint.clone());
        }
        for op in ops_to_insert {
            record.ops.insert(op.sequence_number, op.clone());
        }
        record.writes.push(RecordedWrite {
            checkpoint: checkpoint.clone(),
            options,
        });
        Ok(())
    }

    async fn delete_checkpoint(
        &self,
        document_id: &DocumentId,
        protocol_head: u64,
        deferred: bool,
    ) -> Result<()> {
        let mut documents = self
            .documents
            .write()
            .map_err(|_| Error::transient("repository lock poisoned"))?;
        let record = documents.entry(document_id.clone()).or_default();
        record.local = None;
        record.deletes.push((protocol_head, deferred));
        Ok(())
    }

    async fn load_checkpoint(&self, document_id: &DocumentId) -> Result<Option<ScribeCheckpoint>> {
        let documents = self
            .documents
            .read()
            .map_err(|_| Error::transient("repository lock poisoned"))?;
        let Some(record) = documents.get(document_id) else {
            return Ok(None);
        };

        // The fresher of the two records wins: a local checkpoint can run
        // ahead of the canonical one between global flushes.
        let checkpoint = match (&record.global, &record.local) {
            (Some(global), Some(local)) => {
                if local.log_offset >= global.log_offset {
                    Some(local.clone())
                } else {
                    Some(global.clone())
                }
            }
            (Some(global), None) => Some(global.clone()),
            (None, Some(local)) => Some(local.clone()),
            (None, None) => None,
        };
        Ok(checkpoint)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn document() -> DocumentId {
        DocumentId::new("doc-1").expect("valid id")
    }

    fn checkpoint_at(offset: i64) -> ScribeCheckpoint {
        ScribeCheckpoint {
            log_offset: offset,
            ..ScribeCheckpoint::cold_start()
        }
    }

    #[tokio::test]
    async fn global_and_local_records_are_separate() {
        let repository = MemoryDocumentRepository::new();
        let document_id = document();

        repository
            .update_checkpoint(
                &document_id,
                &checkpoint_at(5),
                &[],
                CheckpointWriteOptions {
                    is_global: true,
                    mark_corrupt: false,
                    no_active_clients: false,
                },
            )
            .await
            .expect("global write");
        repository
            .update_checkpoint(
                &document_id,
                &checkpoint_at(9),
                &[],
                CheckpointWriteOptions {
                    is_global: false,
                    mark_corrupt: false,
                    no_active_clients: false,
                },
            )
            .await
            .expect("local write");

        assert_eq!(
            repository
                .global_checkpoint(&document_id)
                .map(|c| c.log_offset),
            Some(5)
        );
        assert_eq!(
            repository
                .local_checkpoint(&document_id)
                .map(|c| c.log_offset),
            Some(9)
        );
    }

    #[tokio::test]
    async fn load_prefers_the_fresher_record() {
        let repository = MemoryDocumentRepository::new();
        let document_id = document();

        repository
            .update_checkpoint(
                &document_id,
                &checkpoint_at(5),
                &[],
                CheckpointWriteOptions {
                    is_global: true,
                    mark_corrupt: false,
                    no_active_clients: false,
                },
            )
            .await
            .expect("global write");
        repository
            .update_checkpoint(
                &document_id,
                &checkpoint_at(9),
                &[],
                CheckpointWriteOptions {
                    is_global: false,
                    mark_corrupt: false,
                    no_active_clients: false,
                },
            )
            .await
            .expect("local write");

        let loaded = repository
            .load_checkpoint(&document_id)
            .await
            .expect("load")
            .expect("present");
        assert_eq!(loaded.log_offset, 9);
    }

    #[tokio::test]
    async fn op_inserts_are_idempotent_upserts() {
        let repository = MemoryDocumentRepository::new();
        let document_id = document();
        let ops = vec![
            SequencedMessage::new(scribe_core::MessageKind::Op, 1, 0, 0),
            SequencedMessage::new(scribe_core::MessageKind::Op, 2, 1, 1),
        ];

        for _ in 0..2 {
            repository
                .update_checkpoint(
                    &document_id,
                    &checkpoint_at(1),
                    &ops,
                    CheckpointWriteOptions {
                        is_global: true,
                        mark_corrupt: false,
                        no_active_clients: false,
                    },
                )
                .await
                .expect("write");
        }

        assert_eq!(repository.ops(&document_id).len(), 2);
    }

    #[tokio::test]
    async fn injected_failures_surface_as_transient() {
        let repository = MemoryDocumentRepository::new();
        let document_id = document();
        repository.fail_writes(true);

        let err = repository
            .update_checkpoint(
                &document_id,
                &checkpoint_at(1),
                &[],
                CheckpointWriteOptions {
                    is_global: true,
                    mark_corrupt: false,
                    no_active_clients: false,
                },
            )
            .await
            .expect_err("must fail");
        assert!(err.is_transient_storage());
        assert!(repository.writes(&document_id).is_empty());
    }
}
