//! Bootstrap: seeding a worker from durable state.
//!
//! When a partition claims a document it loads the latest checkpoint
//! (falling back to a cold start for brand-new documents) and refetches
//! the tail of ops the checkpoint's protocol state has not folded yet, so
//! the new instance resumes exactly where the previous one stopped.

use tracing::Instrument;

use scribe_core::{ScribeCheckpoint, ScribeConfig, SequencedMessage, session_span};

use crate::error::Result;
use crate::lambda::{DocumentSession, ScribeLambda, ScribeServices};

/// Loads durable state and constructs a worker for the document.
///
/// # Errors
///
/// Returns an error if the repository or op store cannot be read, or if
/// the stored tail is inconsistent with the checkpoint.
pub async fn create_lambda(
    session: DocumentSession,
    config: ScribeConfig,
    services: ScribeServices,
) -> Result<ScribeLambda> {
    let span = session_span(
        "create",
        session.tenant_id.as_str(),
        session.document_id.as_str(),
    );
    async move {
        let checkpoint = services
            .repository
            .load_checkpoint(&session.document_id)
            .await?
            .unwrap_or_else(ScribeCheckpoint::cold_start);

        let pending_tail = load_pending_tail(&session, &services, &checkpoint).await?;

        tracing::info!(
            sequence_number = checkpoint.sequence_number,
            pending_tail = pending_tail.len(),
            "seeding scribe lambda from storage"
        );

        ScribeLambda::new(session, config, services, checkpoint, pending_tail)
    }
    .instrument(span)
    .await
}

/// Ops in `(protocol_state.sequence_number, checkpoint.sequence_number]`:
/// observed by the previous instance but not yet folded into the protocol
/// state the checkpoint carries.
async fn load_pending_tail(
    session: &DocumentSession,
    services: &ScribeServices,
    checkpoint: &ScribeCheckpoint,
) -> Result<Vec<SequencedMessage>> {
    let from = checkpoint.protocol_state.sequence_number + 1;
    let to = checkpoint.sequence_number;
    if from > to {
        return Ok(Vec::new());
    }
    let Some(reader) = &services.reader else {
        // Without a reader the tail is healed lazily on the first gap, or
        // is fatal if gap healing is unavailable.
        tracing::warn!(from, to, "no pending message reader; starting with an empty tail");
        return Ok(Vec::new());
    };
    reader
        .read_messages(&session.document_id, from, to)
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use scribe_core::{DocumentId, MessageKind, TenantId};

    use crate::producer::MemoryProducer;
    use crate::reader::MemoryMessageReader;
    use crate::repository::{DocumentRepository, MemoryDocumentRepository};
    use crate::stream::MemoryAcknowledger;
    use crate::summary::ScriptedSummaryWriter;

    fn session() -> DocumentSession {
        DocumentSession {
            tenant_id: TenantId::new("acme").expect("tenant"),
            document_id: DocumentId::new("doc-1").expect("document"),
            is_ephemeral_container: false,
        }
    }

    fn services(
        repository: Arc<MemoryDocumentRepository>,
        reader: Option<Arc<dyn crate::reader::PendingMessageReader>>,
    ) -> ScribeServices {
        ScribeServices {
            repository,
            producer: Arc::new(MemoryProducer::new()),
            acknowledger: Arc::new(MemoryAcknowledger::new()),
            summary_writer: Arc::new(ScriptedSummaryWriter::new()),
            reader,
        }
    }

    #[tokio::test]
    async fn cold_document_starts_from_the_default_checkpoint() {
        let repository = Arc::new(MemoryDocumentRepository::new());
        let lambda = create_lambda(session(), ScribeConfig::default(), services(repository, None))
            .await
            .expect("create");

        assert_eq!(lambda.sequence_number().await, 0);
        assert_eq!(lambda.protocol_head().await, 0);
        assert!(lambda.pending_ops().await.is_empty());
    }

    #[tokio::test]
    async fn seeded_document_refetches_the_pending_tail() {
        let repository = Arc::new(MemoryDocumentRepository::new());
        let reader = Arc::new(MemoryMessageReader::new());
        let session = session();

        // Checkpoint at seq 6 whose protocol state only reached seq 4.
        let mut checkpoint = ScribeCheckpoint::cold_start();
        checkpoint.sequence_number = 6;
        checkpoint.minimum_sequence_number = 4;
        checkpoint.protocol_state.sequence_number = 4;
        checkpoint.protocol_state.minimum_sequence_number = 4;
        checkpoint.log_offset = 42;
        repository.seed_checkpoint(&session.document_id, checkpoint);
        reader.seed(
            &session.document_id,
            (1..=6).map(|n| SequencedMessage::new(MessageKind::Op, n, 4, 4)),
        );

        let lambda = create_lambda(
            session.clone(),
            ScribeConfig::default(),
            services(repository.clone(), Some(reader.clone())),
        )
        .await
        .expect("create");

        assert_eq!(lambda.sequence_number().await, 6);
        let pending: Vec<u64> = lambda
            .pending_ops()
            .await
            .iter()
            .map(|op| op.sequence_number)
            .collect();
        assert_eq!(pending, vec![5, 6]);

        // The loaded checkpoint came through the repository contract.
        let loaded = repository
            .load_checkpoint(&session.document_id)
            .await
            .expect("load")
            .expect("present");
        assert_eq!(loaded.log_offset, 42);
    }
}
