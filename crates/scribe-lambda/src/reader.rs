//! Pending message reader: gap recovery from the op store.
//!
//! A partially persisted checkpoint can leave the worker with ops in the
//! op store that never reached its in-memory buffers. When a sequence gap
//! is observed, the reader refetches the missing range; without a reader
//! the gap is fatal for the document.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;

use scribe_core::{DocumentId, SequencedMessage};

use crate::error::{Error, Result};

/// Reads previously persisted ops to heal sequence gaps.
#[async_trait]
pub trait PendingMessageReader: Send + Sync + 'static {
    /// Returns the ordered ops covering the inclusive range `[from, to]`.
    ///
    /// # Errors
    ///
    /// Returns a transient storage error if the op store cannot be read.
    /// An incomplete range is not an error here; the caller detects it
    /// when the returned ops fail to close the gap.
    async fn read_messages(
        &self,
        document_id: &DocumentId,
        from: u64,
        to: u64,
    ) -> Result<Vec<SequencedMessage>>;
}

/// In-memory pending message reader for testing.
#[derive(Debug, Default)]
pub struct MemoryMessageReader {
    messages: Arc<RwLock<HashMap<DocumentId, BTreeMap<u64, SequencedMessage>>>>,
}

impl MemoryMessageReader {
    /// Creates a new empty reader.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds ops the reader can serve.
    ///
    /// # Panics
    ///
    /// Panics if the internal lock is poisoned.
    pub fn seed(&self, document_id: &DocumentId, ops: impl IntoIterator<Item = SequencedMessage>) {
        let mut messages = self.messages.write().expect("reader lock poisoned");
        let entries = messages.entry(document_id.clone()).or_default();
        for op in ops {
            entries.insert(op.sequence_number, op);
        }
    }
}

#[async_trait]
impl PendingMessageReader for MemoryMessageReader {
    async fn read_messages(
        &self,
        document_id: &DocumentId,
        from: u64,
        to: u64,
    ) -> Result<Vec<SequencedMessage>> {
        let messages = self
            .messages
            .read()
            .map_err(|_| Error::transient("reader lock poisoned"))?;
        Ok(messages
            .get(document_id)
            .map(|entries| {
                entries
                    .range(from..=to)
                    .map(|(_, op)| op.clone())
                    .collect()
            })
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use scribe_core::MessageKind;

    #[tokio::test]
    async fn reads_the_requested_range_in_order() {
        let reader = MemoryMessageReader::new();
        let document_id = DocumentId::new("doc-1").expect("document");
        reader.seed(
            &document_id,
            (1..=9).map(|n| SequencedMessage::new(MessageKind::Op, n, 0, 0)),
        );

        let ops = reader
            .read_messages(&document_id, 5, 6)
            .await
            .expect("read");
        assert_eq!(
            ops.iter().map(|o| o.sequence_number).collect::<Vec<_>>(),
            vec![5, 6]
        );
    }

    #[tokio::test]
    async fn unknown_document_yields_no_ops() {
        let reader = MemoryMessageReader::new();
        let document_id = DocumentId::new("ghost").expect("document");
        let ops = reader
            .read_messages(&document_id, 1, 10)
            .await
            .expect("read");
        assert!(ops.is_empty());
    }
}
