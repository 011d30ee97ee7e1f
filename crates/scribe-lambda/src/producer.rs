//! Outbound producer for service-generated ops.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use scribe_core::{DocumentId, SystemMessage, TenantId};

use crate::error::{Error, Result};

/// Emits service-generated ops (summary acks/nacks, control ops) back into
/// the document's stream.
#[async_trait]
pub trait MessageProducer: Send + Sync + 'static {
    /// Sends a system op for the given document.
    ///
    /// Ops must reach the stream in the order they are sent; the worker
    /// relies on this to preserve causality with the ops that triggered
    /// them.
    ///
    /// # Errors
    ///
    /// Returns a transient storage error if the bus rejects the op.
    async fn send(
        &self,
        tenant_id: &TenantId,
        document_id: &DocumentId,
        message: SystemMessage,
    ) -> Result<()>;
}

/// In-memory producer for testing; records sent ops in order.
#[derive(Debug, Default)]
pub struct MemoryProducer {
    sent: Arc<Mutex<Vec<SystemMessage>>>,
}

impl MemoryProducer {
    /// Creates a new empty producer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns every op sent so far, in send order.
    ///
    /// # Panics
    ///
    /// Panics if the internal lock is poisoned.
    #[must_use]
    pub fn sent(&self) -> Vec<SystemMessage> {
        self.sent.lock().expect("producer lock poisoned").clone()
    }
}

#[async_trait]
impl MessageProducer for MemoryProducer {
    async fn send(
        &self,
        _tenant_id: &TenantId,
        _document_id: &DocumentId,
        message: SystemMessage,
    ) -> Result<()> {
        self.sent
            .lock()
            .map_err(|_| Error::transient("producer lock poisoned"))?
            .push(message);
        Ok(())
    }
}
