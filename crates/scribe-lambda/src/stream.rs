//! Upstream stream context: offset acknowledgement.
//!
//! The worker never acknowledges an offset before the checkpoint covering
//! it is durable. The acknowledger is the only channel back to the bus
//! driver; everything else about the stream (partition claims, rebalances)
//! stays on the driver's side.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::error::{Error, Result};

/// Identifies the most recent message of a partition for acknowledgement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckpointOffset {
    /// The stream offset to acknowledge.
    pub offset: i64,
    /// The partition the offset belongs to.
    pub partition: i32,
}

/// Acknowledges stream offsets to the upstream bus.
#[async_trait]
pub trait OffsetAcknowledger: Send + Sync + 'static {
    /// Acknowledges an offset. Idempotent per offset.
    ///
    /// `restart_on_failure` asks the driver to restart the worker if the
    /// acknowledgement cannot be delivered.
    ///
    /// # Errors
    ///
    /// Returns a transient storage error if the driver rejects the
    /// acknowledgement.
    async fn acknowledge(&self, offset: CheckpointOffset, restart_on_failure: bool) -> Result<()>;
}

/// In-memory acknowledger for testing; records offsets in order.
#[derive(Debug, Default)]
pub struct MemoryAcknowledger {
    acknowledged: Arc<Mutex<Vec<CheckpointOffset>>>,
}

impl MemoryAcknowledger {
    /// Creates a new empty acknowledger.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns every acknowledged offset, in acknowledgement order.
    ///
    /// # Panics
    ///
    /// Panics if the internal lock is poisoned.
    #[must_use]
    pub fn acknowledged(&self) -> Vec<CheckpointOffset> {
        self.acknowledged
            .lock()
            .expect("acknowledger lock poisoned")
            .clone()
    }
}

#[async_trait]
impl OffsetAcknowledger for MemoryAcknowledger {
    async fn acknowledge(&self, offset: CheckpointOffset, _restart_on_failure: bool) -> Result<()> {
        self.acknowledged
            .lock()
            .map_err(|_| Error::transient("acknowledger lock poisoned"))?
            .push(offset);
        Ok(())
    }
}
