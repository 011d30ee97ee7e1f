//! Ordered op buffers: the pending-op buffer feeding the protocol handler
//! and the bounded buffer of ops awaiting attachment to a summary logtail.

use std::collections::VecDeque;

use crate::error::{Error, Result};
use crate::message::SequencedMessage;

/// FIFO buffer of ops not yet folded into the protocol handler.
///
/// Sequence numbers are strictly increasing; once any gaps have been healed,
/// the front op is exactly `protocol_handler.sequence_number() + 1`.
#[derive(Debug, Clone, Default)]
pub struct PendingOpBuffer {
    ops: VecDeque<SequencedMessage>,
}

impl PendingOpBuffer {
    /// Creates an empty buffer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an op to the back of the buffer.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutOfOrder`] if the op's sequence number is not
    /// strictly greater than the current back of the buffer.
    pub fn push_back(&mut self, op: SequencedMessage) -> Result<()> {
        if let Some(back) = self.ops.back() {
            if op.sequence_number <= back.sequence_number {
                return Err(Error::OutOfOrder {
                    previous: back.sequence_number,
                    received: op.sequence_number,
                });
            }
        }
        self.ops.push_back(op);
        Ok(())
    }

    /// Removes and returns the front op.
    pub fn pop_front(&mut self) -> Option<SequencedMessage> {
        self.ops.pop_front()
    }

    /// Returns the front op without removing it.
    #[must_use]
    pub fn front(&self) -> Option<&SequencedMessage> {
        self.ops.front()
    }

    /// Returns the back op without removing it.
    #[must_use]
    pub fn back(&self) -> Option<&SequencedMessage> {
        self.ops.back()
    }

    /// Returns the buffered ops in order.
    #[must_use]
    pub fn to_vec(&self) -> Vec<SequencedMessage> {
        self.ops.iter().cloned().collect()
    }

    /// Replaces the buffer contents, used to roll back a failed summary.
    pub fn replace(&mut self, ops: Vec<SequencedMessage>) {
        self.ops = ops.into();
    }

    /// Number of buffered ops.
    #[must_use]
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    /// Returns true if the buffer holds no ops.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

/// Bounded buffer of ops awaiting attachment to the next summary's logtail.
///
/// Entries at or below `max(protocol_head, last_inserted - max_len)` are
/// evicted on insert: ops covered by a summary are no longer needed, and the
/// buffer never grows past its configured cap.
#[derive(Debug, Clone)]
pub struct CheckpointMessageBuffer {
    messages: VecDeque<SequencedMessage>,
    max_len: u64,
}

impl CheckpointMessageBuffer {
    /// Creates an empty buffer with the given cap.
    #[must_use]
    pub fn new(max_len: u64) -> Self {
        Self {
            messages: VecDeque::new(),
            max_len,
        }
    }

    /// Inserts an op and evicts entries below the retention floor.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutOfOrder`] if the op's sequence number is not
    /// strictly greater than the current back of the buffer.
    pub fn insert(&mut self, op: SequencedMessage, protocol_head: u64) -> Result<()> {
        if let Some(back) = self.messages.back() {
            if op.sequence_number <= back.sequence_number {
                return Err(Error::OutOfOrder {
                    previous: back.sequence_number,
                    received: op.sequence_number,
                });
            }
        }
        let last_inserted = op.sequence_number;
        self.messages.push_back(op);
        self.evict_below(floor(protocol_head, last_inserted, self.max_len));
        Ok(())
    }

    /// Evicts entries covered by a newly advanced protocol head.
    pub fn truncate(&mut self, protocol_head: u64) {
        let last_inserted = self.messages.back().map_or(0, |op| op.sequence_number);
        self.evict_below(floor(protocol_head, last_inserted, self.max_len));
    }

    /// Returns the buffered ops in order.
    #[must_use]
    pub fn to_vec(&self) -> Vec<SequencedMessage> {
        self.messages.iter().cloned().collect()
    }

    /// Sequence number of the oldest buffered op.
    #[must_use]
    pub fn min_sequence_number(&self) -> Option<u64> {
        self.messages.front().map(|op| op.sequence_number)
    }

    /// Number of buffered ops.
    #[must_use]
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    /// Returns true if the buffer holds no ops.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    fn evict_below(&mut self, floor: u64) {
        while self
            .messages
            .front()
            .is_some_and(|op| op.sequence_number <= floor)
        {
            self.messages.pop_front();
        }
    }
}

/// Retention floor: everything at or below it may be evicted.
fn floor(protocol_head: u64, last_inserted: u64, max_len: u64) -> u64 {
    protocol_head.max(last_inserted.saturating_sub(max_len))
}
