//! Property-based tests for Scribe invariants.
//!
//! These tests use proptest to verify invariants hold across randomly
//! generated op streams: counter monotonicity, checkpoint/replay
//! equivalence, acknowledge-only-after-durable, summary rollback, and the
//! pending-checkpoint-buffer retention floor.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::collections::BTreeSet;
use std::sync::Arc;

use proptest::prelude::*;
use tokio_test::block_on;

use scribe_core::{
    CheckpointHeuristicConfig, CheckpointMessageBuffer, ClientDetail, ClientJoinContents,
    ClientLeaveContents, DocumentId, MessageBatch, MessageKind, Payload, ProposeContents,
    ScribeCheckpoint, ScribeConfig, SequencedMessage, SummarizeContents, TenantId, UserInfo,
};
use scribe_lambda::{
    DocumentRepository, DocumentSession, MemoryAcknowledger, MemoryDocumentRepository,
    MemoryMessageReader, MemoryProducer, ScribeLambda, ScribeServices, ScriptedClientSummary,
    ScriptedSummaryWriter,
};

// ============================================================================
// Op stream generation
// ============================================================================

/// A step of a generated stream, before sequence numbers are assigned.
#[derive(Debug, Clone)]
enum Step {
    Join(u8),
    Leave(u8),
    Op,
    Propose(u8),
}

fn arb_step() -> impl Strategy<Value = Step> {
    prop_oneof![
        2 => (0u8..5).prop_map(Step::Join),
        1 => (0u8..5).prop_map(Step::Leave),
        4 => Just(Step::Op),
        2 => (0u8..3).prop_map(Step::Propose),
    ]
}

/// MSN lag per op: how far the watermark trails the head.
fn arb_stream() -> impl Strategy<Value = Vec<(Step, u8)>> {
    prop::collection::vec((arb_step(), 0u8..4), 1..40)
}

fn join_contents(client: u8) -> Payload {
    Payload::from_value(&ClientJoinContents {
        client_id: format!("client-{client}"),
        detail: ClientDetail {
            user: UserInfo {
                id: format!("user-{client}@example.com"),
                name: None,
            },
            mode: Some("write".to_string()),
        },
    })
    .unwrap()
}

/// Turns generated steps into a valid sequenced op stream: contiguous
/// sequence numbers, non-decreasing MSN, joins/leaves consistent with the
/// active client set.
fn materialize(steps: &[(Step, u8)]) -> Vec<SequencedMessage> {
    let mut ops = Vec::new();
    let mut active: BTreeSet<u8> = BTreeSet::new();
    let mut msn = 0u64;

    for (index, (step, lag)) in steps.iter().enumerate() {
        let sequence_number = index as u64 + 1;
        msn = msn.max(sequence_number.saturating_sub(u64::from(*lag)));

        let mut op = match step {
            Step::Join(client) if !active.contains(client) => {
                active.insert(*client);
                let mut op =
                    SequencedMessage::new(MessageKind::ClientJoin, sequence_number, msn, msn);
                op.contents = join_contents(*client);
                op
            }
            Step::Leave(client) if active.contains(client) => {
                active.remove(client);
                let mut op =
                    SequencedMessage::new(MessageKind::ClientLeave, sequence_number, msn, msn);
                op.contents = Payload::from_value(&ClientLeaveContents {
                    client_id: format!("client-{client}"),
                })
                .unwrap();
                op
            }
            Step::Propose(key) => {
                let mut op =
                    SequencedMessage::new(MessageKind::Propose, sequence_number, msn, msn);
                op.contents = Payload::from_value(&ProposeContents {
                    key: format!("key-{key}"),
                    value: serde_json::json!(sequence_number),
                })
                .unwrap();
                op
            }
            _ => SequencedMessage::new(MessageKind::Op, sequence_number, msn, msn),
        };
        op.client_id = Some("generator".to_string());
        ops.push(op);
    }
    ops
}

/// Splits ops into batches with offsets 1, 2, 3, ...
fn into_batches(
    ops: Vec<SequencedMessage>,
    tenant_id: &TenantId,
    document_id: &DocumentId,
) -> Vec<MessageBatch> {
    ops.chunks(3)
        .enumerate()
        .map(|(index, chunk)| MessageBatch {
            offset: index as i64 + 1,
            partition: 0,
            tenant_id: tenant_id.clone(),
            document_id: document_id.clone(),
            messages: chunk.to_vec(),
        })
        .collect()
}

struct Fixture {
    lambda: ScribeLambda,
    repository: Arc<MemoryDocumentRepository>,
    acknowledger: Arc<MemoryAcknowledger>,
    writer: Arc<ScriptedSummaryWriter>,
}

fn fixture(checkpoint: ScribeCheckpoint, pending_tail: Vec<SequencedMessage>) -> Fixture {
    let repository = Arc::new(MemoryDocumentRepository::new());
    let acknowledger = Arc::new(MemoryAcknowledger::new());
    let writer = Arc::new(ScriptedSummaryWriter::new());
    let config = ScribeConfig {
        checkpoint_heuristics: CheckpointHeuristicConfig {
            enable: false,
            ..CheckpointHeuristicConfig::default()
        },
        ..ScribeConfig::default()
    };
    let lambda = ScribeLambda::new(
        DocumentSession {
            tenant_id: TenantId::new("acme").unwrap(),
            document_id: DocumentId::new("doc-1").unwrap(),
            is_ephemeral_container: false,
        },
        config,
        ScribeServices {
            repository: repository.clone(),
            producer: Arc::new(MemoryProducer::new()),
            acknowledger: acknowledger.clone(),
            summary_writer: writer.clone(),
            reader: Some(Arc::new(MemoryMessageReader::new())),
        },
        checkpoint,
        pending_tail,
    )
    .unwrap();
    Fixture {
        lambda,
        repository,
        acknowledger,
        writer,
    }
}

fn document_id() -> DocumentId {
    DocumentId::new("doc-1").unwrap()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    /// After every batch, the worker's counters match the stream: the
    /// sequence number is the maximum observed, the MSN is the last one.
    #[test]
    fn counters_track_the_stream(steps in arb_stream()) {
        block_on(async {
            let ops = materialize(&steps);
            let last_seq = ops.last().map_or(0, |op| op.sequence_number);
            let last_msn = ops.last().map_or(0, |op| op.minimum_sequence_number);
            let tenant_id = TenantId::new("acme").unwrap();
            let batches = into_batches(ops, &tenant_id, &document_id());

            let f = fixture(ScribeCheckpoint::cold_start(), Vec::new());
            for batch in batches {
                f.lambda.handle(batch).await.expect("handle");
            }

            prop_assert_eq!(f.lambda.sequence_number().await, last_seq);
            prop_assert_eq!(f.lambda.minimum_sequence_number().await, last_msn);

            // The protocol handler never runs ahead of the worker, and the
            // pending buffer resumes exactly where the handler stopped.
            let protocol = f.lambda.protocol_state().await;
            prop_assert!(protocol.sequence_number <= last_seq);
            if let Some(front) = f.lambda.pending_ops().await.first() {
                prop_assert_eq!(front.sequence_number, protocol.sequence_number + 1);
            }
            Ok(())
        })?;
    }

    /// Replaying from any persisted checkpoint reproduces the end state
    /// exactly: same protocol state, same counters, same head.
    #[test]
    fn replay_from_a_checkpoint_is_exact(steps in arb_stream(), split in 0usize..8) {
        block_on(async {
            let ops = materialize(&steps);
            let tenant_id = TenantId::new("acme").unwrap();
            let batches = into_batches(ops, &tenant_id, &document_id());
            let split = split.min(batches.len().saturating_sub(1)).max(1);

            // Straight run, checkpointing after every batch.
            let full = fixture(ScribeCheckpoint::cold_start(), Vec::new());
            for batch in &batches[..split] {
                full.lambda.handle(batch.clone()).await.expect("handle");
            }
            full.lambda.quiesce().await;

            let checkpoint = full
                .repository
                .load_checkpoint(&document_id())
                .await
                .expect("load")
                .expect("a checkpoint was persisted");
            let tail: Vec<SequencedMessage> = full
                .repository
                .ops(&document_id())
                .into_iter()
                .filter(|op| {
                    op.sequence_number > checkpoint.protocol_state.sequence_number
                        && op.sequence_number <= checkpoint.sequence_number
                })
                .collect();

            for batch in &batches[split..] {
                full.lambda.handle(batch.clone()).await.expect("handle");
            }

            // Resumed run from the persisted checkpoint.
            let resumed = fixture(checkpoint.clone(), tail);
            for batch in batches
                .iter()
                .filter(|batch| batch.offset > checkpoint.log_offset)
            {
                resumed.lambda.handle(batch.clone()).await.expect("handle");
            }

            prop_assert_eq!(
                resumed.lambda.protocol_state().await,
                full.lambda.protocol_state().await
            );
            prop_assert_eq!(
                resumed.lambda.sequence_number().await,
                full.lambda.sequence_number().await
            );
            prop_assert_eq!(
                resumed.lambda.minimum_sequence_number().await,
                full.lambda.minimum_sequence_number().await
            );
            prop_assert_eq!(
                resumed.lambda.protocol_head().await,
                full.lambda.protocol_head().await
            );
            Ok(())
        })?;
    }

    /// An offset is acknowledged only if a checkpoint covering it was
    /// durably written first, across random write failures.
    #[test]
    fn acknowledged_offsets_are_covered_by_durable_checkpoints(
        steps in arb_stream(),
        failures in prop::collection::vec(any::<bool>(), 1..20),
    ) {
        block_on(async {
            let ops = materialize(&steps);
            let tenant_id = TenantId::new("acme").unwrap();
            let batches = into_batches(ops, &tenant_id, &document_id());

            let f = fixture(ScribeCheckpoint::cold_start(), Vec::new());
            for (index, batch) in batches.into_iter().enumerate() {
                let fail = failures.get(index % failures.len()).copied().unwrap_or(false);
                f.repository.fail_writes(fail);
                f.lambda.handle(batch).await.expect("handle");
                f.lambda.quiesce().await;
            }
            f.repository.fail_writes(false);

            let durable: Vec<i64> = f
                .repository
                .writes(&document_id())
                .iter()
                .map(|write| write.checkpoint.log_offset)
                .collect();
            for acked in f.acknowledger.acknowledged() {
                prop_assert!(
                    durable.iter().any(|offset| *offset >= acked.offset),
                    "offset {} acknowledged without a covering checkpoint",
                    acked.offset
                );
            }
            Ok(())
        })?;
    }

    /// Acked summaries strictly advance the protocol head; nacked ones
    /// leave protocol state and pending buffer bit-equal to the snapshot.
    #[test]
    fn summary_outcomes_advance_or_roll_back(outcomes in prop::collection::vec(any::<bool>(), 1..10)) {
        block_on(async {
            let f = fixture(ScribeCheckpoint::cold_start(), Vec::new());
            let tenant_id = TenantId::new("acme").unwrap();
            let mut sequence_number = 0u64;
            let mut offset = 0i64;

            for accept in outcomes {
                // One plain op so the next proposal is newer than the head.
                sequence_number += 1;
                let filler = SequencedMessage::new(
                    MessageKind::Op,
                    sequence_number,
                    sequence_number,
                    sequence_number,
                );
                sequence_number += 1;
                let mut proposal = SequencedMessage::new(
                    MessageKind::Summarize,
                    sequence_number,
                    sequence_number - 1,
                    sequence_number - 1,
                );
                proposal.contents = Payload::from_value(&SummarizeContents {
                    handle: format!("tree-{sequence_number}"),
                    head: None,
                    message: None,
                    parents: Vec::new(),
                })
                .unwrap();

                f.writer.script_client(if accept {
                    ScriptedClientSummary::Accept {
                        handle: format!("h-{sequence_number}"),
                    }
                } else {
                    ScriptedClientSummary::Reject {
                        message: "rejected".to_string(),
                    }
                });

                let head_before = f.lambda.protocol_head().await;
                offset += 1;
                f.lambda
                    .handle(MessageBatch {
                        offset,
                        partition: 0,
                        tenant_id: tenant_id.clone(),
                        document_id: document_id().clone(),
                        messages: vec![filler.clone()],
                    })
                    .await
                    .expect("filler batch");

                let protocol_before = f.lambda.protocol_state().await;
                let pending_before = f.lambda.pending_ops().await;

                offset += 1;
                f.lambda
                    .handle(MessageBatch {
                        offset,
                        partition: 0,
                        tenant_id: tenant_id.clone(),
                        document_id: document_id().clone(),
                        messages: vec![proposal.clone()],
                    })
                    .await
                    .expect("proposal batch");

                let head_after = f.lambda.protocol_head().await;
                if accept {
                    prop_assert!(head_after > head_before, "ack must advance the head");
                    prop_assert_eq!(head_after, proposal.sequence_number);
                } else {
                    prop_assert_eq!(head_after, head_before, "nack must not move the head");
                    let mut expected_pending = pending_before.clone();
                    expected_pending.push(proposal.clone());
                    prop_assert_eq!(f.lambda.protocol_state().await, protocol_before);
                    prop_assert_eq!(f.lambda.pending_ops().await, expected_pending);
                }
            }
            Ok(())
        })?;
    }

    /// The pending-checkpoint buffer never retains ops at or below
    /// `max(protocol_head, last_inserted - cap)`.
    #[test]
    fn checkpoint_buffer_respects_the_retention_floor(
        count in 1u64..200,
        cap in 1u64..50,
        head_lag in 0u64..60,
    ) {
        let mut buffer = CheckpointMessageBuffer::new(cap);
        let mut protocol_head = 0u64;

        for sequence_number in 1..=count {
            protocol_head = sequence_number.saturating_sub(head_lag);
            buffer
                .insert(
                    SequencedMessage::new(MessageKind::Op, sequence_number, 0, 0),
                    protocol_head,
                )
                .expect("insert");

            if let Some(min) = buffer.min_sequence_number() {
                let floor = protocol_head.max(sequence_number.saturating_sub(cap));
                prop_assert!(
                    min > floor,
                    "min {} must sit above the floor {}",
                    min,
                    floor
                );
            }
        }
    }
}
