//! The Scribe lambda: per-document orchestrator over ordered op batches.
//!
//! One instance owns one document. The upstream driver serializes
//! [`ScribeLambda::handle`] calls; the worker's mutable state lives behind
//! an async mutex so the deferred idle-checkpoint task and the coalesced
//! checkpoint writer can observe it safely between batches.
//!
//! Durable-effect ordering per batch: the checkpoint is written to the
//! document repository first, and only then is the stream offset
//! acknowledged. At most one checkpoint write is in flight; the newest
//! request supersedes any queued one. A failed write skips the
//! acknowledgement so the batch can be re-delivered.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::Instrument;

use scribe_core::{
    CheckpointMessageBuffer, CheckpointReason, ControlContents, DocumentId, MessageBatch,
    MessageKind, PendingOpBuffer, ProtocolHandler, ProtocolState, ScribeCheckpoint, ScribeConfig,
    SequencedMessage, SummaryAckContents, SummaryNackContents, SummaryProposal, SystemMessage,
    TenantId, session_span,
};

use crate::checkpoint_manager::CheckpointManager;
use crate::error::{Error, Result};
use crate::metrics;
use crate::producer::MessageProducer;
use crate::reader::PendingMessageReader;
use crate::repository::DocumentRepository;
use crate::stream::{CheckpointOffset, OffsetAcknowledger};
use crate::summary::{SummaryResponse, SummaryWriter};

/// Why a worker instance was closed. Close is terminal; a new instance must
/// be constructed to resume the document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// The partition was rebalanced away.
    Rebalance,
    /// The driver is shutting the worker down after an error.
    Error,
    /// The process is shutting down.
    Shutdown,
    /// The driver stopped consuming.
    Stop,
}

impl CloseReason {
    /// Stable label for metrics and logs.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Rebalance => "rebalance",
            Self::Error => "error",
            Self::Shutdown => "shutdown",
            Self::Stop => "stop",
        }
    }
}

/// Identity of the document a worker instance owns.
#[derive(Debug, Clone)]
pub struct DocumentSession {
    /// The tenant owning the document.
    pub tenant_id: TenantId,
    /// The document being processed.
    pub document_id: DocumentId,
    /// Ephemeral containers are never durably summarized.
    pub is_ephemeral_container: bool,
}

/// The external collaborators a worker is constructed over.
pub struct ScribeServices {
    /// Durable checkpoint and op storage.
    pub repository: Arc<dyn DocumentRepository>,
    /// Outbound producer for service-generated ops.
    pub producer: Arc<dyn MessageProducer>,
    /// Upstream offset acknowledgement.
    pub acknowledger: Arc<dyn OffsetAcknowledger>,
    /// Client and service summary writer.
    pub summary_writer: Arc<dyn SummaryWriter>,
    /// Gap recovery from the op store; without it a sequence gap is fatal.
    pub reader: Option<Arc<dyn PendingMessageReader>>,
}

/// A checkpoint request waiting for the writer task.
struct PendingCheckpoint {
    reason: CheckpointReason,
    checkpoint: ScribeCheckpoint,
    protocol_head: u64,
    ops_to_insert: Vec<SequencedMessage>,
    no_active_clients: bool,
    global_only: bool,
    mark_corrupt: bool,
    clear_cache: bool,
    deferred: bool,
    offset: Option<CheckpointOffset>,
    skip_acknowledgement: bool,
}

/// Mutable per-document state, guarded by the shared mutex.
struct LambdaState {
    protocol: ProtocolHandler,
    pending_ops: PendingOpBuffer,
    pending_checkpoint_messages: CheckpointMessageBuffer,
    sequence_number: u64,
    minimum_sequence_number: u64,
    last_offset: i64,
    protocol_head: u64,
    last_summary_sequence_number: u64,
    last_client_summary_head: Option<String>,
    valid_parent_summaries: Vec<String>,
    no_active_clients: bool,
    global_checkpoint_only: bool,
    document_corrupt: bool,
    clear_cache: bool,
    closed: bool,
    latest_message: Option<CheckpointOffset>,
    raw_messages_since_checkpoint: u64,
    last_checkpoint_time: Instant,
    checkpoint_in_flight: bool,
    queued_checkpoint: Option<PendingCheckpoint>,
    idle_timer: Option<JoinHandle<()>>,
    idle_epoch: u64,
}

struct Shared {
    session: DocumentSession,
    config: ScribeConfig,
    services: ScribeServices,
    checkpoint_manager: CheckpointManager,
    state: Mutex<LambdaState>,
    checkpoint_settled: Notify,
}

/// The per-document stream processor.
///
/// Cloning yields another cheap handle to the same worker; the background
/// checkpoint writer and idle timer hold such handles.
#[derive(Clone)]
pub struct ScribeLambda {
    shared: Arc<Shared>,
}

impl ScribeLambda {
    /// Creates a worker seeded from a checkpoint and the tail of pending
    /// ops past the checkpoint's protocol state.
    ///
    /// # Errors
    ///
    /// Returns an error if the pending tail is out of order with respect
    /// to the checkpoint.
    pub fn new(
        session: DocumentSession,
        config: ScribeConfig,
        services: ScribeServices,
        checkpoint: ScribeCheckpoint,
        pending_tail: Vec<SequencedMessage>,
    ) -> Result<Self> {
        let protocol = ProtocolHandler::from_state(checkpoint.protocol_state.clone());

        let mut pending_ops = PendingOpBuffer::new();
        let mut pending_checkpoint_messages =
            CheckpointMessageBuffer::new(config.max_pending_checkpoint_messages);
        for op in pending_tail {
            if op.sequence_number <= protocol.sequence_number() {
                continue;
            }
            pending_ops.push_back(op.clone())?;
            if config.enable_pending_checkpoint_messages
                && op.sequence_number > checkpoint.protocol_head
            {
                pending_checkpoint_messages.insert(op, checkpoint.protocol_head)?;
            }
        }

        let checkpoint_manager = CheckpointManager::new(
            session.document_id.clone(),
            services.repository.clone(),
            config.local_checkpoint_enabled,
        );

        let state = LambdaState {
            protocol,
            pending_ops,
            pending_checkpoint_messages,
            sequence_number: checkpoint.sequence_number,
            minimum_sequence_number: checkpoint.minimum_sequence_number,
            last_offset: checkpoint.log_offset,
            protocol_head: checkpoint.protocol_head,
            last_summary_sequence_number: checkpoint.last_summary_sequence_number,
            last_client_summary_head: checkpoint.last_client_summary_head.clone(),
            valid_parent_summaries: checkpoint.valid_parent_summaries.clone(),
            no_active_clients: false,
            global_checkpoint_only: false,
            document_corrupt: checkpoint.is_corrupt,
            clear_cache: false,
            closed: false,
            latest_message: None,
            raw_messages_since_checkpoint: 0,
            last_checkpoint_time: Instant::now(),
            checkpoint_in_flight: false,
            queued_checkpoint: None,
            idle_timer: None,
            idle_epoch: 0,
        };

        metrics::record_session_started();
        {
            let span = session_span(
                "start",
                session.tenant_id.as_str(),
                session.document_id.as_str(),
            );
            let _guard = span.enter();
            tracing::info!(
                sequence_number = checkpoint.sequence_number,
                log_offset = checkpoint.log_offset,
                protocol_head = checkpoint.protocol_head,
                "scribe session started"
            );
        }

        Ok(Self {
            shared: Arc::new(Shared {
                session,
                config,
                services,
                checkpoint_manager,
                state: Mutex::new(state),
                checkpoint_settled: Notify::new(),
            }),
        })
    }

    /// Processes one batch of sequenced ops.
    ///
    /// Calls for the same document must be serialized by the driver; the
    /// worker suspends at collaborator calls but never interleaves two
    /// batches.
    ///
    /// # Errors
    ///
    /// Returns an error when the document must stop: a protocol violation,
    /// an unhealable sequence gap, or an unsuppressed storage failure. The
    /// driver decides whether to restart the worker.
    pub async fn handle(&self, batch: MessageBatch) -> Result<()> {
        let span = self.span("handle");
        self.handle_batch(batch).instrument(span).await
    }

    async fn handle_batch(&self, batch: MessageBatch) -> Result<()> {
        let mut state = self.shared.state.lock().await;
        if state.closed {
            return Err(Error::Closed);
        }
        cancel_idle_timer(&mut state);
        state.latest_message = Some(CheckpointOffset {
            offset: batch.offset,
            partition: batch.partition,
        });

        if batch.offset <= state.last_offset {
            tracing::info!(
                offset = batch.offset,
                last_offset = state.last_offset,
                "skipping already processed batch"
            );
            metrics::record_batch_reprocessed();
            if self.shared.config.kafka_checkpoint_on_reprocessing_op {
                // A checkpoint at or past this offset is already durable,
                // so re-acknowledging without a new write is safe.
                let offset = CheckpointOffset {
                    offset: batch.offset,
                    partition: batch.partition,
                };
                if let Err(e) = self
                    .shared
                    .services
                    .acknowledger
                    .acknowledge(offset, self.shared.config.restart_on_checkpoint_failure)
                    .await
                {
                    tracing::error!(
                        error = %e,
                        offset = batch.offset,
                        "failed to re-acknowledge offset"
                    );
                }
            }
            return Ok(());
        }
        state.last_offset = batch.offset;

        if state.document_corrupt {
            tracing::warn!("document is corrupt; pinning progress without side effects");
            let pending =
                self.assemble_pending_checkpoint(&state, CheckpointReason::MarkAsCorrupt, true);
            self.request_checkpoint(&mut state, pending);
            return Ok(());
        }

        state.raw_messages_since_checkpoint += batch.messages.len() as u64;
        metrics::add_ops_processed(batch.messages.len() as u64);
        state.clear_cache = false;

        for message in &batch.messages {
            self.process_message(&mut state, message).await?;
        }

        metrics::set_pending_ops(state.pending_ops.len());
        self.decide_checkpoint(&mut state);
        Ok(())
    }

    /// Closes the worker. Terminal: any in-flight checkpoint write settles
    /// but no new work is scheduled.
    pub async fn close(&self, reason: CloseReason) {
        let span = self.span("close");
        self.close_session(reason).instrument(span).await;
    }

    async fn close_session(&self, reason: CloseReason) {
        let mut state = self.shared.state.lock().await;
        if state.closed {
            return;
        }
        state.closed = true;
        cancel_idle_timer(&mut state);
        state.protocol.close();

        metrics::record_session_closed(reason.as_str());
        tracing::info!(
            reason = reason.as_str(),
            sequence_number = state.sequence_number,
            protocol_head = state.protocol_head,
            "scribe session closed"
        );
    }

    /// Session span for one of the worker's entry points.
    fn span(&self, operation: &str) -> tracing::Span {
        session_span(
            operation,
            self.shared.session.tenant_id.as_str(),
            self.shared.session.document_id.as_str(),
        )
    }

    /// Waits until no checkpoint write is in flight or queued.
    pub async fn quiesce(&self) {
        loop {
            let settled = self.shared.checkpoint_settled.notified();
            {
                let state = self.shared.state.lock().await;
                if !state.checkpoint_in_flight && state.queued_checkpoint.is_none() {
                    return;
                }
            }
            settled.await;
        }
    }

    // ------------------------------------------------------------------
    // Introspection
    // ------------------------------------------------------------------

    /// Sequence number of the last op the worker observed.
    pub async fn sequence_number(&self) -> u64 {
        self.shared.state.lock().await.sequence_number
    }

    /// Minimum sequence number of the last op the worker observed.
    pub async fn minimum_sequence_number(&self) -> u64 {
        self.shared.state.lock().await.minimum_sequence_number
    }

    /// Sequence number of the last op covered by a successful summary.
    pub async fn protocol_head(&self) -> u64 {
        self.shared.state.lock().await.protocol_head
    }

    /// Snapshot of the protocol handler's state.
    pub async fn protocol_state(&self) -> ProtocolState {
        self.shared
            .state
            .lock()
            .await
            .protocol
            .protocol_state(false)
    }

    /// Ops buffered ahead of the protocol handler.
    pub async fn pending_ops(&self) -> Vec<SequencedMessage> {
        self.shared.state.lock().await.pending_ops.to_vec()
    }

    /// Handle of the last accepted client summary.
    pub async fn last_client_summary_head(&self) -> Option<String> {
        self.shared
            .state
            .lock()
            .await
            .last_client_summary_head
            .clone()
    }

    /// Service-summary handles tracked since the last client summary.
    pub async fn valid_parent_summaries(&self) -> Vec<String> {
        self.shared.state.lock().await.valid_parent_summaries.clone()
    }

    /// True once the document was marked corrupt.
    pub async fn is_corrupt(&self) -> bool {
        self.shared.state.lock().await.document_corrupt
    }

    // ------------------------------------------------------------------
    // Per-op processing
    // ------------------------------------------------------------------

    async fn process_message(
        &self,
        state: &mut LambdaState,
        message: &SequencedMessage,
    ) -> Result<()> {
        let last_known = state
            .pending_ops
            .back()
            .map_or_else(|| state.protocol.sequence_number(), |op| op.sequence_number);

        // Partial-checkpoint re-delivery: ops the worker (or its buffers)
        // already account for are dropped silently.
        if message.sequence_number <= state.sequence_number
            || message.sequence_number <= last_known
        {
            tracing::debug!(
                sequence_number = message.sequence_number,
                "skipping op already accounted for"
            );
            return Ok(());
        }

        if message.sequence_number != last_known + 1 {
            self.heal_gap(state, last_known, message.sequence_number)
                .await?;
        }

        self.append_op(state, message.clone())?;
        state.sequence_number = message.sequence_number;
        let msn_changed = state.minimum_sequence_number != message.minimum_sequence_number;
        state.minimum_sequence_number = message.minimum_sequence_number;
        if msn_changed {
            self.drain_to(state, state.sequence_number)?;
        }

        match message.kind {
            MessageKind::Summarize => self.process_summarize(state, message).await?,
            MessageKind::NoClient => self.process_no_client(state, message).await?,
            MessageKind::SummaryAck => self.process_summary_ack(state, message)?,
            MessageKind::ClientJoin => {
                state.no_active_clients = false;
                if self.shared.config.local_checkpoint_enabled {
                    state.global_checkpoint_only = false;
                }
            }
            _ => {}
        }
        Ok(())
    }

    /// Fetches the missing range `(last_known, received)` from the op store.
    async fn heal_gap(
        &self,
        state: &mut LambdaState,
        last_known: u64,
        received: u64,
    ) -> Result<()> {
        let expected = last_known + 1;
        let Some(reader) = &self.shared.services.reader else {
            tracing::error!(
                expected,
                received,
                "sequence gap with no pending message reader"
            );
            return Err(Error::InvalidSequenceGap { expected, received });
        };

        tracing::warn!(expected, received, "sequence gap detected; reading missing ops");
        let missing = reader
            .read_messages(&self.shared.session.document_id, expected, received - 1)
            .await?;
        for op in missing {
            if op.sequence_number <= last_known || op.sequence_number >= received {
                continue;
            }
            self.append_op(state, op)?;
        }

        let healed_to = state
            .pending_ops
            .back()
            .map_or_else(|| state.protocol.sequence_number(), |op| op.sequence_number);
        if healed_to + 1 != received {
            return Err(Error::InvalidSequenceGap {
                expected: healed_to + 1,
                received,
            });
        }
        metrics::record_gap_healed(received - expected);
        Ok(())
    }

    fn append_op(&self, state: &mut LambdaState, op: SequencedMessage) -> Result<()> {
        state.pending_ops.push_back(op.clone())?;
        if self.shared.config.enable_pending_checkpoint_messages {
            state
                .pending_checkpoint_messages
                .insert(op, state.protocol_head)?;
        }
        Ok(())
    }

    /// Folds pending ops into the protocol handler up to `target`.
    fn drain_to(&self, state: &mut LambdaState, target: u64) -> Result<()> {
        while state
            .pending_ops
            .front()
            .is_some_and(|op| op.sequence_number <= target)
        {
            let Some(op) = state.pending_ops.pop_front() else {
                break;
            };
            if let Err(e) = state.protocol.process_message(&op, false) {
                tracing::error!(
                    error = %e,
                    sequence_number = op.sequence_number,
                    "protocol handler rejected op; marking document corrupt"
                );
                self.mark_corrupt(state);
                return Err(Error::protocol_violation(e.to_string()));
            }
        }
        Ok(())
    }

    /// Marks the document corrupt and pins progress without acknowledging
    /// the stream offset.
    fn mark_corrupt(&self, state: &mut LambdaState) {
        state.document_corrupt = true;
        let pending =
            self.assemble_pending_checkpoint(state, CheckpointReason::MarkAsCorrupt, true);
        self.request_checkpoint(state, pending);
    }

    // ------------------------------------------------------------------
    // Summary workflow
    // ------------------------------------------------------------------

    async fn process_summarize(
        &self,
        state: &mut LambdaState,
        op: &SequencedMessage,
    ) -> Result<()> {
        if op.deli_acked() {
            return Ok(());
        }
        let external = self.shared.services.summary_writer.is_external();
        if external && op.reference_sequence_number < state.protocol.sequence_number() {
            tracing::info!(
                reference_sequence_number = op.reference_sequence_number,
                protocol_sequence_number = state.protocol.sequence_number(),
                "summarizing client is behind; leaving the proposal to the external writer"
            );
            return Ok(());
        }

        // Snapshot for rollback: a nacked or failed summary must leave the
        // protocol state and pending buffer exactly as they were.
        let snapshot_protocol = state.protocol.clone();
        let snapshot_pending = state.pending_ops.to_vec();

        self.drain_to(state, op.reference_sequence_number)?;
        if state.protocol_head >= state.protocol.sequence_number() {
            tracing::debug!(
                protocol_head = state.protocol_head,
                "summary proposal is not newer than the protocol head"
            );
            return Ok(());
        }

        let checkpoint = self.assemble_checkpoint(state, false);
        let logtail_ops = state.pending_checkpoint_messages.to_vec();
        let started = Instant::now();
        let result = self
            .shared
            .services
            .summary_writer
            .write_client_summary(
                op,
                state.last_client_summary_head.as_deref(),
                &checkpoint,
                &logtail_ops,
                self.shared.session.is_ephemeral_container,
            )
            .await;
        let elapsed = started.elapsed().as_secs_f64();

        match result {
            Ok(outcome) if outcome.status => {
                metrics::record_summary("client", "success", elapsed);
                if external {
                    return Ok(());
                }
                let SummaryResponse::Ack(ack) = outcome.response else {
                    return Err(Error::transient(
                        "summary writer reported success without an ack",
                    ));
                };
                self.send(SystemMessage::SummaryAck(ack)).await?;
                self.send_summary_confirmation(op.sequence_number, true, false)
                    .await?;
                // A successful summary covers the summarize op itself.
                self.drain_to(state, op.sequence_number)?;
                state.protocol_head = state.protocol.sequence_number();
                state.last_summary_sequence_number = op.sequence_number;
                state
                    .pending_checkpoint_messages
                    .truncate(state.protocol_head);
            }
            Ok(outcome) => {
                metrics::record_summary("client", "nack", elapsed);
                state.protocol = snapshot_protocol;
                state.pending_ops.replace(snapshot_pending);
                if external {
                    return Ok(());
                }
                let SummaryResponse::Nack(nack) = outcome.response else {
                    return Err(Error::transient(
                        "summary writer reported rejection without a nack",
                    ));
                };
                self.send(SystemMessage::SummaryNack(nack)).await?;
            }
            Err(e) => {
                metrics::record_summary("client", "error", elapsed);
                tracing::error!(error = %e, "client summary failed");
                state.protocol = snapshot_protocol;
                state.pending_ops.replace(snapshot_pending);
                if !self.shared.config.ignore_storage_exception {
                    return Err(e);
                }
                if !external {
                    self.send(SystemMessage::SummaryNack(SummaryNackContents {
                        message: "Failed to summarize the document.".to_string(),
                        summary_proposal: SummaryProposal {
                            summary_sequence_number: op.sequence_number,
                        },
                    }))
                    .await?;
                }
            }
        }
        Ok(())
    }

    async fn process_no_client(
        &self,
        state: &mut LambdaState,
        op: &SequencedMessage,
    ) -> Result<()> {
        if op.reference_sequence_number != op.sequence_number
            || op.minimum_sequence_number != op.sequence_number
        {
            tracing::error!(
                sequence_number = op.sequence_number,
                reference_sequence_number = op.reference_sequence_number,
                minimum_sequence_number = op.minimum_sequence_number,
                "no-client op with inconsistent counters"
            );
            self.mark_corrupt(state);
            return Err(Error::protocol_violation(
                "no-client op with inconsistent counters",
            ));
        }

        state.no_active_clients = true;
        state.global_checkpoint_only = true;

        if !self.shared.config.generate_service_summary
            || self.shared.session.is_ephemeral_container
            || self
                .shared
                .config
                .is_transient_tenant(self.shared.session.tenant_id.as_str())
        {
            return Ok(());
        }

        let checkpoint = self.assemble_checkpoint(state, false);
        let logtail_ops = state.pending_checkpoint_messages.to_vec();
        let started = Instant::now();
        let result = self
            .shared
            .services
            .summary_writer
            .write_service_summary(op, state.protocol_head, &checkpoint, &logtail_ops)
            .await;
        let elapsed = started.elapsed().as_secs_f64();

        match result {
            Ok(Some(handle)) => {
                metrics::record_summary("service", "success", elapsed);
                let clear_cache = self.shared.config.clear_cache_after_service_summary;
                self.send_summary_confirmation(op.sequence_number, false, clear_cache)
                    .await?;
                state.last_summary_sequence_number = op.sequence_number;
                state.valid_parent_summaries.push(handle);
                while state.valid_parent_summaries.len()
                    > self.shared.config.max_tracked_service_summary_versions
                {
                    state.valid_parent_summaries.remove(0);
                }
                if clear_cache {
                    state.clear_cache = true;
                }
            }
            Ok(None) => {
                metrics::record_summary("service", "skipped", elapsed);
            }
            Err(e) => {
                metrics::record_summary("service", "error", elapsed);
                if self.shared.config.ignore_storage_exception {
                    tracing::warn!(error = %e, "ignoring service summary failure");
                } else {
                    tracing::error!(
                        error = %e,
                        "service summary failed; marking document corrupt"
                    );
                    self.mark_corrupt(state);
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    fn process_summary_ack(&self, state: &mut LambdaState, op: &SequencedMessage) -> Result<()> {
        let contents: SummaryAckContents = match op.payload_as() {
            Ok(contents) => contents,
            Err(e) => {
                tracing::error!(error = %e, "unparseable summary ack; marking document corrupt");
                self.mark_corrupt(state);
                return Err(e.into());
            }
        };

        state.last_client_summary_head = Some(contents.handle);
        state.valid_parent_summaries.clear();

        // With an external writer, the ack op in the stream is the only
        // signal that the protocol head advanced.
        if self.shared.services.summary_writer.is_external() {
            let summary_sequence_number = contents.summary_proposal.summary_sequence_number;
            state.protocol_head = summary_sequence_number;
            state.last_summary_sequence_number = summary_sequence_number;
            state
                .pending_checkpoint_messages
                .truncate(state.protocol_head);
        }
        Ok(())
    }

    async fn send(&self, message: SystemMessage) -> Result<()> {
        self.shared
            .services
            .producer
            .send(
                &self.shared.session.tenant_id,
                &self.shared.session.document_id,
                message,
            )
            .await
    }

    async fn send_summary_confirmation(
        &self,
        durable_sequence_number: u64,
        is_client_summary: bool,
        clear_cache: bool,
    ) -> Result<()> {
        self.send(SystemMessage::Control(
            ControlContents::UpdateDurableSequenceNumber {
                durable_sequence_number,
                is_client_summary,
                clear_cache,
            },
        ))
        .await
    }

    // ------------------------------------------------------------------
    // Checkpointing
    // ------------------------------------------------------------------

    fn decide_checkpoint(&self, state: &mut LambdaState) {
        let heuristics = &self.shared.config.checkpoint_heuristics;
        let reason = if state.no_active_clients {
            Some(CheckpointReason::NoClients)
        } else if !heuristics.enable {
            Some(CheckpointReason::EveryMessage)
        } else if state.raw_messages_since_checkpoint >= heuristics.max_messages {
            Some(CheckpointReason::MaxMessages)
        } else if state.last_checkpoint_time.elapsed() >= heuristics.max_time {
            Some(CheckpointReason::MaxTime)
        } else {
            None
        };

        match reason {
            Some(reason) => {
                let pending = self.assemble_pending_checkpoint(state, reason, false);
                self.request_checkpoint(state, pending);
            }
            None => self.arm_idle_timer(state),
        }
    }

    fn assemble_checkpoint(&self, state: &LambdaState, scrub_user_data: bool) -> ScribeCheckpoint {
        ScribeCheckpoint {
            sequence_number: state.sequence_number,
            minimum_sequence_number: state.minimum_sequence_number,
            protocol_state: state.protocol.protocol_state(scrub_user_data),
            log_offset: state.last_offset,
            last_summary_sequence_number: state.last_summary_sequence_number,
            last_client_summary_head: state.last_client_summary_head.clone(),
            valid_parent_summaries: state.valid_parent_summaries.clone(),
            protocol_head: state.protocol_head,
            is_corrupt: state.document_corrupt,
            checkpoint_timestamp: Utc::now(),
        }
    }

    fn assemble_pending_checkpoint(
        &self,
        state: &LambdaState,
        reason: CheckpointReason,
        skip_acknowledgement: bool,
    ) -> PendingCheckpoint {
        let is_global = self
            .shared
            .checkpoint_manager
            .is_global(state.no_active_clients, state.global_checkpoint_only);
        let scrub = if is_global {
            self.shared.config.scrub_user_data_in_global_checkpoints
        } else {
            self.shared.config.scrub_user_data_in_local_checkpoints
        };

        PendingCheckpoint {
            reason,
            checkpoint: self.assemble_checkpoint(state, scrub),
            protocol_head: state.protocol_head,
            ops_to_insert: if self.shared.config.enable_pending_checkpoint_messages {
                state.pending_checkpoint_messages.to_vec()
            } else {
                Vec::new()
            },
            no_active_clients: state.no_active_clients,
            global_only: state.global_checkpoint_only,
            mark_corrupt: state.document_corrupt,
            clear_cache: state.clear_cache,
            deferred: reason == CheckpointReason::IdleTime,
            offset: state.latest_message,
            skip_acknowledgement,
        }
    }

    /// Submits a checkpoint to the writer task. With a write already in
    /// flight the request lands in the single successor slot, superseding
    /// any queued one.
    fn request_checkpoint(&self, state: &mut LambdaState, pending: PendingCheckpoint) {
        state.raw_messages_since_checkpoint = 0;
        state.last_checkpoint_time = Instant::now();

        if state.checkpoint_in_flight {
            if state.queued_checkpoint.is_some() {
                metrics::record_checkpoint_coalesced();
            }
            state.queued_checkpoint = Some(pending);
            return;
        }
        state.checkpoint_in_flight = true;

        let worker = self.clone();
        let span = self.span("checkpoint");
        tokio::spawn(
            async move {
                worker.run_checkpoints(pending).await;
            }
            .instrument(span),
        );
    }

    /// Writer task: performs checkpoint writes one at a time, draining the
    /// successor slot until it is empty.
    async fn run_checkpoints(&self, first: PendingCheckpoint) {
        let shared = &self.shared;
        let mut next = Some(first);
        while let Some(pending) = next {
            let is_global = shared
                .checkpoint_manager
                .is_global(pending.no_active_clients, pending.global_only);
            let started = Instant::now();
            let result = if pending.clear_cache {
                shared
                    .checkpoint_manager
                    .delete(pending.protocol_head, pending.deferred)
                    .await
            } else {
                shared
                    .checkpoint_manager
                    .write(
                        &pending.checkpoint,
                        pending.protocol_head,
                        &pending.ops_to_insert,
                        pending.no_active_clients,
                        pending.global_only,
                        pending.mark_corrupt,
                    )
                    .await
            };
            let elapsed = started.elapsed().as_secs_f64();

            match result {
                Ok(()) => {
                    metrics::record_checkpoint(pending.reason, is_global, "success", elapsed);
                    if !pending.skip_acknowledgement {
                        if let Some(offset) = pending.offset {
                            if let Err(e) = shared
                                .services
                                .acknowledger
                                .acknowledge(
                                    offset,
                                    shared.config.restart_on_checkpoint_failure,
                                )
                                .await
                            {
                                tracing::error!(
                                    error = %e,
                                    offset = offset.offset,
                                    "failed to acknowledge stream offset"
                                );
                            }
                        }
                    }
                }
                Err(e) => {
                    metrics::record_checkpoint(pending.reason, is_global, "failure", elapsed);
                    tracing::error!(
                        error = %e,
                        reason = pending.reason.as_str(),
                        "checkpoint write failed; skipping acknowledgement"
                    );
                }
            }

            let mut state = shared.state.lock().await;
            if state.closed {
                state.queued_checkpoint = None;
                state.checkpoint_in_flight = false;
                drop(state);
                shared.checkpoint_settled.notify_waiters();
                return;
            }
            next = state.queued_checkpoint.take();
            if next.is_none() {
                state.checkpoint_in_flight = false;
            }
            drop(state);
            shared.checkpoint_settled.notify_waiters();
        }
    }

    // ------------------------------------------------------------------
    // Idle timer
    // ------------------------------------------------------------------

    fn arm_idle_timer(&self, state: &mut LambdaState) {
        cancel_idle_timer(state);
        let epoch = state.idle_epoch;
        let idle_time = self.shared.config.checkpoint_heuristics.idle_time;
        let worker = self.clone();
        let span = self.span("idle_checkpoint");

        state.idle_timer = Some(tokio::spawn(
            async move {
                tokio::time::sleep(idle_time).await;
                let mut state = worker.shared.state.lock().await;
                if state.closed || state.idle_epoch != epoch {
                    return;
                }
                let pending =
                    worker.assemble_pending_checkpoint(&state, CheckpointReason::IdleTime, false);
                worker.request_checkpoint(&mut state, pending);
            }
            .instrument(span),
        ));
    }
}

fn cancel_idle_timer(state: &mut LambdaState) {
    state.idle_epoch += 1;
    if let Some(handle) = state.idle_timer.take() {
        handle.abort();
    }
}
