//! Scribe session metrics.
//!
//! Output-only instrumentation: nothing in the worker's observable
//! behavior depends on these. They complement the structured logging
//! carried on every collaborator call.

use metrics::{
    counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram,
};

use scribe_core::CheckpointReason;

// ============================================================================
// Op Processing Metrics
// ============================================================================

/// Ops processed counter.
pub const OPS_PROCESSED: &str = "scribe_ops_processed_total";

/// Re-delivered batches counter.
pub const BATCHES_REPROCESSED: &str = "scribe_batches_reprocessed_total";

/// Sequence gaps healed via the pending message reader.
pub const GAPS_HEALED: &str = "scribe_sequence_gaps_healed_total";

/// Pending-op backlog gauge.
pub const PENDING_OPS: &str = "scribe_pending_ops";

// ============================================================================
// Checkpoint Metrics
// ============================================================================

/// Checkpoints counter, labelled by reason, target, and outcome.
pub const CHECKPOINTS: &str = "scribe_checkpoints_total";

/// Checkpoint write duration histogram.
pub const CHECKPOINT_DURATION: &str = "scribe_checkpoint_duration_seconds";

/// Coalesced (superseded) checkpoint requests counter.
pub const CHECKPOINTS_COALESCED: &str = "scribe_checkpoints_coalesced_total";

// ============================================================================
// Summary Metrics
// ============================================================================

/// Summaries counter, labelled by kind and outcome.
pub const SUMMARIES: &str = "scribe_summaries_total";

/// Summary write duration histogram.
pub const SUMMARY_DURATION: &str = "scribe_summary_duration_seconds";

// ============================================================================
// Session Metrics
// ============================================================================

/// Session starts counter.
pub const SESSIONS_STARTED: &str = "scribe_sessions_started_total";

/// Session closes counter, labelled by close reason.
pub const SESSIONS_CLOSED: &str = "scribe_sessions_closed_total";

// ============================================================================
// Metric Registration
// ============================================================================

/// Registers all Scribe metric descriptions.
///
/// Call this once at application startup after initializing the metrics
/// recorder.
pub fn register_metrics() {
    describe_counter!(OPS_PROCESSED, "Total sequenced ops processed");
    describe_counter!(BATCHES_REPROCESSED, "Total re-delivered batches skipped");
    describe_counter!(GAPS_HEALED, "Total sequence gaps healed from the op store");
    describe_gauge!(PENDING_OPS, "Ops buffered ahead of the protocol handler");
    describe_counter!(CHECKPOINTS, "Total checkpoint attempts");
    describe_histogram!(CHECKPOINT_DURATION, "Checkpoint write duration in seconds");
    describe_counter!(
        CHECKPOINTS_COALESCED,
        "Checkpoint requests superseded while a write was in flight"
    );
    describe_counter!(SUMMARIES, "Total summary attempts");
    describe_histogram!(SUMMARY_DURATION, "Summary write duration in seconds");
    describe_counter!(SESSIONS_STARTED, "Total scribe sessions started");
    describe_counter!(SESSIONS_CLOSED, "Total scribe sessions closed");
}

// ============================================================================
// Recording Helpers
// ============================================================================

/// Records ops processed for a batch.
pub fn add_ops_processed(count: u64) {
    counter!(OPS_PROCESSED).increment(count);
}

/// Records a re-delivered batch.
pub fn record_batch_reprocessed() {
    counter!(BATCHES_REPROCESSED).increment(1);
}

/// Records a healed sequence gap of the given width.
pub fn record_gap_healed(width: u64) {
    counter!(GAPS_HEALED).increment(width);
}

/// Records the pending-op backlog.
#[allow(clippy::cast_precision_loss)]
pub fn set_pending_ops(count: usize) {
    gauge!(PENDING_OPS).set(count as f64);
}

/// Records a checkpoint outcome.
pub fn record_checkpoint(
    reason: CheckpointReason,
    is_global: bool,
    outcome: &str,
    duration_secs: f64,
) {
    let target = if is_global { "global" } else { "local" };
    counter!(
        CHECKPOINTS,
        "reason" => reason.as_str(),
        "target" => target,
        "outcome" => outcome.to_string()
    )
    .increment(1);
    histogram!(CHECKPOINT_DURATION, "reason" => reason.as_str()).record(duration_secs);
}

/// Records a superseded checkpoint request.
pub fn record_checkpoint_coalesced() {
    counter!(CHECKPOINTS_COALESCED).increment(1);
}

/// Records a summary outcome (`kind` is "client" or "service").
pub fn record_summary(kind: &'static str, outcome: &str, duration_secs: f64) {
    counter!(
        SUMMARIES,
        "kind" => kind,
        "outcome" => outcome.to_string()
    )
    .increment(1);
    histogram!(SUMMARY_DURATION, "kind" => kind).record(duration_secs);
}

/// Records a session start.
pub fn record_session_started() {
    counter!(SESSIONS_STARTED).increment(1);
}

/// Records a session close.
pub fn record_session_closed(reason: &'static str) {
    counter!(SESSIONS_CLOSED, "reason" => reason).increment(1);
}
