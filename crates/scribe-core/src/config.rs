//! Configuration for the Scribe partition worker.

use std::collections::BTreeSet;
use std::time::Duration;

/// Controls when the worker persists a checkpoint.
#[derive(Debug, Clone)]
pub struct CheckpointHeuristicConfig {
    /// When false, every processed batch checkpoints immediately.
    pub enable: bool,
    /// Checkpoint once this many raw messages accumulated since the last one.
    pub max_messages: u64,
    /// Checkpoint once this much wall-clock time passed since the last one.
    pub max_time: Duration,
    /// With no other condition met, checkpoint after this much time passes
    /// without a new batch. Cancelled by any new batch.
    pub idle_time: Duration,
}

impl Default for CheckpointHeuristicConfig {
    fn default() -> Self {
        Self {
            enable: true,
            max_messages: 500,
            max_time: Duration::from_secs(30),
            idle_time: Duration::from_secs(10),
        }
    }
}

/// Per-partition configuration for the Scribe worker.
///
/// Every knob has a conservative default; deployments override the ones
/// they care about.
#[derive(Debug, Clone)]
pub struct ScribeConfig {
    /// Buffer ops for summary logtails (and persist them at checkpoints).
    pub enable_pending_checkpoint_messages: bool,
    /// Write service summaries when the session goes idle.
    pub generate_service_summary: bool,
    /// Scrub identifying user data from summary protocol trees.
    pub scrub_user_data_in_summaries: bool,
    /// Scrub identifying user data from global checkpoints.
    pub scrub_user_data_in_global_checkpoints: bool,
    /// Scrub identifying user data from local checkpoints.
    pub scrub_user_data_in_local_checkpoints: bool,
    /// Drop cached checkpoint state after a service summary instead of
    /// rewriting it.
    pub clear_cache_after_service_summary: bool,
    /// Suppress storage failures during summary writes: nack client
    /// summaries and carry on after service summaries rather than failing
    /// the document.
    pub ignore_storage_exception: bool,
    /// Upper bound on service-summary handles tracked as valid parents
    /// since the last client summary. Oldest handles are evicted first.
    pub max_tracked_service_summary_versions: usize,
    /// Cap on the pending-checkpoint-message buffer.
    pub max_pending_checkpoint_messages: u64,
    /// When a checkpoint fires.
    pub checkpoint_heuristics: CheckpointHeuristicConfig,
    /// Re-acknowledge the upstream offset when a batch at or below the
    /// last processed offset is re-delivered. Off by default: drivers that
    /// require monotone acknowledgements would regress.
    pub kafka_checkpoint_on_reprocessing_op: bool,
    /// Ask the upstream driver to restart the worker when an offset
    /// acknowledgement fails.
    pub restart_on_checkpoint_failure: bool,
    /// Permit partition-local checkpoints between global ones.
    pub local_checkpoint_enabled: bool,
    /// Disable the transient-tenant filter for service summaries.
    pub disable_transient_tenant_filtering: bool,
    /// Tenants whose sessions are transient; service summaries are skipped
    /// for them unless filtering is disabled.
    pub transient_tenants: BTreeSet<String>,
}

impl Default for ScribeConfig {
    fn default() -> Self {
        Self {
            enable_pending_checkpoint_messages: true,
            generate_service_summary: true,
            scrub_user_data_in_summaries: false,
            scrub_user_data_in_global_checkpoints: false,
            scrub_user_data_in_local_checkpoints: false,
            clear_cache_after_service_summary: false,
            ignore_storage_exception: false,
            max_tracked_service_summary_versions: 10,
            max_pending_checkpoint_messages: 2000,
            checkpoint_heuristics: CheckpointHeuristicConfig::default(),
            kafka_checkpoint_on_reprocessing_op: false,
            restart_on_checkpoint_failure: true,
            local_checkpoint_enabled: false,
            disable_transient_tenant_filtering: false,
            transient_tenants: BTreeSet::new(),
        }
    }
}

impl ScribeConfig {
    /// Returns true if service summaries are filtered out for this tenant.
    #[must_use]
    pub fn is_transient_tenant(&self, tenant_id: &str) -> bool {
        !self.disable_transient_tenant_filtering && self.transient_tenants.contains(tenant_id)
    }
}
