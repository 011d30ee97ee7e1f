//! Observability infrastructure: logging bootstrap and span constructors.
//!
//! Scribe relies on structured logging with consistent spans; every
//! collaborator call carries the owning tenant and document so per-session
//! traces can be stitched back together.

use std::sync::Once;
use tracing::Span;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

static INIT: Once = Once::new();

/// Log output format.
#[derive(Debug, Clone, Copy, Default)]
pub enum LogFormat {
    /// JSON structured logs (for production).
    Json,
    /// Pretty-printed logs (for development).
    #[default]
    Pretty,
}

/// Initializes the logging subsystem.
///
/// Call once at application startup. Safe to call multiple times;
/// subsequent calls are no-ops. Log levels come from `RUST_LOG`
/// (e.g. `info`, `scribe_lambda=debug`).
pub fn init_logging(format: LogFormat) {
    INIT.call_once(|| {
        let env_filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

        match format {
            LogFormat::Json => {
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(fmt::layer().json())
                    .init();
            }
            LogFormat::Pretty => {
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(fmt::layer().pretty())
                    .init();
            }
        }
    });
}

/// Creates a span for per-document session operations.
///
/// The worker wraps its entry points (create, handle, close) and its
/// background checkpoint tasks in this span, so events and collaborator
/// calls inside inherit the session identity instead of repeating it.
#[must_use]
pub fn session_span(operation: &str, tenant_id: &str, document_id: &str) -> Span {
    tracing::info_span!(
        "scribe",
        op = operation,
        tenant_id = tenant_id,
        document_id = document_id,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_logging_is_idempotent() {
        init_logging(LogFormat::Pretty);
        init_logging(LogFormat::Pretty);
    }

    #[test]
    fn session_span_carries_identity_fields() {
        let span = session_span("handle", "acme", "doc-1");
        let _guard = span.enter();
        tracing::info!("message inside session span");
    }
}
