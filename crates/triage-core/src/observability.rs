//! Observability infrastructure for triage components.
//!
//! Structured logging with consistent spans. This module provides
//! initialization helpers and span constructors so every pipeline worker
//! (ingest, dispatcher, consumer, executor) logs the same fields.

use std::sync::Once;
use tracing::Span;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

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
/// subsequent calls are no-ops.
///
/// # Environment Variables
///
/// - `RUST_LOG`: Controls log levels (e.g., `info`, `triage_pipeline=debug`)
///
/// # Example
///
/// ```rust
/// use triage_core::observability::{init_logging, LogFormat};
///
/// init_logging(LogFormat::Pretty);
/// ```
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

/// Creates a span for ingest operations with standard fields.
#[must_use]
pub fn ingest_span(operation: &str, batch_size: usize) -> Span {
    tracing::info_span!("ingest", op = operation, batch_size = batch_size)
}

/// Creates a span for outbox dispatch operations.
///
/// # Example
///
/// ```rust
/// use triage_core::observability::dispatch_span;
///
/// let span = dispatch_span("process_batch", "dispatcher-1");
/// let _guard = span.enter();
/// // ... publish claimed events
/// ```
#[must_use]
pub fn dispatch_span(operation: &str, worker: &str) -> Span {
    tracing::info_span!("dispatch", op = operation, worker = worker)
}

/// Creates a span for remediation action processing.
#[must_use]
pub fn action_span(operation: &str, action_id: &str, target_job: &str) -> Span {
    tracing::info_span!(
        "action",
        op = operation,
        action_id = action_id,
        target_job = target_job,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_logging_is_idempotent() {
        // Should not panic (uses Once internally)
        init_logging(LogFormat::Pretty);
        init_logging(LogFormat::Pretty);
    }

    #[test]
    fn span_helpers_create_spans() {
        let span = dispatch_span("process_batch", "worker-1");
        let _guard = span.enter();
        tracing::info!("test message in span");
    }

    #[test]
    fn action_span_creates_span() {
        let span = action_span("execute", "action-1", "nightly-build");
        let _guard = span.enter();
        tracing::info!("action message");
    }
}
