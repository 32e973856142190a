//! Metric names and labels for pipeline observability.
//!
//! Centralized so dashboards and alerts never chase renamed strings.

/// Metric names.
pub mod names {
    /// Counter: outbox events published successfully.
    pub const OUTBOX_PUBLISHED_TOTAL: &str = "triage_outbox_published_total";
    /// Counter: outbox publish attempts that failed.
    pub const OUTBOX_PUBLISH_FAILURES_TOTAL: &str = "triage_outbox_publish_failures_total";
    /// Counter: outbox events that exhausted their retry budget.
    pub const OUTBOX_DEAD_LETTERED_TOTAL: &str = "triage_outbox_dead_lettered_total";
    /// Histogram: events claimed per dispatcher tick.
    pub const OUTBOX_CLAIM_BATCH_SIZE: &str = "triage_outbox_claim_batch_size";
    /// Counter: completed events removed by cleanup.
    pub const OUTBOX_PURGED_TOTAL: &str = "triage_outbox_purged_total";
    /// Counter: incidents detected at ingest.
    pub const INCIDENTS_DETECTED_TOTAL: &str = "triage_incidents_detected_total";
    /// Histogram: log entries per ingested batch.
    pub const INGEST_BATCH_SIZE: &str = "triage_ingest_batch_size";
    /// Counter: remediation actions reaching a terminal state.
    pub const ACTIONS_FINISHED_TOTAL: &str = "triage_actions_finished_total";
}

/// Metric label keys.
pub mod labels {
    /// Bus topic of the event.
    pub const TOPIC: &str = "topic";
    /// Terminal outcome of an action (`completed`/`failed`/`rejected`).
    pub const OUTCOME: &str = "outcome";
    /// Remediation verb.
    pub const ACTION_TYPE: &str = "action_type";
    /// Incident severity.
    pub const SEVERITY: &str = "severity";
    /// Log kind of an ingested batch.
    pub const LOG_KIND: &str = "log_kind";
}
