//! Pluggable storage for pipeline state.
//!
//! Three per-aggregate traits ([`OutboxStore`], [`IncidentStore`],
//! [`ActionStore`]) own their tables exclusively; the [`Store`] supertrait
//! adds the cross-aggregate atomic primitives that make the outbox pattern
//! work: "write state + schedule event" commits as one unit or not at all.
//!
//! ## Design Principles
//!
//! - **Atomic claims**: Claiming outbox events is exclusive under concurrent
//!   dispatchers without an external lock service (the relational analogue is
//!   `FOR UPDATE SKIP LOCKED`)
//! - **Atomic slot reservation**: The executor's concurrency limit is checked
//!   and the `pending → running` transition applied in one step, so two
//!   workers cannot oversubscribe the limit
//! - **Testability**: In-memory implementation for tests, a relational
//!   database for production

pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use triage_core::{ActionId, EventId, IncidentId, LogId};

use crate::action::{ActionOutcome, ActionRequest, ActionStatus};
use crate::error::Result;
use crate::event::{OutboxEvent, OutboxStatus};
use crate::incident::{Incident, IncidentSeverity, IncidentStatus, ResolutionMethod};
use crate::log::LogEntry;

/// Result of the atomic running-slot reservation.
///
/// Reserving a slot checks the concurrency limit and applies the
/// `pending → running` transition in one step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BeginOutcome {
    /// The action transitioned to `running`.
    Started,
    /// The concurrency limit is reached; the action stays `pending`.
    AtCapacity {
        /// Actions currently running.
        running: usize,
        /// The configured limit.
        limit: usize,
    },
    /// The action does not exist.
    NotFound,
    /// The action is not `pending` (another worker got there first, or it
    /// already finished).
    NotPending {
        /// The status that was found.
        actual: ActionStatus,
    },
}

impl BeginOutcome {
    /// Returns true if the slot was reserved.
    #[must_use]
    pub const fn is_started(&self) -> bool {
        matches!(self, Self::Started)
    }
}

/// Outbox counters over a time window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OutboxStats {
    /// Events waiting to be claimed.
    pub pending: usize,
    /// Events currently claimed.
    pub processing: usize,
    /// Events published.
    pub completed: usize,
    /// Events that exhausted their retry budget.
    pub failed: usize,
    /// All events in the window.
    pub total: usize,
}

/// Incident counters over a time window.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct IncidentStats {
    /// All incidents in the window.
    pub total: usize,
    /// By severity.
    pub critical: usize,
    /// By severity.
    pub high: usize,
    /// By severity.
    pub medium: usize,
    /// By severity.
    pub low: usize,
    /// By status.
    pub detected: usize,
    /// By status.
    pub notified: usize,
    /// By status.
    pub acknowledged: usize,
    /// By status.
    pub investigating: usize,
    /// By status.
    pub resolved: usize,
    /// Mean time to resolution over resolved incidents, in minutes.
    pub mttr_minutes: Option<f64>,
}

/// Action counters over a time window.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ActionStats {
    /// All actions in the window.
    pub total: usize,
    /// By status.
    pub pending: usize,
    /// By status.
    pub running: usize,
    /// By status.
    pub completed: usize,
    /// By status.
    pub failed: usize,
    /// By status.
    pub rejected: usize,
    /// By type.
    pub restarts: usize,
    /// By type.
    pub rollbacks: usize,
    /// By type.
    pub stops: usize,
    /// `completed / total`, as a percentage.
    pub success_rate: f64,
    /// Average duration of completed actions, in seconds.
    pub avg_duration_seconds: Option<f64>,
}

/// Storage for outbox events. Transitions are driven exclusively by the
/// dispatcher.
#[async_trait]
pub trait OutboxStore: Send + Sync {
    /// Claims up to `batch_size` due events for exclusive processing.
    ///
    /// Selects events that are `pending` (or `failed` with a due retry
    /// timer), ordered by creation time, and atomically transitions them to
    /// `processing` with `processed_at = now`. Events another instance
    /// already holds are skipped, never blocked on. Events stuck in
    /// `processing` longer than `lock_timeout` are considered abandoned by a
    /// dead worker and are reclaimed.
    async fn claim_batch(
        &self,
        batch_size: usize,
        lock_timeout: chrono::Duration,
        now: DateTime<Utc>,
    ) -> Result<Vec<OutboxEvent>>;

    /// Marks a claimed event published.
    async fn mark_completed(&self, event_id: EventId, now: DateTime<Utc>) -> Result<()>;

    /// Records a failed publish attempt.
    ///
    /// Increments `retry_count`; when the budget is exhausted the event
    /// becomes terminally `failed` with no retry timer, otherwise it returns
    /// to `pending` with `next_retry_at = now + backoff_base * 2^retry_count`.
    /// Returns the resulting status.
    async fn mark_failed(
        &self,
        event_id: EventId,
        error: &str,
        backoff_base: chrono::Duration,
        now: DateTime<Utc>,
    ) -> Result<OutboxStatus>;

    /// Deletes completed events older than the retention window. Returns the
    /// number of deleted events.
    async fn purge_completed(
        &self,
        retention: chrono::Duration,
        now: DateTime<Utc>,
    ) -> Result<usize>;

    /// Gets an event by ID.
    async fn get_event(&self, event_id: EventId) -> Result<Option<OutboxEvent>>;

    /// Returns counters for events created within `window` of `now`.
    async fn outbox_stats(&self, window: chrono::Duration, now: DateTime<Utc>)
        -> Result<OutboxStats>;
}

/// Storage for incident records.
#[async_trait]
pub trait IncidentStore: Send + Sync {
    /// Gets an incident by ID.
    async fn get_incident(&self, incident_id: IncidentId) -> Result<Option<Incident>>;

    /// Marks incidents notified. Incidents that already advanced past
    /// `notified` are left untouched (duplicate delivery is expected).
    async fn mark_notified(&self, incident_ids: &[IncidentId], now: DateTime<Utc>) -> Result<()>;

    /// Advances an incident's status, enforcing the monotone lifecycle.
    ///
    /// `actor` is recorded on acknowledge/resolve; `notes` on resolve.
    async fn update_incident_status(
        &self,
        incident_id: IncidentId,
        status: IncidentStatus,
        actor: Option<&str>,
        notes: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<()>;

    /// Returns unresolved incidents, newest first.
    async fn active_incidents(&self, limit: usize) -> Result<Vec<Incident>>;

    /// Returns incidents of a severity, newest first.
    async fn incidents_by_severity(
        &self,
        severity: IncidentSeverity,
        limit: usize,
    ) -> Result<Vec<Incident>>;

    /// Returns counters for incidents detected within `window` of `now`.
    async fn incident_stats(
        &self,
        window: chrono::Duration,
        now: DateTime<Utc>,
    ) -> Result<IncidentStats>;
}

/// Storage for remediation action requests. Mutations are driven exclusively
/// by the executor.
#[async_trait]
pub trait ActionStore: Send + Sync {
    /// Gets an action by ID.
    async fn get_action(&self, action_id: ActionId) -> Result<Option<ActionRequest>>;

    /// Returns pending actions, oldest first.
    async fn pending_actions(&self, limit: usize) -> Result<Vec<ActionRequest>>;

    /// Atomically reserves a running slot for a pending action.
    ///
    /// See [`BeginOutcome`] for the possible results. This is the
    /// concurrency-limit primitive: the capacity check and the
    /// `pending → running` transition happen in one step.
    async fn try_begin_action(
        &self,
        action_id: ActionId,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<BeginOutcome>;

    /// Marks a running action completed with its structured result and
    /// records `duration_seconds`.
    async fn complete_action(
        &self,
        action_id: ActionId,
        outcome: ActionOutcome,
        now: DateTime<Utc>,
    ) -> Result<()>;

    /// Marks a running action failed with an error message.
    async fn fail_action(&self, action_id: ActionId, error: &str, now: DateTime<Utc>)
        -> Result<()>;

    /// Marks a pending action rejected with the guard's reason. Rejection
    /// bypasses `running`.
    async fn reject_action(
        &self,
        action_id: ActionId,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<()>;

    /// Returns the number of actions currently `running`.
    async fn running_count(&self) -> Result<usize>;

    /// Returns action history for a job, newest first.
    async fn actions_by_job(&self, job: &str, limit: usize) -> Result<Vec<ActionRequest>>;

    /// Returns all actions linked to an incident, newest first.
    async fn actions_by_incident(&self, incident_id: IncidentId) -> Result<Vec<ActionRequest>>;

    /// Returns counters for actions created within `window` of `now`.
    async fn action_stats(&self, window: chrono::Duration, now: DateTime<Utc>)
        -> Result<ActionStats>;
}

/// Full pipeline storage: the per-aggregate stores plus the cross-aggregate
/// atomic primitives.
///
/// Implementations must guarantee that each primitive commits all of its
/// writes or none of them; this is what lets the dispatcher assume "if an
/// incident exists, its notification event also exists".
#[async_trait]
pub trait Store: OutboxStore + IncidentStore + ActionStore {
    /// Atomically persists a log batch, its detected incidents, and the
    /// outbox events announcing them.
    async fn ingest(
        &self,
        logs: Vec<(LogId, LogEntry)>,
        incidents: Vec<Incident>,
        events: Vec<OutboxEvent>,
    ) -> Result<()>;

    /// Atomically persists a remediation request and the outbox event
    /// announcing it. Returns the action id.
    async fn submit_action(&self, action: ActionRequest, event: OutboxEvent) -> Result<ActionId>;

    /// Atomically resolves an incident and enqueues the resolution event.
    ///
    /// Returns `false` without writing anything if the incident is already
    /// resolved (remediation racing a manual resolve is expected, not an
    /// error).
    async fn resolve_incident(
        &self,
        incident_id: IncidentId,
        method: ResolutionMethod,
        resolved_by: &str,
        notes: Option<&str>,
        event: OutboxEvent,
        now: DateTime<Utc>,
    ) -> Result<bool>;

    /// Finds the newest unresolved incident for a job (and build, when
    /// given). Used to link remediation results back to their incident.
    async fn find_active_incident(
        &self,
        job: &str,
        build: Option<u32>,
    ) -> Result<Option<Incident>>;

    /// Returns the number of persisted log rows.
    async fn log_count(&self) -> Result<usize>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn begin_outcome_is_started() {
        assert!(BeginOutcome::Started.is_started());
        assert!(!BeginOutcome::NotFound.is_started());
        assert!(!BeginOutcome::AtCapacity {
            running: 3,
            limit: 3
        }
        .is_started());
        assert!(!BeginOutcome::NotPending {
            actual: ActionStatus::Running
        }
        .is_started());
    }
}
