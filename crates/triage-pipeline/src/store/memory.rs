//! In-memory store implementation for testing.
//!
//! This module provides [`InMemoryStore`], a thread-safe in-memory
//! implementation of the pipeline store traits suitable for tests and
//! development.
//!
//! Every operation takes the single interior lock once, so each store
//! primitive is atomic exactly the way a relational transaction would be:
//! a claim pass cannot interleave with another claim pass, and the
//! cross-aggregate primitives commit all their writes together.
//!
//! ## Limitations
//!
//! - **NOT suitable for production**: No durability, no cross-process
//!   coordination
//! - **Single-process only**: State is not shared across process boundaries

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use triage_core::{ActionId, EventId, IncidentId, LogId};

use super::{
    ActionStats, ActionStore, BeginOutcome, IncidentStats, IncidentStore, OutboxStats,
    OutboxStore, Store,
};
use crate::action::{ActionOutcome, ActionRequest, ActionStatus, ActionType};
use crate::error::{Error, Result};
use crate::event::{OutboxEvent, OutboxStatus};
use crate::incident::{Incident, IncidentSeverity, IncidentStatus, ResolutionMethod};
use crate::log::LogEntry;

#[derive(Debug, Default)]
struct Inner {
    logs: Vec<(LogId, LogEntry)>,
    incidents: HashMap<IncidentId, Incident>,
    // Insertion order is creation order (the relational analogue is the
    // serial primary key the dispatcher sorts on).
    events: Vec<OutboxEvent>,
    actions: HashMap<ActionId, ActionRequest>,
}

impl Inner {
    fn event_mut(&mut self, event_id: EventId) -> Option<&mut OutboxEvent> {
        self.events.iter_mut().find(|event| event.id == event_id)
    }

    fn event(&self, event_id: EventId) -> Option<&OutboxEvent> {
        self.events.iter().find(|event| event.id == event_id)
    }
}

/// Converts a lock poison error to a storage error.
fn poison_err<T>(_: PoisonError<T>) -> Error {
    Error::storage("store lock poisoned")
}

/// In-memory pipeline store for tests.
///
/// ## Example
///
/// ```rust
/// use triage_pipeline::store::memory::InMemoryStore;
///
/// let store = InMemoryStore::new();
/// // Use store in tests...
/// ```
#[derive(Debug, Default)]
pub struct InMemoryStore {
    inner: Mutex<Inner>,
}

impl InMemoryStore {
    /// Creates a new empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>> {
        self.inner.lock().map_err(poison_err)
    }

    /// Returns all events, in creation order. Test helper.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn events(&self) -> Result<Vec<OutboxEvent>> {
        let inner = self.lock()?;
        Ok(inner.events.clone())
    }

    /// Returns all incidents. Test helper.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn incidents(&self) -> Result<Vec<Incident>> {
        let inner = self.lock()?;
        Ok(inner.incidents.values().cloned().collect())
    }
}

#[async_trait]
impl OutboxStore for InMemoryStore {
    async fn claim_batch(
        &self,
        batch_size: usize,
        lock_timeout: chrono::Duration,
        now: DateTime<Utc>,
    ) -> Result<Vec<OutboxEvent>> {
        let mut inner = self.lock()?;

        let due: Vec<EventId> = inner
            .events
            .iter()
            .filter(|event| {
                event.is_claimable(now)
                    || (event.status == OutboxStatus::Processing
                        && event
                            .processed_at
                            .is_some_and(|claimed| now.signed_duration_since(claimed) > lock_timeout))
            })
            .map(|event| event.id)
            .take(batch_size)
            .collect();

        let mut claimed = Vec::with_capacity(due.len());
        for event_id in due {
            if let Some(event) = inner.event_mut(event_id) {
                event.status = OutboxStatus::Processing;
                event.processed_at = Some(now);
                claimed.push(event.clone());
            }
        }
        Ok(claimed)
    }

    async fn mark_completed(&self, event_id: EventId, now: DateTime<Utc>) -> Result<()> {
        let mut inner = self.lock()?;
        let event = inner
            .event_mut(event_id)
            .ok_or(Error::EventNotFound { event_id })?;
        event.status = OutboxStatus::Completed;
        event.processed_at = Some(now);
        event.next_retry_at = None;
        Ok(())
    }

    async fn mark_failed(
        &self,
        event_id: EventId,
        error: &str,
        backoff_base: chrono::Duration,
        now: DateTime<Utc>,
    ) -> Result<OutboxStatus> {
        let mut inner = self.lock()?;
        let event = inner
            .event_mut(event_id)
            .ok_or(Error::EventNotFound { event_id })?;

        event.retry_count += 1;
        event.error_message = Some(error.to_string());
        event.processed_at = Some(now);

        if event.retry_count >= event.max_retries {
            event.status = OutboxStatus::Failed;
            event.next_retry_at = None;
        } else {
            event.status = OutboxStatus::Pending;
            let backoff = backoff_base * 2_i32.pow(event.retry_count);
            event.next_retry_at = Some(now + backoff);
        }
        Ok(event.status)
    }

    async fn purge_completed(
        &self,
        retention: chrono::Duration,
        now: DateTime<Utc>,
    ) -> Result<usize> {
        let mut inner = self.lock()?;
        let cutoff = now - retention;
        let before = inner.events.len();
        inner.events.retain(|event| {
            event.status != OutboxStatus::Completed
                || event.processed_at.is_none_or(|done| done >= cutoff)
        });
        Ok(before - inner.events.len())
    }

    async fn get_event(&self, event_id: EventId) -> Result<Option<OutboxEvent>> {
        let inner = self.lock()?;
        Ok(inner.event(event_id).cloned())
    }

    async fn outbox_stats(
        &self,
        window: chrono::Duration,
        now: DateTime<Utc>,
    ) -> Result<OutboxStats> {
        let inner = self.lock()?;
        let cutoff = now - window;
        let mut stats = OutboxStats::default();
        for event in inner.events.iter().filter(|e| e.created_at > cutoff) {
            stats.total += 1;
            match event.status {
                OutboxStatus::Pending => stats.pending += 1,
                OutboxStatus::Processing => stats.processing += 1,
                OutboxStatus::Completed => stats.completed += 1,
                OutboxStatus::Failed => stats.failed += 1,
            }
        }
        Ok(stats)
    }
}

#[async_trait]
impl IncidentStore for InMemoryStore {
    async fn get_incident(&self, incident_id: IncidentId) -> Result<Option<Incident>> {
        let inner = self.lock()?;
        Ok(inner.incidents.get(&incident_id).cloned())
    }

    async fn mark_notified(&self, incident_ids: &[IncidentId], now: DateTime<Utc>) -> Result<()> {
        let mut inner = self.lock()?;
        for incident_id in incident_ids {
            if let Some(incident) = inner.incidents.get_mut(incident_id) {
                // Duplicate delivery is expected; only the first notification
                // advances the status.
                if incident.status == IncidentStatus::Detected {
                    incident.mark_notified(now)?;
                }
            }
        }
        Ok(())
    }

    async fn update_incident_status(
        &self,
        incident_id: IncidentId,
        status: IncidentStatus,
        actor: Option<&str>,
        notes: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let mut inner = self.lock()?;
        let incident = inner
            .incidents
            .get_mut(&incident_id)
            .ok_or(Error::IncidentNotFound { incident_id })?;

        incident.transition_to(status)?;
        match status {
            IncidentStatus::Notified => incident.notified_at = Some(now),
            IncidentStatus::Acknowledged => {
                incident.acknowledged_at = Some(now);
                incident.acknowledged_by = actor.map(ToString::to_string);
            }
            IncidentStatus::Resolved => {
                incident.resolved_at = Some(now);
                incident.resolved_by = actor.map(ToString::to_string);
                incident.resolution_notes = notes.map(ToString::to_string);
            }
            IncidentStatus::Detected | IncidentStatus::Investigating => {}
        }
        Ok(())
    }

    async fn active_incidents(&self, limit: usize) -> Result<Vec<Incident>> {
        let inner = self.lock()?;
        let mut active: Vec<Incident> = inner
            .incidents
            .values()
            .filter(|incident| incident.is_active())
            .cloned()
            .collect();
        active.sort_by(|a, b| b.detected_at.cmp(&a.detected_at));
        active.truncate(limit);
        Ok(active)
    }

    async fn incidents_by_severity(
        &self,
        severity: IncidentSeverity,
        limit: usize,
    ) -> Result<Vec<Incident>> {
        let inner = self.lock()?;
        let mut matching: Vec<Incident> = inner
            .incidents
            .values()
            .filter(|incident| incident.severity == severity)
            .cloned()
            .collect();
        matching.sort_by(|a, b| b.detected_at.cmp(&a.detected_at));
        matching.truncate(limit);
        Ok(matching)
    }

    async fn incident_stats(
        &self,
        window: chrono::Duration,
        now: DateTime<Utc>,
    ) -> Result<IncidentStats> {
        let inner = self.lock()?;
        let cutoff = now - window;
        let mut stats = IncidentStats::default();
        let mut mttr_sum = 0.0;
        let mut mttr_count = 0_usize;

        for incident in inner.incidents.values().filter(|i| i.detected_at > cutoff) {
            stats.total += 1;
            match incident.severity {
                IncidentSeverity::Critical => stats.critical += 1,
                IncidentSeverity::High => stats.high += 1,
                IncidentSeverity::Medium => stats.medium += 1,
                IncidentSeverity::Low => stats.low += 1,
            }
            match incident.status {
                IncidentStatus::Detected => stats.detected += 1,
                IncidentStatus::Notified => stats.notified += 1,
                IncidentStatus::Acknowledged => stats.acknowledged += 1,
                IncidentStatus::Investigating => stats.investigating += 1,
                IncidentStatus::Resolved => stats.resolved += 1,
            }
            if let Some(mttr) = incident.mttr_minutes() {
                mttr_sum += mttr;
                mttr_count += 1;
            }
        }

        if mttr_count > 0 {
            stats.mttr_minutes = Some(mttr_sum / mttr_count as f64);
        }
        Ok(stats)
    }
}

#[async_trait]
impl ActionStore for InMemoryStore {
    async fn get_action(&self, action_id: ActionId) -> Result<Option<ActionRequest>> {
        let inner = self.lock()?;
        Ok(inner.actions.get(&action_id).cloned())
    }

    async fn pending_actions(&self, limit: usize) -> Result<Vec<ActionRequest>> {
        let inner = self.lock()?;
        let mut pending: Vec<ActionRequest> = inner
            .actions
            .values()
            .filter(|action| action.status == ActionStatus::Pending)
            .cloned()
            .collect();
        pending.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        pending.truncate(limit);
        Ok(pending)
    }

    async fn try_begin_action(
        &self,
        action_id: ActionId,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<BeginOutcome> {
        let mut inner = self.lock()?;

        let running = inner
            .actions
            .values()
            .filter(|action| action.status == ActionStatus::Running)
            .count();
        if running >= limit {
            return Ok(BeginOutcome::AtCapacity { running, limit });
        }

        let Some(action) = inner.actions.get_mut(&action_id) else {
            return Ok(BeginOutcome::NotFound);
        };
        if action.status != ActionStatus::Pending {
            return Ok(BeginOutcome::NotPending {
                actual: action.status,
            });
        }

        action.begin(now);
        Ok(BeginOutcome::Started)
    }

    async fn complete_action(
        &self,
        action_id: ActionId,
        outcome: ActionOutcome,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let mut inner = self.lock()?;
        let action = inner
            .actions
            .get_mut(&action_id)
            .ok_or(Error::ActionNotFound { action_id })?;
        if !action.status.can_transition_to(ActionStatus::Completed) {
            return Err(invalid_action_transition(action.status, ActionStatus::Completed));
        }
        action.complete(outcome, now);
        Ok(())
    }

    async fn fail_action(
        &self,
        action_id: ActionId,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let mut inner = self.lock()?;
        let action = inner
            .actions
            .get_mut(&action_id)
            .ok_or(Error::ActionNotFound { action_id })?;
        if !action.status.can_transition_to(ActionStatus::Failed) {
            return Err(invalid_action_transition(action.status, ActionStatus::Failed));
        }
        action.fail(error, now);
        Ok(())
    }

    async fn reject_action(
        &self,
        action_id: ActionId,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let mut inner = self.lock()?;
        let action = inner
            .actions
            .get_mut(&action_id)
            .ok_or(Error::ActionNotFound { action_id })?;
        if !action.status.can_transition_to(ActionStatus::Rejected) {
            return Err(invalid_action_transition(action.status, ActionStatus::Rejected));
        }
        action.reject(reason, now);
        Ok(())
    }

    async fn running_count(&self) -> Result<usize> {
        let inner = self.lock()?;
        Ok(inner
            .actions
            .values()
            .filter(|action| action.status == ActionStatus::Running)
            .count())
    }

    async fn actions_by_job(&self, job: &str, limit: usize) -> Result<Vec<ActionRequest>> {
        let inner = self.lock()?;
        let mut matching: Vec<ActionRequest> = inner
            .actions
            .values()
            .filter(|action| action.target_job == job)
            .cloned()
            .collect();
        matching.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        matching.truncate(limit);
        Ok(matching)
    }

    async fn actions_by_incident(&self, incident_id: IncidentId) -> Result<Vec<ActionRequest>> {
        let inner = self.lock()?;
        let mut matching: Vec<ActionRequest> = inner
            .actions
            .values()
            .filter(|action| action.incident_id == Some(incident_id))
            .cloned()
            .collect();
        matching.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(matching)
    }

    async fn action_stats(
        &self,
        window: chrono::Duration,
        now: DateTime<Utc>,
    ) -> Result<ActionStats> {
        let inner = self.lock()?;
        let cutoff = now - window;
        let mut stats = ActionStats::default();
        let mut duration_sum = 0.0;
        let mut duration_count = 0_usize;

        for action in inner.actions.values().filter(|a| a.created_at > cutoff) {
            stats.total += 1;
            match action.status {
                ActionStatus::Pending => stats.pending += 1,
                ActionStatus::Running => stats.running += 1,
                ActionStatus::Completed => stats.completed += 1,
                ActionStatus::Failed => stats.failed += 1,
                ActionStatus::Rejected => stats.rejected += 1,
            }
            match action.action_type {
                ActionType::Restart => stats.restarts += 1,
                ActionType::Rollback => stats.rollbacks += 1,
                ActionType::Stop => stats.stops += 1,
            }
            if action.status == ActionStatus::Completed {
                if let Some(duration) = action.duration_seconds {
                    duration_sum += duration;
                    duration_count += 1;
                }
            }
        }

        if stats.total > 0 {
            stats.success_rate = stats.completed as f64 / stats.total as f64 * 100.0;
        }
        if duration_count > 0 {
            stats.avg_duration_seconds = Some(duration_sum / duration_count as f64);
        }
        Ok(stats)
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn ingest(
        &self,
        logs: Vec<(LogId, LogEntry)>,
        incidents: Vec<Incident>,
        events: Vec<OutboxEvent>,
    ) -> Result<()> {
        let mut inner = self.lock()?;
        inner.logs.extend(logs);
        for incident in incidents {
            inner.incidents.insert(incident.id, incident);
        }
        inner.events.extend(events);
        Ok(())
    }

    async fn submit_action(&self, action: ActionRequest, event: OutboxEvent) -> Result<ActionId> {
        let mut inner = self.lock()?;
        let action_id = action.id;
        inner.actions.insert(action_id, action);
        inner.events.push(event);
        Ok(action_id)
    }

    async fn resolve_incident(
        &self,
        incident_id: IncidentId,
        method: ResolutionMethod,
        resolved_by: &str,
        notes: Option<&str>,
        event: OutboxEvent,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let mut inner = self.lock()?;
        let incident = inner
            .incidents
            .get_mut(&incident_id)
            .ok_or(Error::IncidentNotFound { incident_id })?;

        if incident.status.is_terminal() {
            return Ok(false);
        }

        incident.resolve(method, resolved_by, notes.map(ToString::to_string), now)?;
        inner.events.push(event);
        Ok(true)
    }

    async fn find_active_incident(
        &self,
        job: &str,
        build: Option<u32>,
    ) -> Result<Option<Incident>> {
        let inner = self.lock()?;
        Ok(inner
            .incidents
            .values()
            .filter(|incident| {
                incident.is_active()
                    && incident.details.job_name() == Some(job)
                    && (build.is_none() || incident.details.build_number() == build)
            })
            .max_by_key(|incident| incident.detected_at)
            .cloned())
    }

    async fn log_count(&self) -> Result<usize> {
        let inner = self.lock()?;
        Ok(inner.logs.len())
    }
}

fn invalid_action_transition(from: ActionStatus, to: ActionStatus) -> Error {
    Error::InvalidStateTransition {
        from: from.as_str().into(),
        to: to.as_str().into(),
        reason: "terminal action states are immutable".into(),
    }
}
