//! Outbox events, typed payloads, and the bus topic registry.
//!
//! Every state change that must reach the bus is written as an
//! [`OutboxEvent`] in the same atomic store operation as the state change
//! itself (the transactional outbox). The dispatcher later publishes the
//! event as a [`WireEvent`] envelope.
//!
//! ## Topic registry
//!
//! Producers and consumers share the [`Topic`] enum instead of string
//! literals, so a routing key can only be spelled one way. The remediation
//! topic is `actions.requested` on both sides.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use triage_core::{ActionId, EventId, IncidentId, LogId};

use crate::action::ActionType;
use crate::incident::{Incident, IncidentDetails, IncidentSeverity, ResolutionMethod};

/// Outbox event status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutboxStatus {
    /// Waiting to be claimed.
    Pending,
    /// Claimed by a dispatcher instance.
    Processing,
    /// Published. Purged after the retention window.
    Completed,
    /// Retry budget exhausted. Terminal (dead letter).
    Failed,
}

impl OutboxStatus {
    /// Returns a lowercase label suitable for metrics and logs.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for OutboxStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Bus topics, the single source of routing keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    /// A batch of job-style logs was ingested.
    JenkinsLogsCreated,
    /// A batch of request-style logs was ingested.
    ApiLogsCreated,
    /// A critical/high incident was detected.
    IncidentDetected,
    /// An incident was resolved.
    IncidentResolved,
    /// A remediation action was requested.
    ActionRequested,
}

impl Topic {
    /// Returns the routing key published to the bus.
    #[must_use]
    pub const fn routing_key(self) -> &'static str {
        match self {
            Self::JenkinsLogsCreated => "logs.jenkins.created",
            Self::ApiLogsCreated => "logs.api.created",
            Self::IncidentDetected => "incident.detected",
            Self::IncidentResolved => "incident.resolved",
            Self::ActionRequested => "actions.requested",
        }
    }

    /// Resolves a routing key back to a topic.
    #[must_use]
    pub fn from_routing_key(key: &str) -> Option<Self> {
        match key {
            "logs.jenkins.created" => Some(Self::JenkinsLogsCreated),
            "logs.api.created" => Some(Self::ApiLogsCreated),
            "incident.detected" => Some(Self::IncidentDetected),
            "incident.resolved" => Some(Self::IncidentResolved),
            "actions.requested" => Some(Self::ActionRequested),
            _ => None,
        }
    }
}

impl std::fmt::Display for Topic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.routing_key())
    }
}

/// Typed event payloads, tagged by event type on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum EventPayload {
    /// A batch of job-style logs was persisted.
    JenkinsLogCreated {
        /// Ids of the inserted rows, in insertion order.
        log_ids: Vec<LogId>,
        /// Number of rows.
        count: usize,
        /// Distinct levels seen in the batch.
        levels: Vec<String>,
        /// Timestamp of the first entry.
        first_timestamp: DateTime<Utc>,
        /// Timestamp of the last entry.
        last_timestamp: DateTime<Utc>,
        /// How many incidents the batch produced.
        incidents_detected: usize,
    },
    /// A batch of request-style logs was persisted.
    ApiLogCreated {
        /// Ids of the inserted rows, in insertion order.
        log_ids: Vec<LogId>,
        /// Number of rows.
        count: usize,
        /// Distinct HTTP methods seen in the batch.
        methods: Vec<String>,
        /// Distinct HTTP statuses seen in the batch.
        statuses: Vec<u16>,
        /// Timestamp of the first entry.
        first_timestamp: DateTime<Utc>,
        /// Timestamp of the last entry.
        last_timestamp: DateTime<Utc>,
        /// How many incidents the batch produced.
        incidents_detected: usize,
    },
    /// A critical/high incident needs an immediate notification.
    IncidentDetected {
        /// The incident.
        incident_id: IncidentId,
        /// Detection rule name.
        incident_type: String,
        /// Severity assigned by the rule.
        severity: IncidentSeverity,
        /// The log row that triggered detection.
        source_log_id: LogId,
        /// Kind-specific context.
        details: IncidentDetails,
        /// Runbook link, if any.
        #[serde(skip_serializing_if = "Option::is_none")]
        runbook_url: Option<String>,
        /// When the incident was detected.
        detected_at: DateTime<Utc>,
    },
    /// An incident was resolved (feedback loop for the notifier).
    IncidentResolved {
        /// The incident.
        incident_id: IncidentId,
        /// Job the incident belonged to, when known.
        #[serde(skip_serializing_if = "Option::is_none")]
        job_name: Option<String>,
        /// Build the incident belonged to, when known.
        #[serde(skip_serializing_if = "Option::is_none")]
        build_number: Option<u32>,
        /// When the incident was detected.
        detected_at: DateTime<Utc>,
        /// When the incident was resolved.
        resolved_at: DateTime<Utc>,
        /// Minutes from detection to resolution.
        mttr_minutes: f64,
        /// How the incident was resolved.
        resolution_method: ResolutionMethod,
        /// Who (or what) resolved it.
        #[serde(skip_serializing_if = "Option::is_none")]
        resolved_by: Option<String>,
    },
    /// A remediation action was requested.
    ActionRequested {
        /// The action.
        action_id: ActionId,
        /// The remediation verb.
        action_type: ActionType,
        /// Target job.
        target_job: String,
        /// Target build, when the verb needs one.
        #[serde(skip_serializing_if = "Option::is_none")]
        target_build: Option<u32>,
        /// Incident the action remediates, if any.
        #[serde(skip_serializing_if = "Option::is_none")]
        incident_id: Option<IncidentId>,
        /// Why the action was requested.
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
}

impl EventPayload {
    /// Returns the snake_case event name (the wire tag).
    #[must_use]
    pub const fn event_name(&self) -> &'static str {
        match self {
            Self::JenkinsLogCreated { .. } => "jenkins_log_created",
            Self::ApiLogCreated { .. } => "api_log_created",
            Self::IncidentDetected { .. } => "incident_detected",
            Self::IncidentResolved { .. } => "incident_resolved",
            Self::ActionRequested { .. } => "action_requested",
        }
    }

    /// Returns the topic this payload is published under.
    #[must_use]
    pub const fn topic(&self) -> Topic {
        match self {
            Self::JenkinsLogCreated { .. } => Topic::JenkinsLogsCreated,
            Self::ApiLogCreated { .. } => Topic::ApiLogsCreated,
            Self::IncidentDetected { .. } => Topic::IncidentDetected,
            Self::IncidentResolved { .. } => Topic::IncidentResolved,
            Self::ActionRequested { .. } => Topic::ActionRequested,
        }
    }

    /// Builds the immediate-notification payload for a detected incident.
    #[must_use]
    pub fn incident_detected(incident: &Incident) -> Self {
        Self::IncidentDetected {
            incident_id: incident.id,
            incident_type: incident.incident_type.clone(),
            severity: incident.severity,
            source_log_id: incident.source_log_id,
            details: incident.details.clone(),
            runbook_url: incident.runbook_url.clone(),
            detected_at: incident.detected_at,
        }
    }
}

/// A durable outbox row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxEvent {
    /// Unique identifier; also the creation-order sort key.
    pub id: EventId,
    /// Aggregate the event belongs to (e.g. `incident_<id>`). Downstream
    /// consumers deduplicate at-least-once delivery on this plus the id.
    pub aggregate_id: String,
    /// Typed payload.
    pub payload: EventPayload,
    /// Delivery status.
    pub status: OutboxStatus,
    /// Publish attempts so far. Never exceeds `max_retries`.
    pub retry_count: u32,
    /// Retry budget.
    pub max_retries: u32,
    /// Last publish error, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    /// When the event was enqueued.
    pub created_at: DateTime<Utc>,
    /// When the event was last claimed or finished.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub processed_at: Option<DateTime<Utc>>,
    /// When the event becomes claimable again after a failed publish.
    /// `None` on terminally failed events.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_retry_at: Option<DateTime<Utc>>,
}

impl OutboxEvent {
    /// Creates a pending event.
    #[must_use]
    pub fn new(
        aggregate_id: impl Into<String>,
        payload: EventPayload,
        max_retries: u32,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: EventId::generate(),
            aggregate_id: aggregate_id.into(),
            payload,
            status: OutboxStatus::Pending,
            retry_count: 0,
            max_retries,
            error_message: None,
            created_at: now,
            processed_at: None,
            next_retry_at: None,
        }
    }

    /// Returns the topic the event publishes under.
    #[must_use]
    pub const fn topic(&self) -> Topic {
        self.payload.topic()
    }

    /// Returns true if a dispatcher may claim this event at `now`.
    ///
    /// Terminally failed events carry no `next_retry_at` and are never
    /// claimable again.
    #[must_use]
    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        match self.status {
            OutboxStatus::Pending => self.next_retry_at.is_none_or(|at| at <= now),
            OutboxStatus::Failed => self.next_retry_at.is_some_and(|at| at <= now),
            OutboxStatus::Processing | OutboxStatus::Completed => false,
        }
    }
}

/// The envelope published to the bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireEvent {
    /// Outbox event id.
    pub event_id: EventId,
    /// Event name (same tag as inside the payload).
    pub event_type: String,
    /// Aggregate the event belongs to.
    pub aggregate_id: String,
    /// When the event was enqueued.
    pub timestamp: DateTime<Utc>,
    /// Typed payload.
    pub payload: EventPayload,
}

impl WireEvent {
    /// Builds the wire envelope for an outbox row.
    #[must_use]
    pub fn from_outbox(event: &OutboxEvent) -> Self {
        Self {
            event_id: event.id,
            event_type: event.payload.event_name().to_string(),
            aggregate_id: event.aggregate_id.clone(),
            timestamp: event.created_at,
            payload: event.payload.clone(),
        }
    }

    /// Returns the routing key for this envelope.
    #[must_use]
    pub const fn routing_key(&self) -> &'static str {
        self.payload.topic().routing_key()
    }
}
