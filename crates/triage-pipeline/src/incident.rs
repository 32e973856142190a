//! Incident records and their lifecycle.
//!
//! Incidents are created by the detector inside the ingest transaction and
//! mutated by acknowledge/resolve operations. The status machine is strictly
//! monotone:
//!
//! ```text
//! DETECTED ──► NOTIFIED ──► ACKNOWLEDGED ──► INVESTIGATING ──► RESOLVED
//! ```
//!
//! Transitions may skip forward (an automated remediation can resolve a
//! detected incident directly) but never regress, and `RESOLVED` is terminal.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use triage_core::{IncidentId, LogId};

use crate::error::{Error, Result};
use crate::log::LogKind;

/// Incident severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IncidentSeverity {
    /// Page immediately.
    Critical,
    /// Notify immediately.
    High,
    /// Fold into the batch summary.
    Medium,
    /// Informational.
    Low,
}

impl IncidentSeverity {
    /// Returns a lowercase label suitable for metrics and logs.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Critical => "critical",
            Self::High => "high",
            Self::Medium => "medium",
            Self::Low => "low",
        }
    }

    /// Returns true if incidents of this severity get an immediate,
    /// individually-addressed notification event.
    #[must_use]
    pub const fn is_immediate(self) -> bool {
        matches!(self, Self::Critical | Self::High)
    }
}

impl std::fmt::Display for IncidentSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Incident lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IncidentStatus {
    /// Created by the detector, nothing sent yet.
    Detected,
    /// Notification delivered to the bus.
    Notified,
    /// A human (or automation) has taken ownership.
    Acknowledged,
    /// Actively being worked.
    Investigating,
    /// Closed. Terminal.
    Resolved,
}

impl IncidentStatus {
    /// Returns a lowercase label suitable for metrics and logs.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Detected => "detected",
            Self::Notified => "notified",
            Self::Acknowledged => "acknowledged",
            Self::Investigating => "investigating",
            Self::Resolved => "resolved",
        }
    }

    /// Returns true if this is the terminal state.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Resolved)
    }

    const fn rank(self) -> u8 {
        match self {
            Self::Detected => 0,
            Self::Notified => 1,
            Self::Acknowledged => 2,
            Self::Investigating => 3,
            Self::Resolved => 4,
        }
    }

    /// Returns true if the transition from self to target is valid.
    ///
    /// Transitions only move forward along the lifecycle; skipping
    /// intermediate states is allowed, regression never is.
    #[must_use]
    pub const fn can_transition_to(self, target: Self) -> bool {
        !self.is_terminal() && self.rank() < target.rank()
    }
}

impl std::fmt::Display for IncidentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How an incident was resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionMethod {
    /// Closed by a human.
    Manual,
    /// Closed by a successful restart action.
    Restart,
    /// Closed by a successful rollback action.
    Rollback,
}

impl ResolutionMethod {
    /// Returns a lowercase label suitable for payloads and logs.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Manual => "manual",
            Self::Restart => "restart",
            Self::Rollback => "rollback",
        }
    }
}

/// Kind-specific incident context captured from the matched log entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum IncidentDetails {
    /// Context from a job-style log entry.
    Jenkins {
        /// Log level of the matched entry.
        level: String,
        /// Message of the matched entry.
        message: String,
        /// Original event timestamp.
        timestamp: DateTime<Utc>,
        /// Source index name.
        index_name: String,
        /// Job the incident belongs to, when known.
        #[serde(skip_serializing_if = "Option::is_none")]
        job_name: Option<String>,
        /// Build number the incident belongs to, when known.
        #[serde(skip_serializing_if = "Option::is_none")]
        build_number: Option<u32>,
    },
    /// Context from a request-style log entry.
    Api {
        /// HTTP method of the matched request.
        http_method: String,
        /// HTTP status of the matched response.
        http_status: u16,
        /// Message of the matched entry.
        message: String,
        /// Original event timestamp.
        timestamp: DateTime<Utc>,
        /// Source index name.
        index_name: String,
    },
}

impl IncidentDetails {
    /// Returns the message of the matched log entry.
    #[must_use]
    pub fn message(&self) -> &str {
        match self {
            Self::Jenkins { message, .. } | Self::Api { message, .. } => message,
        }
    }

    /// Returns the job name, when the source log carried one.
    #[must_use]
    pub fn job_name(&self) -> Option<&str> {
        match self {
            Self::Jenkins { job_name, .. } => job_name.as_deref(),
            Self::Api { .. } => None,
        }
    }

    /// Returns the build number, when the source log carried one.
    #[must_use]
    pub const fn build_number(&self) -> Option<u32> {
        match self {
            Self::Jenkins { build_number, .. } => *build_number,
            Self::Api { .. } => None,
        }
    }
}

/// A detected incident.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Incident {
    /// Unique identifier.
    pub id: IncidentId,
    /// Name of the detection rule that fired (e.g. `jenkins_build_failure`).
    pub incident_type: String,
    /// Severity assigned by the rule.
    pub severity: IncidentSeverity,
    /// Lifecycle status.
    pub status: IncidentStatus,
    /// The log row that triggered detection.
    pub source_log_id: LogId,
    /// Kind of the source log.
    pub source_log_kind: LogKind,
    /// Kind-specific context.
    pub details: IncidentDetails,
    /// Runbook link from the rule, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub runbook_url: Option<String>,
    /// When the detector created the incident.
    pub detected_at: DateTime<Utc>,
    /// When the notification was delivered.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notified_at: Option<DateTime<Utc>>,
    /// When the incident was acknowledged.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub acknowledged_at: Option<DateTime<Utc>>,
    /// When the incident was resolved.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,
    /// Who acknowledged.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub acknowledged_by: Option<String>,
    /// Who (or what) resolved.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolved_by: Option<String>,
    /// Free-form resolution notes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolution_notes: Option<String>,
}

impl Incident {
    /// Creates a freshly detected incident.
    #[must_use]
    pub fn new(
        incident_type: impl Into<String>,
        severity: IncidentSeverity,
        source_log_id: LogId,
        source_log_kind: LogKind,
        details: IncidentDetails,
        runbook_url: Option<String>,
        detected_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: IncidentId::generate(),
            incident_type: incident_type.into(),
            severity,
            status: IncidentStatus::Detected,
            source_log_id,
            source_log_kind,
            details,
            runbook_url,
            detected_at,
            notified_at: None,
            acknowledged_at: None,
            resolved_at: None,
            acknowledged_by: None,
            resolved_by: None,
            resolution_notes: None,
        }
    }

    /// Returns true if the incident is not yet resolved.
    #[must_use]
    pub const fn is_active(&self) -> bool {
        !self.status.is_terminal()
    }

    /// Transitions to `target`, enforcing the monotone lifecycle.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidStateTransition`] if the transition would
    /// regress or leave the terminal state.
    pub fn transition_to(&mut self, target: IncidentStatus) -> Result<()> {
        if !self.status.can_transition_to(target) {
            return Err(Error::InvalidStateTransition {
                from: self.status.as_str().into(),
                to: target.as_str().into(),
                reason: "incident status only advances forward".into(),
            });
        }
        self.status = target;
        Ok(())
    }

    /// Marks the incident notified.
    ///
    /// # Errors
    ///
    /// Returns an error if the incident already advanced past `notified`.
    pub fn mark_notified(&mut self, now: DateTime<Utc>) -> Result<()> {
        self.transition_to(IncidentStatus::Notified)?;
        self.notified_at = Some(now);
        Ok(())
    }

    /// Acknowledges the incident on behalf of `user`.
    ///
    /// # Errors
    ///
    /// Returns an error if the incident already advanced past `acknowledged`.
    pub fn acknowledge(&mut self, user: impl Into<String>, now: DateTime<Utc>) -> Result<()> {
        self.transition_to(IncidentStatus::Acknowledged)?;
        self.acknowledged_at = Some(now);
        self.acknowledged_by = Some(user.into());
        Ok(())
    }

    /// Resolves the incident.
    ///
    /// # Errors
    ///
    /// Returns an error if the incident is already resolved.
    pub fn resolve(
        &mut self,
        method: ResolutionMethod,
        resolved_by: impl Into<String>,
        notes: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        self.transition_to(IncidentStatus::Resolved)?;
        self.resolved_at = Some(now);
        self.resolved_by = Some(resolved_by.into());
        self.resolution_notes =
            notes.or_else(|| Some(format!("resolved via {}", method.as_str())));
        Ok(())
    }

    /// Mean time to resolution in minutes, once resolved.
    #[must_use]
    pub fn mttr_minutes(&self) -> Option<f64> {
        let resolved_at = self.resolved_at?;
        let elapsed = resolved_at.signed_duration_since(self.detected_at);
        Some(elapsed.num_milliseconds() as f64 / 60_000.0)
    }
}
