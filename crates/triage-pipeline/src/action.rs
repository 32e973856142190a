//! Remediation action requests and their state machine.
//!
//! ```text
//!             ┌──────────► REJECTED   (guard denial, terminal)
//!             │
//! PENDING ────┼──────────► RUNNING ──► COMPLETED
//!             │                  │
//!             └─(stays pending   └───► FAILED
//!               at capacity)
//! ```
//!
//! Terminal states are immutable; a request that cannot currently proceed
//! stays `pending` and is retried on the next poll, never abandoned.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use triage_core::{ActionId, IncidentId};

/// The remediation verb.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    /// Trigger a fresh build of the job.
    Restart,
    /// Redeploy a previous successful build.
    Rollback,
    /// Abort an in-flight build.
    Stop,
}

impl ActionType {
    /// Returns a lowercase label suitable for payloads and logs.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Restart => "restart",
            Self::Rollback => "rollback",
            Self::Stop => "stop",
        }
    }
}

impl std::fmt::Display for ActionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Action lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionStatus {
    /// Waiting for the executor.
    Pending,
    /// Executing against the control plane.
    Running,
    /// Finished successfully. Terminal.
    Completed,
    /// Finished unsuccessfully. Terminal.
    Failed,
    /// Denied by the guard, never ran. Terminal.
    Rejected,
}

impl ActionStatus {
    /// Returns a lowercase label suitable for metrics and logs.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Rejected => "rejected",
        }
    }

    /// Returns true if this is a terminal state.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Rejected)
    }

    /// Returns true if the transition from self to target is valid.
    #[must_use]
    pub const fn can_transition_to(self, target: Self) -> bool {
        match self {
            Self::Pending => matches!(target, Self::Running | Self::Rejected),
            Self::Running => matches!(target, Self::Completed | Self::Failed),
            Self::Completed | Self::Failed | Self::Rejected => false,
        }
    }
}

impl std::fmt::Display for ActionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Risk tier attached to a validated action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionRisk {
    /// May run automatically.
    Safe,
    /// Runs with extra validation.
    Moderate,
    /// Should involve a human.
    Dangerous,
    /// Never allowed.
    Forbidden,
}

impl ActionRisk {
    /// Returns a lowercase label suitable for payloads and logs.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Safe => "safe",
            Self::Moderate => "moderate",
            Self::Dangerous => "dangerous",
            Self::Forbidden => "forbidden",
        }
    }
}

/// Typed request parameters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ActionParams {
    /// Why the action was requested.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// When the rollback target build ran. The guard's recency rule only
    /// applies when this is present.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_build_at: Option<DateTime<Utc>>,
}

/// Structured result stored on a terminal action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionOutcome {
    /// True when the action was simulated and no remote call was made.
    pub dry_run: bool,
    /// The verb that ran.
    pub action: ActionType,
    /// Target job.
    pub job_name: String,
    /// Build the action operated on.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub build_number: Option<u32>,
    /// New build started by the action, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub new_build_number: Option<u32>,
    /// Human-readable result message.
    pub message: String,
    /// Backend-specific extras.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

/// Structured reply from the remote control plane.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionResult {
    /// Whether the remote call achieved its effect.
    pub success: bool,
    /// The verb that ran.
    pub action: ActionType,
    /// Target job.
    pub job_name: String,
    /// Build the action operated on.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub build_number: Option<u32>,
    /// New build started by the action, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub new_build_number: Option<u32>,
    /// Human-readable result message.
    pub message: String,
    /// When the control plane replied.
    pub timestamp: DateTime<Utc>,
    /// Backend-specific extras.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl ActionResult {
    /// Builds the outcome record persisted on a completed action.
    #[must_use]
    pub fn into_outcome(self) -> ActionOutcome {
        ActionOutcome {
            dry_run: false,
            action: self.action,
            job_name: self.job_name,
            build_number: self.build_number,
            new_build_number: self.new_build_number,
            message: self.message,
            details: self.details,
        }
    }
}

/// Input for creating a remediation request.
#[derive(Debug, Clone)]
pub struct NewAction {
    /// The remediation verb.
    pub action_type: ActionType,
    /// Target job.
    pub target_job: String,
    /// Target build, when the verb needs one.
    pub target_build: Option<u32>,
    /// Incident this action remediates, if any.
    pub incident_id: Option<IncidentId>,
    /// Requesting principal (chat user, automation).
    pub requested_by: String,
    /// Typed parameters.
    pub params: ActionParams,
}

impl NewAction {
    /// Creates a request input with empty params.
    #[must_use]
    pub fn new(
        action_type: ActionType,
        target_job: impl Into<String>,
        requested_by: impl Into<String>,
    ) -> Self {
        Self {
            action_type,
            target_job: target_job.into(),
            target_build: None,
            incident_id: None,
            requested_by: requested_by.into(),
            params: ActionParams::default(),
        }
    }

    /// Sets the target build.
    #[must_use]
    pub const fn with_target_build(mut self, build: u32) -> Self {
        self.target_build = Some(build);
        self
    }

    /// Links the action to an incident.
    #[must_use]
    pub const fn with_incident(mut self, incident_id: IncidentId) -> Self {
        self.incident_id = Some(incident_id);
        self
    }

    /// Sets the request reason.
    #[must_use]
    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.params.reason = Some(reason.into());
        self
    }

    /// Materializes the pending action record.
    #[must_use]
    pub fn into_request(self, now: DateTime<Utc>) -> ActionRequest {
        ActionRequest {
            id: ActionId::generate(),
            action_type: self.action_type,
            target_job: self.target_job,
            target_build: self.target_build,
            incident_id: self.incident_id,
            requested_by: self.requested_by,
            status: ActionStatus::Pending,
            params: self.params,
            result: None,
            error_message: None,
            created_at: now,
            started_at: None,
            completed_at: None,
            duration_seconds: None,
        }
    }
}

/// A remediation action request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionRequest {
    /// Unique identifier.
    pub id: ActionId,
    /// The remediation verb.
    pub action_type: ActionType,
    /// Target job.
    pub target_job: String,
    /// Target build, when the verb needs one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_build: Option<u32>,
    /// Incident this action remediates, if any. Weak back-reference:
    /// lookup only, no cascading ownership.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub incident_id: Option<IncidentId>,
    /// Requesting principal.
    pub requested_by: String,
    /// Lifecycle status.
    pub status: ActionStatus,
    /// Typed parameters.
    #[serde(default)]
    pub params: ActionParams,
    /// Structured result, set on completion.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<ActionOutcome>,
    /// Failure or rejection message, set on `failed`/`rejected`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    /// When the request was created.
    pub created_at: DateTime<Utc>,
    /// When execution began.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    /// When the request reached a terminal state.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// `completed_at - started_at`, for completed/failed runs.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_seconds: Option<f64>,
}

impl ActionRequest {
    /// Returns true if the request reached a terminal state.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub(crate) fn begin(&mut self, now: DateTime<Utc>) {
        self.status = ActionStatus::Running;
        self.started_at = Some(now);
    }

    pub(crate) fn complete(&mut self, outcome: ActionOutcome, now: DateTime<Utc>) {
        self.status = ActionStatus::Completed;
        self.result = Some(outcome);
        self.completed_at = Some(now);
        self.duration_seconds = self.elapsed_seconds(now);
    }

    pub(crate) fn fail(&mut self, error: impl Into<String>, now: DateTime<Utc>) {
        self.status = ActionStatus::Failed;
        self.error_message = Some(error.into());
        self.completed_at = Some(now);
        self.duration_seconds = self.elapsed_seconds(now);
    }

    pub(crate) fn reject(&mut self, reason: impl Into<String>, now: DateTime<Utc>) {
        self.status = ActionStatus::Rejected;
        self.error_message = Some(reason.into());
        self.completed_at = Some(now);
    }

    fn elapsed_seconds(&self, now: DateTime<Utc>) -> Option<f64> {
        self.started_at
            .map(|started| now.signed_duration_since(started).num_milliseconds() as f64 / 1000.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pending_transitions() {
        assert!(ActionStatus::Pending.can_transition_to(ActionStatus::Running));
        assert!(ActionStatus::Pending.can_transition_to(ActionStatus::Rejected));
        assert!(!ActionStatus::Pending.can_transition_to(ActionStatus::Completed));
    }

    #[test]
    fn rejection_bypasses_running() {
        assert!(!ActionStatus::Rejected.can_transition_to(ActionStatus::Running));
        assert!(ActionStatus::Rejected.is_terminal());
    }

    #[test]
    fn terminal_states_are_immutable() {
        for status in [
            ActionStatus::Completed,
            ActionStatus::Failed,
            ActionStatus::Rejected,
        ] {
            assert!(!status.can_transition_to(ActionStatus::Pending));
            assert!(!status.can_transition_to(ActionStatus::Running));
        }
    }

    #[test]
    fn duration_is_measured_from_start() {
        let mut action =
            NewAction::new(ActionType::Restart, "dev-sample", "ops").into_request(Utc::now());
        let started = Utc::now();
        action.begin(started);
        action.fail("control plane is unreachable", started + chrono::Duration::seconds(3));
        assert_eq!(action.status, ActionStatus::Failed);
        let duration = action.duration_seconds.unwrap();
        assert!((duration - 3.0).abs() < 0.01);
    }

    #[test]
    fn request_roundtrips_through_json() {
        let action = NewAction::new(ActionType::Rollback, "payments-deploy", "ops@example.com")
            .with_target_build(41)
            .with_reason("rollback after 5xx spike")
            .into_request(Utc::now());
        let json = serde_json::to_string(&action).unwrap();
        let parsed: ActionRequest = serde_json::from_str(&json).unwrap();
        assert_eq!(action, parsed);
    }
}
