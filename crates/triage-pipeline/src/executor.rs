//! The action executor: guard gate, slot reservation, remote dispatch.
//!
//! State machine per action:
//!
//! 1. `pending`: the guard validates; a denial rejects the action without
//!    ever touching the control plane.
//! 2. Allowed actions reserve a running slot atomically; at capacity they
//!    stay `pending` for the next poll (liveness, not failure).
//! 3. A reserved action health-checks the control plane, then either
//!    simulates (dry-run) or dispatches on its verb.
//! 4. The structured result lands on the action: `completed` or `failed`,
//!    both terminal.
//!
//! After a successful restart/rollback the executor resolves the linked
//! incident and enqueues the `incident.resolved` event in the same atomic
//! store operation, closing the feedback loop.
//!
//! Batches of pending actions run strictly sequentially so two actions
//! cannot race on the same job.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use metrics::counter;

use crate::action::{ActionOutcome, ActionRequest, ActionStatus, ActionType};
use crate::config::{ExecutorConfig, OutboxConfig};
use crate::control_plane::ControlPlane;
use crate::error::Result;
use crate::event::{EventPayload, OutboxEvent};
use crate::guard::ActionGuard;
use crate::incident::{Incident, ResolutionMethod};
use crate::metrics::{labels, names};
use crate::store::{BeginOutcome, Store};

/// The action executor worker.
pub struct ActionExecutor<S> {
    store: Arc<S>,
    guard: Arc<ActionGuard>,
    control_plane: Arc<dyn ControlPlane>,
    config: ExecutorConfig,
    outbox: OutboxConfig,
}

impl<S: Store> ActionExecutor<S> {
    /// Creates a new executor.
    #[must_use]
    pub fn new(
        store: Arc<S>,
        guard: Arc<ActionGuard>,
        control_plane: Arc<dyn ControlPlane>,
        config: ExecutorConfig,
        outbox: OutboxConfig,
    ) -> Self {
        Self {
            store,
            guard,
            control_plane,
            config,
            outbox,
        }
    }

    /// Drives one action through the state machine and returns its
    /// resulting status.
    ///
    /// Re-running a terminal action is a no-op that returns the stored
    /// status. An action deferred by the concurrency limit returns
    /// `Pending` and is picked up by the next poll.
    ///
    /// # Errors
    ///
    /// Returns an error on store failures; remote failures are persisted on
    /// the action instead.
    #[tracing::instrument(
        skip(self, action),
        fields(action_id = %action.id, action_type = %action.action_type, target_job = %action.target_job)
    )]
    pub async fn execute(&self, action: &ActionRequest) -> Result<ActionStatus> {
        if action.is_terminal() {
            tracing::debug!(status = %action.status, "action already terminal, skipping");
            return Ok(action.status);
        }
        if action.status == ActionStatus::Running {
            // Another worker holds it.
            return Ok(ActionStatus::Running);
        }

        let now = Utc::now();

        // 1. Guard gate. A denial is terminal and never reaches the remote.
        let verdict = self.guard.validate(action, now)?;
        if !verdict.allowed {
            let reason = verdict
                .reason
                .unwrap_or_else(|| "denied by policy".to_string());
            self.store.reject_action(action.id, &reason, now).await?;
            self.record_finished(action.action_type, "rejected");
            tracing::warn!(reason = %reason, "action rejected");
            return Ok(ActionStatus::Rejected);
        }

        // 2. Atomic slot reservation.
        match self
            .store
            .try_begin_action(action.id, self.config.max_concurrent_actions, now)
            .await?
        {
            BeginOutcome::Started => {}
            BeginOutcome::AtCapacity { running, limit } => {
                tracing::info!(running, limit, "concurrency limit reached, action stays pending");
                return Ok(ActionStatus::Pending);
            }
            BeginOutcome::NotFound => {
                return Err(crate::error::Error::ActionNotFound {
                    action_id: action.id,
                });
            }
            BeginOutcome::NotPending { actual } => {
                tracing::debug!(status = %actual, "action no longer pending, skipping");
                return Ok(actual);
            }
        }

        // 3. The remote must be reachable before any verb runs.
        if !self.control_plane.health_check().await {
            let message = "control plane is unreachable";
            self.store.fail_action(action.id, message, Utc::now()).await?;
            self.record_finished(action.action_type, "failed");
            tracing::error!(message, "action failed");
            return Ok(ActionStatus::Failed);
        }

        // 4. Dry-run simulates and completes without a remote call.
        if self.config.dry_run {
            tokio::time::sleep(self.config.dry_run_delay).await;
            let outcome = ActionOutcome {
                dry_run: true,
                action: action.action_type,
                job_name: action.target_job.clone(),
                build_number: action.target_build,
                new_build_number: None,
                message: "dry run: action simulated".to_string(),
                details: None,
            };
            self.store
                .complete_action(action.id, outcome, Utc::now())
                .await?;
            self.record_finished(action.action_type, "completed");
            tracing::info!("action completed (dry run)");
            return Ok(ActionStatus::Completed);
        }

        // 5. Dispatch on the verb.
        let result = match action.action_type {
            ActionType::Restart => {
                self.control_plane
                    .restart(&action.target_job, action.target_build)
                    .await
            }
            ActionType::Rollback => match action.target_build {
                Some(build) => self.control_plane.rollback(&action.target_job, build).await,
                None => {
                    let message = "rollback requires a target build";
                    self.store.fail_action(action.id, message, Utc::now()).await?;
                    self.record_finished(action.action_type, "failed");
                    return Ok(ActionStatus::Failed);
                }
            },
            ActionType::Stop => match action.target_build {
                Some(build) => self.control_plane.stop(&action.target_job, build).await,
                None => {
                    let message = "stop requires a target build";
                    self.store.fail_action(action.id, message, Utc::now()).await?;
                    self.record_finished(action.action_type, "failed");
                    return Ok(ActionStatus::Failed);
                }
            },
        };

        // 6. Persist the terminal result.
        let now = Utc::now();
        if result.success {
            let message = result.message.clone();
            self.store
                .complete_action(action.id, result.into_outcome(), now)
                .await?;
            self.record_finished(action.action_type, "completed");
            tracing::info!(message = %message, "action completed");

            self.resolve_linked_incident(action, now).await;
            Ok(ActionStatus::Completed)
        } else {
            self.store.fail_action(action.id, &result.message, now).await?;
            self.record_finished(action.action_type, "failed");
            tracing::error!(message = %result.message, "action failed");
            Ok(ActionStatus::Failed)
        }
    }

    /// Drains pending actions strictly sequentially. Returns how many
    /// reached a terminal state this pass.
    ///
    /// # Errors
    ///
    /// Returns an error on store failures.
    pub async fn process_pending(&self) -> Result<usize> {
        let pending = self
            .store
            .pending_actions(self.config.pending_poll_limit)
            .await?;
        if pending.is_empty() {
            return Ok(0);
        }

        tracing::info!(count = pending.len(), "processing pending actions");
        let mut finished = 0;
        for action in pending {
            // One at a time: two actions must not race on the same job.
            if self.execute(&action).await?.is_terminal() {
                finished += 1;
            }
        }
        Ok(finished)
    }

    /// Resolves the incident this successful action remediated, if any,
    /// enqueueing the resolution event atomically with the status change.
    ///
    /// Stop actions and resolution failures never fail the action itself;
    /// problems are logged and left for manual follow-up.
    async fn resolve_linked_incident(&self, action: &ActionRequest, now: DateTime<Utc>) {
        let method = match action.action_type {
            ActionType::Restart => ResolutionMethod::Restart,
            ActionType::Rollback => ResolutionMethod::Rollback,
            ActionType::Stop => return,
        };

        let incident = match self.find_incident(action).await {
            Ok(Some(incident)) => incident,
            Ok(None) => return,
            Err(error) => {
                tracing::error!(%error, "incident lookup failed after remediation");
                return;
            }
        };

        let event = OutboxEvent::new(
            format!("incident_{}", incident.id),
            EventPayload::IncidentResolved {
                incident_id: incident.id,
                job_name: incident.details.job_name().map(ToString::to_string),
                build_number: incident.details.build_number(),
                detected_at: incident.detected_at,
                resolved_at: now,
                mttr_minutes: now.signed_duration_since(incident.detected_at).num_milliseconds()
                    as f64
                    / 60_000.0,
                resolution_method: method,
                resolved_by: Some(action.requested_by.clone()),
            },
            self.outbox.max_retries,
            now,
        );

        match self
            .store
            .resolve_incident(
                incident.id,
                method,
                &action.requested_by,
                None,
                event,
                now,
            )
            .await
        {
            Ok(true) => {
                tracing::info!(incident_id = %incident.id, method = method.as_str(), "incident resolved by remediation");
            }
            Ok(false) => {
                tracing::debug!(incident_id = %incident.id, "incident was already resolved");
            }
            Err(error) => {
                tracing::error!(%error, incident_id = %incident.id, "failed to resolve incident");
            }
        }
    }

    async fn find_incident(&self, action: &ActionRequest) -> Result<Option<Incident>> {
        if let Some(incident_id) = action.incident_id {
            return self.store.get_incident(incident_id).await;
        }
        self.store
            .find_active_incident(&action.target_job, action.target_build)
            .await
    }

    fn record_finished(&self, action_type: ActionType, outcome: &'static str) {
        counter!(
            names::ACTIONS_FINISHED_TOTAL,
            labels::ACTION_TYPE => action_type.as_str(),
            labels::OUTCOME => outcome,
        )
        .increment(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::NewAction;
    use crate::config::GuardConfig;
    use crate::control_plane::StaticControlPlane;
    use crate::detector::IncidentDetector;
    use crate::event::Topic;
    use crate::ingest::IngestService;
    use crate::log::LogEntry;
    use crate::store::memory::InMemoryStore;
    use crate::store::{ActionStore, IncidentStore};

    struct Harness {
        store: Arc<InMemoryStore>,
        plane: Arc<StaticControlPlane>,
        executor: ActionExecutor<InMemoryStore>,
    }

    fn harness(guard: GuardConfig, executor: ExecutorConfig, plane: StaticControlPlane) -> Harness {
        let store = Arc::new(InMemoryStore::new());
        let plane = Arc::new(plane);
        let exec = ActionExecutor::new(
            Arc::clone(&store),
            Arc::new(ActionGuard::new(&guard)),
            Arc::clone(&plane) as _,
            executor,
            OutboxConfig::default(),
        );
        Harness {
            store,
            plane,
            executor: exec,
        }
    }

    async fn submit(store: &Arc<InMemoryStore>, new_action: NewAction) -> ActionRequest {
        let now = Utc::now();
        let action = new_action.into_request(now);
        let event = OutboxEvent::new(
            format!("action_{}", action.id),
            EventPayload::ActionRequested {
                action_id: action.id,
                action_type: action.action_type,
                target_job: action.target_job.clone(),
                target_build: action.target_build,
                incident_id: action.incident_id,
                reason: action.params.reason.clone(),
            },
            3,
            now,
        );
        store.submit_action(action.clone(), event).await.unwrap();
        action
    }

    fn dry_run_config() -> ExecutorConfig {
        ExecutorConfig {
            dry_run: true,
            dry_run_delay: std::time::Duration::from_millis(10),
            ..ExecutorConfig::default()
        }
    }

    #[tokio::test]
    async fn guard_denial_rejects_without_remote_calls() {
        let harness = harness(
            GuardConfig::default().with_allowed_jobs(["payments-deploy"]),
            ExecutorConfig::default(),
            StaticControlPlane::new(),
        );
        let action = submit(
            &harness.store,
            NewAction::new(ActionType::Restart, "nightly-build", "ops"),
        )
        .await;

        let status = harness.executor.execute(&action).await.unwrap();
        assert_eq!(status, ActionStatus::Rejected);

        let stored = harness.store.get_action(action.id).await.unwrap().unwrap();
        assert_eq!(stored.status, ActionStatus::Rejected);
        assert!(stored.error_message.unwrap().contains("allow-list"));
        assert!(stored.started_at.is_none(), "rejection bypasses running");
        assert!(harness.plane.calls().is_empty(), "remote client never called");
    }

    #[tokio::test]
    async fn dry_run_completes_without_remote_calls() {
        let harness = harness(
            GuardConfig::default(),
            dry_run_config(),
            StaticControlPlane::new(),
        );
        let action = submit(
            &harness.store,
            NewAction::new(ActionType::Restart, "dev-sample", "ops"),
        )
        .await;

        let status = harness.executor.execute(&action).await.unwrap();
        assert_eq!(status, ActionStatus::Completed);

        let stored = harness.store.get_action(action.id).await.unwrap().unwrap();
        assert!(stored.started_at.is_some());
        let outcome = stored.result.unwrap();
        assert!(outcome.dry_run);
        // Only the health check reached the control plane.
        assert_eq!(harness.plane.calls(), vec!["health_check"]);
    }

    #[tokio::test]
    async fn unreachable_control_plane_fails_the_action() {
        let harness = harness(
            GuardConfig::default(),
            ExecutorConfig::default(),
            StaticControlPlane::unreachable(),
        );
        let action = submit(
            &harness.store,
            NewAction::new(ActionType::Restart, "dev-sample", "ops"),
        )
        .await;

        let status = harness.executor.execute(&action).await.unwrap();
        assert_eq!(status, ActionStatus::Failed);
        let stored = harness.store.get_action(action.id).await.unwrap().unwrap();
        assert!(stored.error_message.unwrap().contains("unreachable"));
    }

    #[tokio::test]
    async fn successful_restart_stores_result_and_duration() {
        let harness = harness(
            GuardConfig::default(),
            ExecutorConfig::default(),
            StaticControlPlane::new(),
        );
        let action = submit(
            &harness.store,
            NewAction::new(ActionType::Restart, "dev-sample", "ops").with_target_build(7),
        )
        .await;

        let status = harness.executor.execute(&action).await.unwrap();
        assert_eq!(status, ActionStatus::Completed);

        let stored = harness.store.get_action(action.id).await.unwrap().unwrap();
        let outcome = stored.result.unwrap();
        assert!(!outcome.dry_run);
        assert_eq!(outcome.new_build_number, Some(8));
        assert!(stored.duration_seconds.is_some());
    }

    #[tokio::test]
    async fn remote_failure_marks_the_action_failed() {
        let harness = harness(
            GuardConfig::default(),
            ExecutorConfig::default(),
            StaticControlPlane::failing("queue is locked"),
        );
        let action = submit(
            &harness.store,
            NewAction::new(ActionType::Stop, "dev-sample", "ops").with_target_build(7),
        )
        .await;

        let status = harness.executor.execute(&action).await.unwrap();
        assert_eq!(status, ActionStatus::Failed);
        let stored = harness.store.get_action(action.id).await.unwrap().unwrap();
        assert_eq!(stored.error_message.as_deref(), Some("queue is locked"));
    }

    #[tokio::test]
    async fn rollback_without_target_build_fails_cleanly() {
        let harness = harness(
            GuardConfig::default(),
            ExecutorConfig::default(),
            StaticControlPlane::new(),
        );
        let action = submit(
            &harness.store,
            NewAction::new(ActionType::Rollback, "dev-sample", "ops"),
        )
        .await;

        let status = harness.executor.execute(&action).await.unwrap();
        assert_eq!(status, ActionStatus::Failed);
        let stored = harness.store.get_action(action.id).await.unwrap().unwrap();
        assert!(stored.error_message.unwrap().contains("target build"));
        assert_eq!(harness.plane.calls(), vec!["health_check"]);
    }

    #[tokio::test]
    async fn terminal_action_is_a_no_op() {
        let harness = harness(
            GuardConfig::default(),
            dry_run_config(),
            StaticControlPlane::new(),
        );
        let action = submit(
            &harness.store,
            NewAction::new(ActionType::Restart, "dev-sample", "ops"),
        )
        .await;

        harness.executor.execute(&action).await.unwrap();
        let stored = harness.store.get_action(action.id).await.unwrap().unwrap();
        let status = harness.executor.execute(&stored).await.unwrap();
        assert_eq!(status, ActionStatus::Completed);
        // No second health check happened.
        assert_eq!(harness.plane.calls(), vec!["health_check"]);
    }

    #[tokio::test]
    async fn concurrency_limit_defers_the_second_action() {
        let harness = harness(
            GuardConfig::default(),
            ExecutorConfig::default().with_max_concurrent(1),
            StaticControlPlane::new().with_latency(std::time::Duration::from_millis(150)),
        );
        let first = submit(
            &harness.store,
            NewAction::new(ActionType::Restart, "dev-sample", "ops"),
        )
        .await;
        let second = submit(
            &harness.store,
            NewAction::new(ActionType::Restart, "dev-other", "ops"),
        )
        .await;

        let executor = Arc::new(harness.executor);
        let first_run = {
            let executor = Arc::clone(&executor);
            let first = first.clone();
            tokio::spawn(async move { executor.execute(&first).await })
        };

        // Wait for the first action to hold the slot.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        let status = executor.execute(&second).await.unwrap();
        assert_eq!(status, ActionStatus::Pending, "second action is deferred");

        assert_eq!(first_run.await.unwrap().unwrap(), ActionStatus::Completed);

        // The next poll completes the deferred action.
        let finished = executor.process_pending().await.unwrap();
        assert_eq!(finished, 1);
        let stored = harness.store.get_action(second.id).await.unwrap().unwrap();
        assert_eq!(stored.status, ActionStatus::Completed);
    }

    #[tokio::test]
    async fn successful_restart_resolves_the_linked_incident() {
        let store = Arc::new(InMemoryStore::new());
        let ingest = IngestService::new(
            Arc::clone(&store),
            Arc::new(IncidentDetector::new()),
            OutboxConfig::default(),
        );
        ingest
            .ingest(vec![LogEntry::jenkins(
                "logs-jenkins",
                Utc::now(),
                "ERROR",
                "build failed",
            )
            .with_job("nightly-build", 112)])
            .await
            .unwrap();
        let incident_id = store.incidents().unwrap()[0].id;

        let plane = Arc::new(StaticControlPlane::new());
        let executor = ActionExecutor::new(
            Arc::clone(&store),
            Arc::new(ActionGuard::new(&GuardConfig::default())),
            Arc::clone(&plane) as _,
            ExecutorConfig::default(),
            OutboxConfig::default(),
        );

        let action = submit(
            &store,
            NewAction::new(ActionType::Restart, "nightly-build", "ops@example.com")
                .with_target_build(112)
                .with_incident(incident_id),
        )
        .await;
        let status = executor.execute(&action).await.unwrap();
        assert_eq!(status, ActionStatus::Completed);

        let incident = store.get_incident(incident_id).await.unwrap().unwrap();
        assert_eq!(incident.status, crate::incident::IncidentStatus::Resolved);
        assert_eq!(incident.resolved_by.as_deref(), Some("ops@example.com"));

        // The resolution event was enqueued atomically with the resolve.
        let resolution_events: Vec<_> = store
            .events()
            .unwrap()
            .into_iter()
            .filter(|event| event.topic() == Topic::IncidentResolved)
            .collect();
        assert_eq!(resolution_events.len(), 1);
        let EventPayload::IncidentResolved {
            resolution_method,
            mttr_minutes,
            ..
        } = &resolution_events[0].payload
        else {
            panic!("expected an incident-resolved payload");
        };
        assert_eq!(*resolution_method, ResolutionMethod::Restart);
        assert!(*mttr_minutes >= 0.0);
    }

    #[tokio::test]
    async fn stop_actions_do_not_resolve_incidents() {
        let store = Arc::new(InMemoryStore::new());
        let ingest = IngestService::new(
            Arc::clone(&store),
            Arc::new(IncidentDetector::new()),
            OutboxConfig::default(),
        );
        ingest
            .ingest(vec![LogEntry::jenkins(
                "logs-jenkins",
                Utc::now(),
                "ERROR",
                "build failed",
            )
            .with_job("staging-build", 9)])
            .await
            .unwrap();
        let incident_id = store.incidents().unwrap()[0].id;

        let executor = ActionExecutor::new(
            Arc::clone(&store),
            Arc::new(ActionGuard::new(&GuardConfig::default())),
            Arc::new(StaticControlPlane::new()) as _,
            ExecutorConfig::default(),
            OutboxConfig::default(),
        );
        let action = submit(
            &store,
            NewAction::new(ActionType::Stop, "staging-build", "ops")
                .with_target_build(9)
                .with_incident(incident_id),
        )
        .await;

        assert_eq!(
            executor.execute(&action).await.unwrap(),
            ActionStatus::Completed
        );
        let incident = store.get_incident(incident_id).await.unwrap().unwrap();
        assert!(incident.is_active(), "stop must not resolve the incident");
    }
}
