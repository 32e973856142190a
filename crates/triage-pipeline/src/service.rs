//! Remediation request submission.
//!
//! Human commands and automatic triggers both enter here: the pending
//! action row and the `actions.requested` outbox event commit atomically,
//! the same "write state + schedule event" primitive the ingest path uses.
//! The dispatcher relays the event to the bus, where the consumer picks it
//! up.

use std::sync::Arc;

use chrono::Utc;

use triage_core::ActionId;

use crate::action::NewAction;
use crate::config::OutboxConfig;
use crate::error::{Error, Result};
use crate::event::{EventPayload, OutboxEvent};
use crate::store::Store;

/// Entry point for creating remediation requests.
pub struct ActionService<S> {
    store: Arc<S>,
    config: OutboxConfig,
}

impl<S: Store> ActionService<S> {
    /// Creates a new action service.
    #[must_use]
    pub fn new(store: Arc<S>, config: OutboxConfig) -> Self {
        Self { store, config }
    }

    /// Submits a remediation request. Returns the new action's id.
    ///
    /// # Errors
    ///
    /// Returns a validation error for a blank target job or requester, or a
    /// storage error if the atomic commit fails (in which case neither the
    /// action nor the event exists).
    #[tracing::instrument(skip(self, new_action), fields(action_type = %new_action.action_type, target_job = %new_action.target_job))]
    pub async fn submit(&self, new_action: NewAction) -> Result<ActionId> {
        if new_action.target_job.trim().is_empty() {
            return Err(Error::validation("target job must not be empty"));
        }
        if new_action.requested_by.trim().is_empty() {
            return Err(Error::validation("requested_by must not be empty"));
        }

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
            self.config.max_retries,
            now,
        );

        let action_id = self.store.submit_action(action, event).await?;
        tracing::info!(%action_id, "remediation request submitted");
        Ok(action_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::{ActionStatus, ActionType};
    use crate::event::Topic;
    use crate::store::memory::InMemoryStore;
    use crate::store::ActionStore;

    #[tokio::test]
    async fn submit_commits_action_and_event_together() {
        let store = Arc::new(InMemoryStore::new());
        let service = ActionService::new(Arc::clone(&store), OutboxConfig::default());

        let action_id = service
            .submit(
                NewAction::new(ActionType::Restart, "nightly-build", "ops@example.com")
                    .with_target_build(112)
                    .with_reason("build failure"),
            )
            .await
            .unwrap();

        let action = store.get_action(action_id).await.unwrap().unwrap();
        assert_eq!(action.status, ActionStatus::Pending);

        let events = store.events().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].topic(), Topic::ActionRequested);
        assert_eq!(events[0].aggregate_id, format!("action_{action_id}"));
        let EventPayload::ActionRequested {
            action_id: event_action_id,
            ref reason,
            ..
        } = events[0].payload
        else {
            panic!("expected an action-requested payload");
        };
        assert_eq!(event_action_id, action_id);
        assert_eq!(reason.as_deref(), Some("build failure"));
    }

    #[tokio::test]
    async fn blank_job_is_rejected() {
        let store = Arc::new(InMemoryStore::new());
        let service = ActionService::new(Arc::clone(&store), OutboxConfig::default());

        let err = service
            .submit(NewAction::new(ActionType::Restart, "  ", "ops"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation { .. }));
        assert!(store.events().unwrap().is_empty());
    }
}
