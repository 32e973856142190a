//! The action consumer: bus subscription feeding the executor.
//!
//! Subscribes to remediation-request messages and drives each referenced
//! action through the executor, one message at a time. Two wire formats are
//! accepted:
//!
//! 1. The outbox envelope: `{eventId, eventType, payload: {action_id, ...}}`
//! 2. A bare payload: `{action_id, ...}` (producers that publish directly)
//!
//! A message whose action no longer exists is a poison message: it is
//! logged and dropped, never retried. Malformed bodies get the same
//! treatment. The loop itself never dies on a bad message.

use std::str::FromStr;
use std::sync::Arc;

use tokio::sync::{mpsc, watch};

use triage_core::ActionId;

use crate::action::ActionStatus;
use crate::error::{Error, Result};
use crate::executor::ActionExecutor;
use crate::lifecycle::Lifecycle;
use crate::sink::BusMessage;
use crate::store::Store;

/// The remediation-request consumer worker.
pub struct ActionConsumer<S> {
    store: Arc<S>,
    executor: Arc<ActionExecutor<S>>,
    lifecycle: Lifecycle,
}

impl<S: Store> ActionConsumer<S> {
    /// Creates a new consumer.
    #[must_use]
    pub fn new(store: Arc<S>, executor: Arc<ActionExecutor<S>>) -> Self {
        Self {
            store,
            executor,
            lifecycle: Lifecycle::new(),
        }
    }

    /// Returns the worker lifecycle.
    #[must_use]
    pub const fn lifecycle(&self) -> &Lifecycle {
        &self.lifecycle
    }

    /// Consumes messages until the channel closes or `shutdown` flips to
    /// true. The in-flight message finishes before the loop exits.
    ///
    /// # Errors
    ///
    /// Returns an error if the lifecycle lock is poisoned.
    pub async fn run(
        &self,
        mut messages: mpsc::UnboundedReceiver<BusMessage>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        if !self.lifecycle.begin_start()? {
            tracing::warn!("consumer already running, ignoring start");
            return Ok(());
        }
        self.lifecycle.mark_running()?;
        tracing::info!("action consumer started");

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                message = messages.recv() => {
                    let Some(message) = message else {
                        tracing::info!("bus subscription closed");
                        break;
                    };
                    // Poison messages are logged and dropped; the loop
                    // keeps consuming.
                    if let Err(error) = self.handle_message(&message).await {
                        tracing::error!(
                            %error,
                            routing_key = %message.routing_key,
                            "dropping unprocessable message"
                        );
                    }
                }
            }
        }

        self.lifecycle.begin_stop()?;
        self.lifecycle.mark_stopped()?;
        tracing::info!("action consumer stopped");
        Ok(())
    }

    /// Processes one message: extract the action id, load the action, run
    /// the executor. Returns the resulting status, or `None` for a poison
    /// message referencing a vanished action.
    ///
    /// # Errors
    ///
    /// Returns a validation error for bodies carrying no usable action id.
    pub async fn handle_message(&self, message: &BusMessage) -> Result<Option<ActionStatus>> {
        let action_id = Self::extract_action_id(&message.body)?;

        let Some(action) = self.store.get_action(action_id).await? else {
            // The owning record is gone; retrying can never succeed.
            tracing::error!(
                %action_id,
                routing_key = %message.routing_key,
                "action referenced by message no longer exists, dropping"
            );
            return Ok(None);
        };

        tracing::debug!(%action_id, routing_key = %message.routing_key, "remediation request received");
        let status = self.executor.execute(&action).await?;
        Ok(Some(status))
    }

    /// Accepts both the outbox envelope and the bare payload format.
    fn extract_action_id(body: &serde_json::Value) -> Result<ActionId> {
        let raw = body
            .get("payload")
            .and_then(|payload| payload.get("action_id"))
            .or_else(|| body.get("action_id"))
            .and_then(serde_json::Value::as_str)
            .ok_or_else(|| Error::validation("message carries no action_id"))?;

        ActionId::from_str(raw).map_err(Into::into)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::{ActionType, NewAction};
    use crate::config::{ExecutorConfig, GuardConfig, OutboxConfig};
    use crate::control_plane::StaticControlPlane;
    use crate::event::{EventPayload, OutboxEvent, Topic, WireEvent};
    use crate::guard::ActionGuard;
    use crate::sink::{EventSink, InMemoryBus};
    use crate::store::memory::InMemoryStore;
    use crate::store::ActionStore;
    use chrono::Utc;

    fn consumer(store: Arc<InMemoryStore>) -> ActionConsumer<InMemoryStore> {
        let executor = Arc::new(ActionExecutor::new(
            Arc::clone(&store),
            Arc::new(ActionGuard::new(&GuardConfig::default())),
            Arc::new(StaticControlPlane::new()) as _,
            ExecutorConfig {
                dry_run: true,
                dry_run_delay: std::time::Duration::from_millis(5),
                ..ExecutorConfig::default()
            },
            OutboxConfig::default(),
        ));
        ActionConsumer::new(store, executor)
    }

    async fn submitted_action_event(store: &Arc<InMemoryStore>) -> (ActionId, OutboxEvent) {
        let now = Utc::now();
        let action = NewAction::new(ActionType::Restart, "dev-sample", "ops").into_request(now);
        let action_id = action.id;
        let event = OutboxEvent::new(
            format!("action_{action_id}"),
            EventPayload::ActionRequested {
                action_id,
                action_type: ActionType::Restart,
                target_job: "dev-sample".into(),
                target_build: None,
                incident_id: None,
                reason: None,
            },
            3,
            now,
        );
        store.submit_action(action, event.clone()).await.unwrap();
        (action_id, event)
    }

    #[tokio::test]
    async fn envelope_format_is_processed() {
        let store = Arc::new(InMemoryStore::new());
        let consumer = consumer(Arc::clone(&store));
        let (action_id, event) = submitted_action_event(&store).await;

        let body = serde_json::to_value(WireEvent::from_outbox(&event)).unwrap();
        let message = BusMessage {
            routing_key: Topic::ActionRequested.routing_key().to_string(),
            body,
        };

        let status = consumer.handle_message(&message).await.unwrap();
        assert_eq!(status, Some(ActionStatus::Completed));
        let stored = store.get_action(action_id).await.unwrap().unwrap();
        assert_eq!(stored.status, ActionStatus::Completed);
    }

    #[tokio::test]
    async fn bare_payload_format_is_processed() {
        let store = Arc::new(InMemoryStore::new());
        let consumer = consumer(Arc::clone(&store));
        let (action_id, _event) = submitted_action_event(&store).await;

        let message = BusMessage {
            routing_key: Topic::ActionRequested.routing_key().to_string(),
            body: serde_json::json!({
                "action_id": action_id.to_string(),
                "action_type": "restart",
                "target_job": "dev-sample",
            }),
        };

        let status = consumer.handle_message(&message).await.unwrap();
        assert_eq!(status, Some(ActionStatus::Completed));
    }

    #[tokio::test]
    async fn vanished_action_is_a_poison_message() {
        let store = Arc::new(InMemoryStore::new());
        let consumer = consumer(store);

        let message = BusMessage {
            routing_key: Topic::ActionRequested.routing_key().to_string(),
            body: serde_json::json!({"action_id": ActionId::generate().to_string()}),
        };

        let status = consumer.handle_message(&message).await.unwrap();
        assert_eq!(status, None);
    }

    #[tokio::test]
    async fn body_without_action_id_is_rejected() {
        let store = Arc::new(InMemoryStore::new());
        let consumer = consumer(store);

        let message = BusMessage {
            routing_key: Topic::ActionRequested.routing_key().to_string(),
            body: serde_json::json!({"hello": "world"}),
        };

        let err = consumer.handle_message(&message).await.unwrap_err();
        assert!(matches!(err, Error::Validation { .. }));
    }

    #[tokio::test]
    async fn run_loop_consumes_from_the_bus_until_shutdown() {
        let store = Arc::new(InMemoryStore::new());
        let bus = Arc::new(InMemoryBus::new());
        let receiver = bus.subscribe(&[Topic::ActionRequested]);
        let consumer = Arc::new(consumer(Arc::clone(&store)));

        let (action_id, event) = submitted_action_event(&store).await;
        bus.publish(&WireEvent::from_outbox(&event)).await.unwrap();

        let (stop, shutdown) = watch::channel(false);
        let handle = {
            let consumer = Arc::clone(&consumer);
            tokio::spawn(async move { consumer.run(receiver, shutdown).await })
        };

        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        stop.send(true).unwrap();
        handle.await.unwrap().unwrap();

        let stored = store.get_action(action_id).await.unwrap().unwrap();
        assert_eq!(stored.status, ActionStatus::Completed);
        assert_eq!(
            consumer.lifecycle().state().unwrap(),
            crate::lifecycle::LifecycleState::Stopped
        );
    }
}
