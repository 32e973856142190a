//! Event sink abstraction for outbox publishing.
//!
//! This module provides:
//!
//! - [`EventSink`]: Trait for publishing wire envelopes to a message bus
//! - [`ConsoleSink`]: Logging publisher for dry-run and local development
//! - [`InMemoryBus`]: Loopback sink with subscriptions for tests
//! - [`FailingSink`]: A sink that always fails, for retry/backoff tests
//!
//! ## Delivery contract
//!
//! The dispatcher provides at-least-once delivery: a crash between publish
//! and status update may replay an envelope. Consumers deduplicate on the
//! event id / aggregate id.

use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::{Error, Result};
use crate::event::{Topic, WireEvent};

/// A publish target for outbox events.
#[async_trait]
pub trait EventSink: Send + Sync {
    /// Publishes an envelope under the topic's routing key.
    ///
    /// # Errors
    ///
    /// Returns a publish error when the bus rejects or cannot accept the
    /// envelope; the dispatcher schedules a retry.
    async fn publish(&self, event: &WireEvent) -> Result<()>;
}

/// A sink that logs envelopes instead of delivering them.
///
/// Used for local development and dry runs where no broker is available.
#[derive(Debug, Default)]
pub struct ConsoleSink;

impl ConsoleSink {
    /// Creates a new console sink.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl EventSink for ConsoleSink {
    async fn publish(&self, event: &WireEvent) -> Result<()> {
        tracing::info!(
            event_id = %event.event_id,
            event_type = %event.event_type,
            aggregate_id = %event.aggregate_id,
            routing_key = event.routing_key(),
            "event published (console)"
        );
        Ok(())
    }
}

/// A message delivered to a bus subscriber.
#[derive(Debug, Clone)]
pub struct BusMessage {
    /// Routing key the message was published under.
    pub routing_key: String,
    /// JSON body (the wire envelope, or a bare payload for direct sends).
    pub body: serde_json::Value,
}

struct Subscription {
    topics: Vec<Topic>,
    sender: mpsc::UnboundedSender<BusMessage>,
}

/// In-memory loopback bus for tests.
///
/// Implements [`EventSink`] on the publish side and hands out unbounded
/// receivers on the subscribe side. Published envelopes are also captured
/// for assertions.
#[derive(Default)]
pub struct InMemoryBus {
    subscriptions: Mutex<Vec<Subscription>>,
    published: Mutex<Vec<WireEvent>>,
}

impl InMemoryBus {
    /// Creates a new bus with no subscribers.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribes to a set of topics.
    ///
    /// # Panics
    ///
    /// Panics if the subscription lock is poisoned (test-only type).
    #[must_use]
    pub fn subscribe(&self, topics: &[Topic]) -> mpsc::UnboundedReceiver<BusMessage> {
        let (sender, receiver) = mpsc::unbounded_channel();
        self.subscriptions
            .lock()
            .expect("subscription lock poisoned")
            .push(Subscription {
                topics: topics.to_vec(),
                sender,
            });
        receiver
    }

    /// Sends a raw body to subscribers of `topic`, bypassing the outbox.
    ///
    /// Mirrors producers that publish directly to the bus (e.g. a chat
    /// command emitting a bare action payload).
    ///
    /// # Panics
    ///
    /// Panics if the subscription lock is poisoned (test-only type).
    pub fn send_raw(&self, topic: Topic, body: serde_json::Value) {
        let message = BusMessage {
            routing_key: topic.routing_key().to_string(),
            body,
        };
        let subscriptions = self
            .subscriptions
            .lock()
            .expect("subscription lock poisoned");
        for subscription in subscriptions.iter() {
            if subscription.topics.contains(&topic) {
                // A closed receiver just means the subscriber is gone.
                let _ = subscription.sender.send(message.clone());
            }
        }
    }

    /// Returns every envelope published so far, in publish order.
    ///
    /// # Panics
    ///
    /// Panics if the capture lock is poisoned (test-only type).
    #[must_use]
    pub fn published(&self) -> Vec<WireEvent> {
        self.published.lock().expect("capture lock poisoned").clone()
    }
}

#[async_trait]
impl EventSink for InMemoryBus {
    async fn publish(&self, event: &WireEvent) -> Result<()> {
        let body = serde_json::to_value(event)
            .map_err(|e| Error::serialization(format!("failed to encode wire event: {e}")))?;

        self.send_raw(event.payload.topic(), body);
        self.published
            .lock()
            .map_err(|_| Error::publish("bus capture lock poisoned"))?
            .push(event.clone());
        Ok(())
    }
}

/// A sink that rejects every publish with the same error message.
#[derive(Debug)]
pub struct FailingSink {
    message: String,
}

impl FailingSink {
    /// Creates a failing sink with the given error message.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl Default for FailingSink {
    fn default() -> Self {
        Self::new("bus unreachable")
    }
}

#[async_trait]
impl EventSink for FailingSink {
    async fn publish(&self, _event: &WireEvent) -> Result<()> {
        Err(Error::publish(self.message.clone()))
    }
}
