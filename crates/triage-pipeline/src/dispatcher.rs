//! The outbox dispatcher: reliable at-least-once event delivery.
//!
//! Each tick claims a batch of due events (exclusively, even with multiple
//! dispatcher instances on the same store), publishes them to the
//! [`EventSink`], and advances their status. Failed publishes retry with
//! exponential backoff until the retry budget is exhausted, at which point
//! the event is dead-lettered and left for manual inspection.
//!
//! A crash between publish and status update replays the event after the
//! lock timeout; consumers deduplicate on the event id.
//!
//! [`OutboxDispatcher::process_once`] runs a single cycle for tests and
//! manual invocation; [`OutboxDispatcher::run`] is the production loop with
//! cleanup, periodic stats, and graceful shutdown.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use metrics::{counter, histogram};
use tokio::sync::watch;

use crate::config::OutboxConfig;
use crate::error::Result;
use crate::event::{EventPayload, OutboxEvent, OutboxStatus, WireEvent};
use crate::lifecycle::Lifecycle;
use crate::metrics::{labels, names};
use crate::sink::EventSink;
use crate::store::Store;

/// Counters for one dispatch cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchSummary {
    /// Events claimed this cycle.
    pub claimed: usize,
    /// Events published and completed.
    pub published: usize,
    /// Publish attempts that failed and were scheduled for retry.
    pub retried: usize,
    /// Events that exhausted their retry budget this cycle.
    pub dead_lettered: usize,
}

/// The outbox dispatcher worker.
pub struct OutboxDispatcher<S> {
    store: Arc<S>,
    sink: Arc<dyn EventSink>,
    config: OutboxConfig,
    lifecycle: Lifecycle,
}

impl<S: Store> OutboxDispatcher<S> {
    /// Creates a new dispatcher.
    #[must_use]
    pub fn new(store: Arc<S>, sink: Arc<dyn EventSink>, config: OutboxConfig) -> Self {
        Self {
            store,
            sink,
            config,
            lifecycle: Lifecycle::new(),
        }
    }

    /// Returns the worker lifecycle, for observation in tests and health
    /// endpoints.
    #[must_use]
    pub const fn lifecycle(&self) -> &Lifecycle {
        &self.lifecycle
    }

    /// Runs a single dispatch cycle at the current time.
    ///
    /// # Errors
    ///
    /// Returns an error if claiming fails; per-event publish failures are
    /// recorded on the events, not surfaced here.
    pub async fn process_once(&self) -> Result<DispatchSummary> {
        self.process_at(Utc::now()).await
    }

    /// Runs a single dispatch cycle with an explicit clock.
    ///
    /// # Errors
    ///
    /// See [`OutboxDispatcher::process_once`].
    #[tracing::instrument(skip(self))]
    pub async fn process_at(&self, now: DateTime<Utc>) -> Result<DispatchSummary> {
        let claimed = self
            .store
            .claim_batch(self.config.batch_size, self.config.lock_timeout, now)
            .await?;

        let mut summary = DispatchSummary {
            claimed: claimed.len(),
            ..DispatchSummary::default()
        };
        if claimed.is_empty() {
            return Ok(summary);
        }

        histogram!(names::OUTBOX_CLAIM_BATCH_SIZE).record(summary.claimed as f64);
        tracing::debug!(claimed = summary.claimed, "processing outbox batch");

        for event in claimed {
            self.process_event(&event, now, &mut summary).await?;
        }

        tracing::info!(
            claimed = summary.claimed,
            published = summary.published,
            retried = summary.retried,
            dead_lettered = summary.dead_lettered,
            "dispatch cycle finished"
        );
        Ok(summary)
    }

    /// Deletes completed events past the retention window. Returns the
    /// number of deleted events.
    ///
    /// # Errors
    ///
    /// Returns an error if the purge fails.
    pub async fn cleanup_once(&self) -> Result<usize> {
        let purged = self
            .store
            .purge_completed(self.config.retention, Utc::now())
            .await?;
        if purged > 0 {
            counter!(names::OUTBOX_PURGED_TOTAL).increment(purged as u64);
            tracing::info!(purged, "cleaned up completed outbox events");
        }
        Ok(purged)
    }

    /// Runs the dispatcher loop until `shutdown` flips to true.
    ///
    /// Start is idempotent: a second call while the loop is live logs and
    /// returns. The in-flight cycle finishes before the loop exits.
    ///
    /// # Errors
    ///
    /// Returns an error if the lifecycle lock is poisoned.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        if !self.lifecycle.begin_start()? {
            tracing::warn!("dispatcher already running, ignoring start");
            return Ok(());
        }

        let mut tick = tokio::time::interval(self.config.tick_interval);
        let mut cleanup = tokio::time::interval(self.config.cleanup_interval);
        // The first tick of an interval completes immediately.
        tick.tick().await;
        cleanup.tick().await;

        self.lifecycle.mark_running()?;
        tracing::info!(
            tick_interval = ?self.config.tick_interval,
            batch_size = self.config.batch_size,
            "dispatcher started"
        );

        // Drain whatever is already due instead of waiting a full interval.
        if let Err(error) = self.process_once().await {
            tracing::error!(%error, "dispatch cycle failed");
        }

        let mut ticks: u64 = 0;
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = tick.tick() => {
                    ticks += 1;
                    if let Err(error) = self.process_once().await {
                        tracing::error!(%error, "dispatch cycle failed");
                    }
                    if self.config.stats_every_ticks > 0
                        && ticks % self.config.stats_every_ticks == 0
                    {
                        self.log_stats().await;
                    }
                }
                _ = cleanup.tick() => {
                    if let Err(error) = self.cleanup_once().await {
                        tracing::error!(%error, "outbox cleanup failed");
                    }
                }
            }
        }

        self.lifecycle.begin_stop()?;
        self.lifecycle.mark_stopped()?;
        tracing::info!("dispatcher stopped");
        Ok(())
    }

    async fn process_event(
        &self,
        event: &OutboxEvent,
        now: DateTime<Utc>,
        summary: &mut DispatchSummary,
    ) -> Result<()> {
        let wire = WireEvent::from_outbox(event);
        let topic = event.topic().routing_key();

        match self.sink.publish(&wire).await {
            Ok(()) => {
                self.store.mark_completed(event.id, now).await?;
                counter!(names::OUTBOX_PUBLISHED_TOTAL, labels::TOPIC => topic).increment(1);
                summary.published += 1;
                tracing::debug!(event_id = %event.id, topic, "event published");

                // The dispatcher is the only component that knows the
                // notification actually went out, so it advances the
                // incident to notified.
                if let EventPayload::IncidentDetected { incident_id, .. } = event.payload {
                    if let Err(error) = self.store.mark_notified(&[incident_id], now).await {
                        tracing::error!(%error, %incident_id, "failed to mark incident notified");
                    }
                }
            }
            Err(error) => {
                counter!(names::OUTBOX_PUBLISH_FAILURES_TOTAL, labels::TOPIC => topic)
                    .increment(1);
                let status = self
                    .store
                    .mark_failed(event.id, &error.to_string(), self.config.retry_backoff, now)
                    .await?;
                if status == OutboxStatus::Failed {
                    counter!(names::OUTBOX_DEAD_LETTERED_TOTAL, labels::TOPIC => topic)
                        .increment(1);
                    summary.dead_lettered += 1;
                    tracing::warn!(
                        event_id = %event.id,
                        topic,
                        %error,
                        "event exhausted its retry budget and was dead-lettered"
                    );
                } else {
                    summary.retried += 1;
                    tracing::warn!(event_id = %event.id, topic, %error, "publish failed, will retry");
                }
            }
        }
        Ok(())
    }

    async fn log_stats(&self) {
        match self
            .store
            .outbox_stats(chrono::Duration::hours(24), Utc::now())
            .await
        {
            Ok(stats) => tracing::info!(
                pending = stats.pending,
                processing = stats.processing,
                completed = stats.completed,
                failed = stats.failed,
                total = stats.total,
                "outbox stats (24h)"
            ),
            Err(error) => tracing::error!(%error, "failed to read outbox stats"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::ActionType;
    use crate::detector::IncidentDetector;
    use crate::event::Topic;
    use crate::ingest::IngestService;
    use crate::log::LogEntry;
    use crate::sink::{FailingSink, InMemoryBus};
    use crate::store::memory::InMemoryStore;
    use crate::store::{IncidentStore, OutboxStore, Store};
    use triage_core::ActionId;

    fn fast_config() -> OutboxConfig {
        OutboxConfig::default()
            .with_tick_interval(std::time::Duration::from_millis(10))
            .with_retry_backoff(chrono::Duration::milliseconds(1))
    }

    async fn seed_incident_events(store: &Arc<InMemoryStore>) {
        let ingest = IngestService::new(
            Arc::clone(store),
            Arc::new(IncidentDetector::new()),
            fast_config(),
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
    }

    #[tokio::test]
    async fn publishes_claimed_events_and_completes_them() {
        let store = Arc::new(InMemoryStore::new());
        let bus = Arc::new(InMemoryBus::new());
        seed_incident_events(&store).await;

        let dispatcher = OutboxDispatcher::new(Arc::clone(&store), Arc::clone(&bus) as _, fast_config());
        let summary = dispatcher.process_once().await.unwrap();
        assert_eq!(summary.claimed, 2);
        assert_eq!(summary.published, 2);
        assert_eq!(summary.dead_lettered, 0);

        let published = bus.published();
        let keys: Vec<&str> = published.iter().map(WireEvent::routing_key).collect();
        assert!(keys.contains(&"logs.jenkins.created"));
        assert!(keys.contains(&"incident.detected"));

        // Everything completed; a second cycle claims nothing.
        let summary = dispatcher.process_once().await.unwrap();
        assert_eq!(summary.claimed, 0);
    }

    #[tokio::test]
    async fn successful_incident_publish_marks_incident_notified() {
        let store = Arc::new(InMemoryStore::new());
        let bus = Arc::new(InMemoryBus::new());
        seed_incident_events(&store).await;

        let dispatcher = OutboxDispatcher::new(Arc::clone(&store), bus as _, fast_config());
        dispatcher.process_once().await.unwrap();

        let incident_id = store.incidents().unwrap()[0].id;
        let incident = store.get_incident(incident_id).await.unwrap().unwrap();
        assert_eq!(incident.status, crate::incident::IncidentStatus::Notified);
        assert!(incident.notified_at.is_some());
    }

    #[tokio::test]
    async fn failed_publish_retries_then_dead_letters() {
        let store = Arc::new(InMemoryStore::new());
        let config = fast_config().with_max_retries(3);
        let event = crate::event::OutboxEvent::new(
            "action_x",
            EventPayload::ActionRequested {
                action_id: ActionId::generate(),
                action_type: ActionType::Restart,
                target_job: "dev-sample".into(),
                target_build: None,
                incident_id: None,
                reason: None,
            },
            3,
            Utc::now(),
        );
        let event_id = event.id;
        store
            .ingest(Vec::new(), Vec::new(), vec![event])
            .await
            .unwrap();

        let dispatcher = OutboxDispatcher::new(
            Arc::clone(&store),
            Arc::new(FailingSink::default()) as _,
            config,
        );

        let mut now = Utc::now();
        for attempt in 1..=3_u32 {
            let summary = dispatcher.process_at(now).await.unwrap();
            assert_eq!(summary.claimed, 1, "attempt {attempt}");
            now += chrono::Duration::seconds(60);
        }

        let event = store.get_event(event_id).await.unwrap().unwrap();
        assert_eq!(event.status, OutboxStatus::Failed);
        assert_eq!(event.retry_count, 3);
        assert!(event.next_retry_at.is_none());
        assert_eq!(event.error_message.as_deref(), Some("publish error: bus unreachable"));

        // Dead-lettered events stay dead.
        let summary = dispatcher.process_at(now).await.unwrap();
        assert_eq!(summary.claimed, 0);
    }

    #[tokio::test]
    async fn concurrent_dispatchers_never_claim_the_same_event() {
        let store = Arc::new(InMemoryStore::new());
        let bus = Arc::new(InMemoryBus::new());
        for _ in 0..20 {
            seed_incident_events(&store).await;
        }

        let a = Arc::new(OutboxDispatcher::new(
            Arc::clone(&store),
            Arc::clone(&bus) as _,
            fast_config().with_batch_size(7),
        ));
        let b = Arc::new(OutboxDispatcher::new(
            Arc::clone(&store),
            Arc::clone(&bus) as _,
            fast_config().with_batch_size(7),
        ));

        let (left, right) = tokio::join!(
            async {
                let mut total = 0;
                loop {
                    let summary = a.process_once().await.unwrap();
                    if summary.claimed == 0 {
                        break total;
                    }
                    total += summary.published;
                }
            },
            async {
                let mut total = 0;
                loop {
                    let summary = b.process_once().await.unwrap();
                    if summary.claimed == 0 {
                        break total;
                    }
                    total += summary.published;
                }
            }
        );

        // 20 batches x 2 events, each published exactly once across the two
        // workers.
        assert_eq!(left + right, 40);
        let published = bus.published();
        let mut ids: Vec<_> = published.iter().map(|event| event.event_id).collect();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 40, "no event may be published twice");
    }

    #[tokio::test]
    async fn run_loop_drains_and_stops_gracefully() {
        let store = Arc::new(InMemoryStore::new());
        let bus = Arc::new(InMemoryBus::new());
        seed_incident_events(&store).await;

        let dispatcher = Arc::new(OutboxDispatcher::new(
            Arc::clone(&store),
            Arc::clone(&bus) as _,
            fast_config(),
        ));
        let (stop, shutdown) = watch::channel(false);

        let handle = {
            let dispatcher = Arc::clone(&dispatcher);
            tokio::spawn(async move { dispatcher.run(shutdown).await })
        };

        // Give the loop a few ticks, then stop it.
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        stop.send(true).unwrap();
        handle.await.unwrap().unwrap();

        assert_eq!(bus.published().len(), 2);
        assert_eq!(
            dispatcher.lifecycle().state().unwrap(),
            crate::lifecycle::LifecycleState::Stopped
        );
    }

    #[tokio::test]
    async fn cleanup_purges_old_completed_events() {
        let store = Arc::new(InMemoryStore::new());
        let bus = Arc::new(InMemoryBus::new());
        seed_incident_events(&store).await;

        let config = fast_config().with_batch_size(10);
        let dispatcher = OutboxDispatcher::new(Arc::clone(&store), bus as _, config);
        dispatcher.process_once().await.unwrap();

        // Within retention nothing is purged.
        assert_eq!(dispatcher.cleanup_once().await.unwrap(), 0);

        // Age the completed events past retention.
        let purged = store
            .purge_completed(chrono::Duration::days(7), Utc::now() + chrono::Duration::days(8))
            .await
            .unwrap();
        assert_eq!(purged, 2);
    }

    #[tokio::test]
    async fn subscriber_receives_incident_notifications() {
        let store = Arc::new(InMemoryStore::new());
        let bus = Arc::new(InMemoryBus::new());
        let mut notifications = bus.subscribe(&[Topic::IncidentDetected]);
        seed_incident_events(&store).await;

        let dispatcher = OutboxDispatcher::new(store, Arc::clone(&bus) as _, fast_config());
        dispatcher.process_once().await.unwrap();

        let message = notifications.try_recv().unwrap();
        assert_eq!(message.routing_key, "incident.detected");
        let payload = &message.body["payload"];
        assert_eq!(payload["event_type"], "incident_detected");
        assert_eq!(payload["severity"], "high");
    }
}
