//! Log ingestion: the transactional outbox producer.
//!
//! One call persists a log batch, runs incident detection, persists the
//! detected incidents, and enqueues the outbox events announcing all of it —
//! in a single atomic store operation. If any step fails, nothing is
//! committed. This is the core consistency guarantee: the dispatcher may
//! assume that if an incident exists, its notification event exists too.
//!
//! Ids are minted here, before the commit, so detection stays a pure
//! function of `(entries, ids)` and the store primitive receives fully
//! materialized rows.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use metrics::{counter, histogram};

use triage_core::LogId;

use crate::config::OutboxConfig;
use crate::detector::IncidentDetector;
use crate::error::{Error, Result};
use crate::event::{EventPayload, OutboxEvent};
use crate::log::{LogEntry, LogKind};
use crate::metrics::{labels, names};
use crate::store::Store;

/// The ingestion entry point.
pub struct IngestService<S> {
    store: Arc<S>,
    detector: Arc<IncidentDetector>,
    config: OutboxConfig,
}

impl<S: Store> IngestService<S> {
    /// Creates a new ingest service.
    #[must_use]
    pub fn new(store: Arc<S>, detector: Arc<IncidentDetector>, config: OutboxConfig) -> Self {
        Self {
            store,
            detector,
            config,
        }
    }

    /// Ingests a batch of log entries. Returns the number of persisted rows.
    ///
    /// # Errors
    ///
    /// Returns a validation error for an empty or mixed-kind batch (nothing
    /// is written), or a storage error if the atomic commit fails (nothing
    /// is written either).
    pub async fn ingest(&self, batch: Vec<LogEntry>) -> Result<usize> {
        self.ingest_at(batch, Utc::now()).await
    }

    /// Ingests a batch with an explicit clock, for deterministic tests.
    ///
    /// # Errors
    ///
    /// See [`IngestService::ingest`].
    #[tracing::instrument(skip(self, batch), fields(batch_size = batch.len()))]
    pub async fn ingest_at(&self, batch: Vec<LogEntry>, now: DateTime<Utc>) -> Result<usize> {
        let kind = Self::validate_batch(&batch)?;

        let ids: Vec<LogId> = batch.iter().map(|_| LogId::generate()).collect();
        let incidents = self.detector.analyze(&batch, &ids, now)?;

        let mut events = Vec::with_capacity(1 + incidents.len());
        events.push(OutboxEvent::new(
            format!("{kind}_batch_{}", ids[0]),
            Self::batch_payload(kind, &batch, &ids, incidents.len()),
            self.config.max_retries,
            now,
        ));

        // Critical/high incidents get an immediate, individually-addressed
        // notification with a larger retry budget; the rest fold into the
        // batch summary.
        for incident in IncidentDetector::filter_critical(&incidents) {
            events.push(OutboxEvent::new(
                format!("incident_{}", incident.id),
                EventPayload::incident_detected(incident),
                self.config.incident_max_retries,
                now,
            ));
        }

        let count = batch.len();
        let incident_count = incidents.len();
        for incident in &incidents {
            counter!(
                names::INCIDENTS_DETECTED_TOTAL,
                labels::SEVERITY => incident.severity.as_str(),
            )
            .increment(1);
        }

        let logs: Vec<(LogId, LogEntry)> = ids.iter().copied().zip(batch).collect();
        self.store.ingest(logs, incidents, events).await?;

        histogram!(names::INGEST_BATCH_SIZE, labels::LOG_KIND => kind.as_str())
            .record(count as f64);
        tracing::info!(
            count,
            incidents = incident_count,
            kind = %kind,
            "log batch ingested"
        );
        Ok(count)
    }

    fn validate_batch(batch: &[LogEntry]) -> Result<LogKind> {
        let Some(first) = batch.first() else {
            return Err(Error::validation("log batch is empty"));
        };
        let kind = first.kind();
        if batch.iter().any(|entry| entry.kind() != kind) {
            return Err(Error::validation(
                "log batch mixes jenkins and api entries; ingest one kind per batch",
            ));
        }
        Ok(kind)
    }

    fn batch_payload(
        kind: LogKind,
        batch: &[LogEntry],
        ids: &[LogId],
        incidents_detected: usize,
    ) -> EventPayload {
        let first_timestamp = batch[0].timestamp();
        let last_timestamp = batch[batch.len() - 1].timestamp();

        match kind {
            LogKind::Jenkins => {
                let mut levels: Vec<String> = Vec::new();
                for entry in batch {
                    if let LogEntry::Jenkins { level, .. } = entry {
                        if !levels.contains(level) {
                            levels.push(level.clone());
                        }
                    }
                }
                EventPayload::JenkinsLogCreated {
                    log_ids: ids.to_vec(),
                    count: batch.len(),
                    levels,
                    first_timestamp,
                    last_timestamp,
                    incidents_detected,
                }
            }
            LogKind::Api => {
                let mut methods: Vec<String> = Vec::new();
                let mut statuses: Vec<u16> = Vec::new();
                for entry in batch {
                    if let LogEntry::Api {
                        http_method,
                        http_status,
                        ..
                    } = entry
                    {
                        if !methods.contains(http_method) {
                            methods.push(http_method.clone());
                        }
                        if !statuses.contains(http_status) {
                            statuses.push(*http_status);
                        }
                    }
                }
                EventPayload::ApiLogCreated {
                    log_ids: ids.to_vec(),
                    count: batch.len(),
                    methods,
                    statuses,
                    first_timestamp,
                    last_timestamp,
                    incidents_detected,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::OutboxStatus;
    use crate::incident::IncidentSeverity;
    use crate::store::memory::InMemoryStore;
    use crate::store::IncidentStore;

    fn service(store: Arc<InMemoryStore>) -> IngestService<InMemoryStore> {
        IngestService::new(
            store,
            Arc::new(IncidentDetector::new()),
            OutboxConfig::default(),
        )
    }

    #[tokio::test]
    async fn empty_batch_is_rejected_without_writing() {
        let store = Arc::new(InMemoryStore::new());
        let service = service(Arc::clone(&store));

        let err = service.ingest(Vec::new()).await.unwrap_err();
        assert!(matches!(err, Error::Validation { .. }));
        assert_eq!(store.log_count().await.unwrap(), 0);
        assert!(store.events().unwrap().is_empty());
    }

    #[tokio::test]
    async fn mixed_kind_batch_is_rejected_without_writing() {
        let store = Arc::new(InMemoryStore::new());
        let service = service(Arc::clone(&store));

        let batch = vec![
            LogEntry::jenkins("logs-jenkins", Utc::now(), "INFO", "build ok"),
            LogEntry::api("logs-api", Utc::now(), "GET /health", "GET", 200),
        ];
        let err = service.ingest(batch).await.unwrap_err();
        assert!(matches!(err, Error::Validation { .. }));
        assert_eq!(store.log_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn clean_batch_produces_exactly_one_summary_event() {
        let store = Arc::new(InMemoryStore::new());
        let service = service(Arc::clone(&store));

        let count = service
            .ingest(vec![
                LogEntry::jenkins("logs-jenkins", Utc::now(), "INFO", "build ok"),
                LogEntry::jenkins("logs-jenkins", Utc::now(), "INFO", "tests green"),
            ])
            .await
            .unwrap();
        assert_eq!(count, 2);
        assert_eq!(store.log_count().await.unwrap(), 2);

        let events = store.events().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].status, OutboxStatus::Pending);
        let EventPayload::JenkinsLogCreated {
            count,
            incidents_detected,
            ref levels,
            ..
        } = events[0].payload
        else {
            panic!("expected a jenkins batch payload");
        };
        assert_eq!(count, 2);
        assert_eq!(incidents_detected, 0);
        assert_eq!(levels, &vec!["INFO".to_string()]);
    }

    #[tokio::test]
    async fn build_failure_commits_incident_and_two_events() {
        let store = Arc::new(InMemoryStore::new());
        let service = service(Arc::clone(&store));

        service
            .ingest(vec![LogEntry::jenkins(
                "logs-jenkins",
                Utc::now(),
                "ERROR",
                "build failed",
            )
            .with_job("nightly-build", 112)])
            .await
            .unwrap();

        let incidents = store.incidents().unwrap();
        assert_eq!(incidents.len(), 1);
        assert_eq!(incidents[0].incident_type, "jenkins_build_failure");
        assert_eq!(incidents[0].severity, IncidentSeverity::High);

        let events = store.events().unwrap();
        assert_eq!(events.len(), 2);
        assert!(matches!(
            events[0].payload,
            EventPayload::JenkinsLogCreated {
                incidents_detected: 1,
                ..
            }
        ));
        let EventPayload::IncidentDetected { incident_id, .. } = events[1].payload else {
            panic!("expected an incident-detected payload");
        };
        assert_eq!(incident_id, incidents[0].id);
        // Incident notifications carry the larger retry budget.
        assert_eq!(events[1].max_retries, OutboxConfig::default().incident_max_retries);
        assert_eq!(events[1].aggregate_id, format!("incident_{incident_id}"));
    }

    #[tokio::test]
    async fn medium_incidents_fold_into_the_batch_summary() {
        let store = Arc::new(InMemoryStore::new());
        let service = service(Arc::clone(&store));

        service
            .ingest(vec![LogEntry::api(
                "logs-api",
                Utc::now(),
                "GET /missing",
                "GET",
                404,
            )])
            .await
            .unwrap();

        // A medium-severity incident exists, but no individual notification.
        assert_eq!(store.incidents().unwrap().len(), 1);
        let events = store.events().unwrap();
        assert_eq!(events.len(), 1);
        assert!(matches!(
            events[0].payload,
            EventPayload::ApiLogCreated {
                incidents_detected: 1,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn api_batch_summarizes_methods_and_statuses() {
        let store = Arc::new(InMemoryStore::new());
        let service = service(Arc::clone(&store));
        let now = Utc::now();

        service
            .ingest(vec![
                LogEntry::api("logs-api", now, "GET /a", "GET", 200),
                LogEntry::api("logs-api", now, "POST /b", "POST", 200),
                LogEntry::api("logs-api", now, "GET /c", "GET", 204),
            ])
            .await
            .unwrap();

        let events = store.events().unwrap();
        let EventPayload::ApiLogCreated {
            ref methods,
            ref statuses,
            ..
        } = events[0].payload
        else {
            panic!("expected an api batch payload");
        };
        assert_eq!(methods, &vec!["GET".to_string(), "POST".to_string()]);
        assert_eq!(statuses, &vec![200, 204]);
    }

    #[tokio::test]
    async fn detected_incident_can_be_marked_notified() {
        let store = Arc::new(InMemoryStore::new());
        let service = service(Arc::clone(&store));

        service
            .ingest(vec![LogEntry::jenkins(
                "logs-jenkins",
                Utc::now(),
                "ERROR",
                "deploy failed",
            )])
            .await
            .unwrap();

        let incident_id = store.incidents().unwrap()[0].id;
        store.mark_notified(&[incident_id], Utc::now()).await.unwrap();
        let incident = store.get_incident(incident_id).await.unwrap().unwrap();
        assert!(incident.notified_at.is_some());
    }
}
