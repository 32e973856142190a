//! # triage-pipeline
//!
//! The incident-to-remediation pipeline: log batches come in, incidents and
//! notifications go out, and remediation actions run against a remote
//! build-orchestration service — with incident records, outbound events,
//! and action requests guaranteed to stay in sync across crashes, retries,
//! and concurrent workers.
//!
//! ## Core pieces
//!
//! - **Transactional outbox** ([`ingest`], [`service`], [`store`]): every
//!   state change and the event announcing it commit atomically
//! - **Outbox dispatcher** ([`dispatcher`]): at-least-once delivery with
//!   exponential backoff and crash-safe concurrent claiming
//! - **Incident detector** ([`detector`]): ordered first-match-wins rules
//! - **Action guard** ([`guard`]): ordered policy rules plus a risk tier
//! - **Action executor** ([`executor`]): the `pending → running →
//!   {completed|failed}` / `pending → rejected` state machine
//! - **Action consumer** ([`consumer`]): bus subscription feeding the
//!   executor
//!
//! ## Guarantees
//!
//! - **No dual-write inconsistency**: if an incident exists, its
//!   notification event exists (or the transaction that would have created
//!   both rolled back whole)
//! - **Claim exclusivity**: two dispatcher instances never publish the same
//!   event concurrently, with no external lock service
//! - **Bounded retry**: `retry_count` never exceeds `max_retries`; exhausted
//!   events are dead-lettered, never silently dropped
//! - **No silent drops**: every remediation request ends `completed`,
//!   `failed`, or `rejected` — or stays `pending` and is retried
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use triage_pipeline::config::OutboxConfig;
//! use triage_pipeline::detector::IncidentDetector;
//! use triage_pipeline::dispatcher::OutboxDispatcher;
//! use triage_pipeline::error::Result;
//! use triage_pipeline::ingest::IngestService;
//! use triage_pipeline::log::LogEntry;
//! use triage_pipeline::sink::ConsoleSink;
//! use triage_pipeline::store::memory::InMemoryStore;
//!
//! # async fn example() -> Result<()> {
//! let store = Arc::new(InMemoryStore::new());
//! let config = OutboxConfig::default();
//!
//! let ingest = IngestService::new(
//!     Arc::clone(&store),
//!     Arc::new(IncidentDetector::new()),
//!     config.clone(),
//! );
//! ingest
//!     .ingest(vec![LogEntry::jenkins(
//!         "logs-jenkins",
//!         chrono::Utc::now(),
//!         "ERROR",
//!         "build failed",
//!     )])
//!     .await?;
//!
//! let dispatcher = OutboxDispatcher::new(store, Arc::new(ConsoleSink::new()), config);
//! dispatcher.process_once().await?;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod action;
pub mod config;
pub mod consumer;
pub mod control_plane;
pub mod detector;
pub mod dispatcher;
pub mod error;
pub mod event;
pub mod executor;
pub mod guard;
pub mod incident;
pub mod ingest;
pub mod lifecycle;
pub mod log;
pub mod metrics;
pub mod service;
pub mod sink;
pub mod store;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::action::{ActionRequest, ActionStatus, ActionType, NewAction};
    pub use crate::config::{
        ControlPlaneConfig, ExecutorConfig, GuardConfig, OutboxConfig, PipelineConfig,
    };
    pub use crate::consumer::ActionConsumer;
    pub use crate::control_plane::{ControlPlane, HttpControlPlane};
    pub use crate::detector::{DetectionRule, IncidentDetector};
    pub use crate::dispatcher::{DispatchSummary, OutboxDispatcher};
    pub use crate::error::{Error, Result};
    pub use crate::event::{EventPayload, OutboxEvent, OutboxStatus, Topic, WireEvent};
    pub use crate::executor::ActionExecutor;
    pub use crate::guard::{ActionGuard, GuardRule, GuardVerdict};
    pub use crate::incident::{Incident, IncidentSeverity, IncidentStatus, ResolutionMethod};
    pub use crate::ingest::IngestService;
    pub use crate::log::{LogEntry, LogKind};
    pub use crate::service::ActionService;
    pub use crate::sink::{ConsoleSink, EventSink, InMemoryBus};
    pub use crate::store::{ActionStore, IncidentStore, OutboxStore, Store};
}
