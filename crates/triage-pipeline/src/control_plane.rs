//! Remote control-plane client.
//!
//! The pipeline remediates by calling a Jenkins-style build orchestrator.
//! [`ControlPlane`] is the contract the executor programs against;
//! [`HttpControlPlane`] speaks the real remote API; [`StaticControlPlane`]
//! is the scripted double used in tests.
//!
//! Remote calls never surface transport errors to the executor: every verb
//! returns an [`ActionResult`] with `success` and a message, and the
//! executor persists that either way. Each call carries a hard timeout set
//! on the client at construction.

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;

use crate::action::{ActionResult, ActionType};
use crate::config::ControlPlaneConfig;
use crate::error::{Error, Result};

/// Client contract for the remote build orchestrator.
#[async_trait]
pub trait ControlPlane: Send + Sync {
    /// Probes the remote service. Returns false on any failure.
    async fn health_check(&self) -> bool;

    /// Triggers a fresh build of the job.
    async fn restart(&self, job: &str, build: Option<u32>) -> ActionResult;

    /// Redeploys a previous successful build.
    async fn rollback(&self, job: &str, target_build: u32) -> ActionResult;

    /// Aborts an in-flight build.
    async fn stop(&self, job: &str, build: u32) -> ActionResult;
}

/// Delay between triggering a build and probing for its number.
const BUILD_NUMBER_PROBE_DELAY: Duration = Duration::from_secs(2);

#[derive(Debug, Deserialize)]
struct JobInfo {
    #[serde(rename = "lastBuild")]
    last_build: Option<BuildRef>,
}

#[derive(Debug, Deserialize)]
struct BuildRef {
    number: u32,
}

#[derive(Debug, Deserialize)]
struct BuildInfo {
    result: Option<String>,
}

/// HTTP client for a Jenkins-style remote API.
pub struct HttpControlPlane {
    client: reqwest::Client,
    base_url: String,
    username: String,
    api_token: String,
}

impl HttpControlPlane {
    /// Creates a new client from configuration.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the HTTP client cannot be built.
    pub fn new(config: &ControlPlaneConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| Error::configuration(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url: config.base_url.clone(),
            username: config.username.clone(),
            api_token: config.api_token.clone(),
        })
    }

    fn get(&self, path: &str) -> reqwest::RequestBuilder {
        self.client
            .get(format!("{}{path}", self.base_url))
            .basic_auth(&self.username, Some(&self.api_token))
    }

    fn post(&self, path: &str) -> reqwest::RequestBuilder {
        self.client
            .post(format!("{}{path}", self.base_url))
            .basic_auth(&self.username, Some(&self.api_token))
    }

    async fn last_build_number(&self, job: &str) -> Option<u32> {
        let response = self.get(&format!("/job/{job}/api/json")).send().await.ok()?;
        if !response.status().is_success() {
            return None;
        }
        let info: JobInfo = response.json().await.ok()?;
        info.last_build.map(|build| build.number)
    }

    async fn build_result(&self, job: &str, build: u32) -> Result<Option<String>> {
        let response = self
            .get(&format!("/job/{job}/{build}/api/json"))
            .send()
            .await
            .map_err(|e| Error::control_plane(format!("build lookup failed: {e}")))?;
        if !response.status().is_success() {
            return Err(Error::control_plane(format!(
                "build #{build} not found (HTTP {})",
                response.status()
            )));
        }
        let info: BuildInfo = response
            .json()
            .await
            .map_err(|e| Error::control_plane(format!("invalid build info: {e}")))?;
        Ok(info.result)
    }

    fn failure(action: ActionType, job: &str, build: Option<u32>, message: String) -> ActionResult {
        ActionResult {
            success: false,
            action,
            job_name: job.to_string(),
            build_number: build,
            new_build_number: None,
            message,
            timestamp: Utc::now(),
            details: None,
        }
    }
}

#[async_trait]
impl ControlPlane for HttpControlPlane {
    async fn health_check(&self) -> bool {
        match self.get("/api/json").send().await {
            Ok(response) => response.status().is_success(),
            Err(error) => {
                tracing::warn!(%error, "control plane health check failed");
                false
            }
        }
    }

    async fn restart(&self, job: &str, build: Option<u32>) -> ActionResult {
        // A restart is simply triggering a new build of the job.
        let trigger = self.post(&format!("/job/{job}/build")).send().await;
        match trigger {
            Ok(response) if response.status().is_success() => {
                // The queue needs a moment before the new build number shows
                // up on the job.
                tokio::time::sleep(BUILD_NUMBER_PROBE_DELAY).await;
                let new_build = self.last_build_number(job).await;
                ActionResult {
                    success: true,
                    action: ActionType::Restart,
                    job_name: job.to_string(),
                    build_number: build,
                    new_build_number: new_build,
                    message: match new_build {
                        Some(number) => format!("build restarted, new build #{number}"),
                        None => "build restarted".to_string(),
                    },
                    timestamp: Utc::now(),
                    details: None,
                }
            }
            Ok(response) => Self::failure(
                ActionType::Restart,
                job,
                build,
                format!("restart rejected: HTTP {}", response.status()),
            ),
            Err(error) => Self::failure(
                ActionType::Restart,
                job,
                build,
                format!("restart failed: {error}"),
            ),
        }
    }

    async fn rollback(&self, job: &str, target_build: u32) -> ActionResult {
        // The target must exist and have been a successful build.
        match self.build_result(job, target_build).await {
            Ok(Some(result)) if result == "SUCCESS" => {}
            Ok(result) => {
                return Self::failure(
                    ActionType::Rollback,
                    job,
                    Some(target_build),
                    format!(
                        "build #{target_build} was not successful ({})",
                        result.unwrap_or_else(|| "IN_PROGRESS".to_string())
                    ),
                );
            }
            Err(error) => {
                return Self::failure(
                    ActionType::Rollback,
                    job,
                    Some(target_build),
                    error.to_string(),
                );
            }
        }

        // Replay the target build; fall back to a parameterized build for
        // jobs without replay support.
        let replay = self
            .post(&format!("/job/{job}/{target_build}/replay"))
            .send()
            .await;
        let replayed = matches!(&replay, Ok(response) if response.status().is_success());

        if !replayed {
            let fallback = self
                .post(&format!(
                    "/job/{job}/buildWithParameters?ROLLBACK_TO={target_build}"
                ))
                .send()
                .await;
            match fallback {
                Ok(response) if response.status().is_success() => {}
                Ok(response) => {
                    return Self::failure(
                        ActionType::Rollback,
                        job,
                        Some(target_build),
                        format!("rollback rejected: HTTP {}", response.status()),
                    );
                }
                Err(error) => {
                    return Self::failure(
                        ActionType::Rollback,
                        job,
                        Some(target_build),
                        format!("rollback failed: {error}"),
                    );
                }
            }
        }

        ActionResult {
            success: true,
            action: ActionType::Rollback,
            job_name: job.to_string(),
            build_number: Some(target_build),
            new_build_number: None,
            message: format!("rollback to build #{target_build} started"),
            timestamp: Utc::now(),
            details: None,
        }
    }

    async fn stop(&self, job: &str, build: u32) -> ActionResult {
        let response = self.post(&format!("/job/{job}/{build}/stop")).send().await;
        match response {
            Ok(response) if response.status().is_success() => ActionResult {
                success: true,
                action: ActionType::Stop,
                job_name: job.to_string(),
                build_number: Some(build),
                new_build_number: None,
                message: format!("build #{build} stopped"),
                timestamp: Utc::now(),
                details: None,
            },
            Ok(response) => Self::failure(
                ActionType::Stop,
                job,
                Some(build),
                format!("stop rejected: HTTP {}", response.status()),
            ),
            Err(error) => Self::failure(
                ActionType::Stop,
                job,
                Some(build),
                format!("stop failed: {error}"),
            ),
        }
    }
}

/// Scripted control plane for tests.
///
/// Records every call so tests can assert the remote client was (or was
/// not) invoked, and replies according to a fixed script: healthy and
/// succeeding by default, failing with a message, or unreachable.
#[derive(Debug, Default)]
pub struct StaticControlPlane {
    unreachable: bool,
    failure_message: Option<String>,
    latency: Option<Duration>,
    calls: Mutex<Vec<String>>,
}

impl StaticControlPlane {
    /// A healthy control plane where every verb succeeds.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A healthy control plane where every verb fails with `message`.
    #[must_use]
    pub fn failing(message: impl Into<String>) -> Self {
        Self {
            failure_message: Some(message.into()),
            ..Self::default()
        }
    }

    /// A control plane whose health check fails.
    #[must_use]
    pub fn unreachable() -> Self {
        Self {
            unreachable: true,
            ..Self::default()
        }
    }

    /// Adds artificial latency to every verb, for concurrency tests.
    #[must_use]
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Returns the calls made so far, e.g. `restart(nightly-build)`.
    ///
    /// # Panics
    ///
    /// Panics if the call-log lock is poisoned (test-only type).
    #[must_use]
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().expect("call log lock poisoned").clone()
    }

    fn record(&self, call: String) {
        self.calls.lock().expect("call log lock poisoned").push(call);
    }

    async fn reply(&self, action: ActionType, job: &str, build: Option<u32>) -> ActionResult {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        match &self.failure_message {
            Some(message) => ActionResult {
                success: false,
                action,
                job_name: job.to_string(),
                build_number: build,
                new_build_number: None,
                message: message.clone(),
                timestamp: Utc::now(),
                details: None,
            },
            None => ActionResult {
                success: true,
                action,
                job_name: job.to_string(),
                build_number: build,
                new_build_number: build.map(|b| b + 1),
                message: format!("{action} succeeded"),
                timestamp: Utc::now(),
                details: None,
            },
        }
    }
}

#[async_trait]
impl ControlPlane for StaticControlPlane {
    async fn health_check(&self) -> bool {
        self.record("health_check".to_string());
        !self.unreachable
    }

    async fn restart(&self, job: &str, build: Option<u32>) -> ActionResult {
        self.record(format!("restart({job})"));
        self.reply(ActionType::Restart, job, build).await
    }

    async fn rollback(&self, job: &str, target_build: u32) -> ActionResult {
        self.record(format!("rollback({job}, #{target_build})"));
        self.reply(ActionType::Rollback, job, Some(target_build)).await
    }

    async fn stop(&self, job: &str, build: u32) -> ActionResult {
        self.record(format!("stop({job}, #{build})"));
        self.reply(ActionType::Stop, job, Some(build)).await
    }
}
