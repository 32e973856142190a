//! Pipeline configuration.
//!
//! Configuration is constructed once at process start and passed by reference
//! into every component constructor. There is no global accessor: each
//! component receives exactly the section it needs.

use std::time::Duration;

/// Outbox dispatcher tuning.
#[derive(Debug, Clone)]
pub struct OutboxConfig {
    /// Interval between dispatcher ticks.
    pub tick_interval: Duration,
    /// Maximum events claimed per tick.
    pub batch_size: usize,
    /// Retry budget for ordinary events (batch summaries).
    pub max_retries: u32,
    /// Retry budget for incident-detected events.
    ///
    /// Incident notifications get a larger budget than batch summaries.
    pub incident_max_retries: u32,
    /// Base delay for exponential backoff between publish retries.
    pub retry_backoff: chrono::Duration,
    /// How long a claimed (`processing`) event stays locked before another
    /// worker may reclaim it.
    pub lock_timeout: chrono::Duration,
    /// How long completed events are kept before cleanup deletes them.
    pub retention: chrono::Duration,
    /// Interval between cleanup passes.
    pub cleanup_interval: Duration,
    /// Emit outbox stats to the log every N ticks.
    pub stats_every_ticks: u64,
}

impl Default for OutboxConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(5),
            batch_size: 50,
            max_retries: 3,
            incident_max_retries: 5,
            retry_backoff: chrono::Duration::seconds(1),
            lock_timeout: chrono::Duration::seconds(300),
            retention: chrono::Duration::days(7),
            cleanup_interval: Duration::from_secs(3600),
            stats_every_ticks: 10,
        }
    }
}

impl OutboxConfig {
    /// Sets the dispatcher tick interval.
    #[must_use]
    pub const fn with_tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval = interval;
        self
    }

    /// Sets the claim batch size.
    #[must_use]
    pub const fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Sets the retry budget for ordinary events.
    #[must_use]
    pub const fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Sets the base backoff delay.
    #[must_use]
    pub const fn with_retry_backoff(mut self, backoff: chrono::Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }
}

/// Action-guard policy configuration.
#[derive(Debug, Clone)]
pub struct GuardConfig {
    /// Jobs remediation may target. Empty means permissive (lower
    /// environments run without an allow-list).
    pub allowed_jobs: Vec<String>,
    /// Restrict actions to business hours.
    pub business_hours_only: bool,
    /// First allowed hour (inclusive, 24h clock, UTC).
    pub business_hours_start: u32,
    /// First disallowed hour (exclusive).
    pub business_hours_end: u32,
    /// Job-name prefixes counted as non-production; `stop` is only permitted
    /// against these.
    pub non_production_prefixes: Vec<String>,
    /// Maximum age of a rollback target build.
    pub rollback_max_age: chrono::Duration,
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            allowed_jobs: Vec::new(),
            business_hours_only: false,
            business_hours_start: 8,
            business_hours_end: 18,
            non_production_prefixes: vec!["dev-".into(), "test-".into(), "staging-".into()],
            rollback_max_age: chrono::Duration::days(7),
        }
    }
}

impl GuardConfig {
    /// Sets the job allow-list.
    #[must_use]
    pub fn with_allowed_jobs(mut self, jobs: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.allowed_jobs = jobs.into_iter().map(Into::into).collect();
        self
    }

    /// Enables the business-hours restriction.
    #[must_use]
    pub const fn with_business_hours(mut self, start: u32, end: u32) -> Self {
        self.business_hours_only = true;
        self.business_hours_start = start;
        self.business_hours_end = end;
        self
    }
}

/// Action-executor tuning.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Maximum actions allowed in the `running` state at once.
    pub max_concurrent_actions: usize,
    /// When set, remediation is simulated and no remote call is performed.
    pub dry_run: bool,
    /// Simulated execution time in dry-run mode.
    pub dry_run_delay: Duration,
    /// Maximum pending actions drained per poll.
    pub pending_poll_limit: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_concurrent_actions: 3,
            dry_run: false,
            dry_run_delay: Duration::from_secs(2),
            pending_poll_limit: 10,
        }
    }
}

impl ExecutorConfig {
    /// Sets the concurrency limit.
    #[must_use]
    pub const fn with_max_concurrent(mut self, limit: usize) -> Self {
        self.max_concurrent_actions = limit;
        self
    }

    /// Enables dry-run mode.
    #[must_use]
    pub const fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }
}

/// Remote control-plane connection settings.
#[derive(Debug, Clone)]
pub struct ControlPlaneConfig {
    /// Base URL of the build-orchestration service (no trailing slash).
    pub base_url: String,
    /// Basic-auth username.
    pub username: String,
    /// Basic-auth API token.
    pub api_token: String,
    /// Hard per-call timeout.
    pub timeout: Duration,
}

impl ControlPlaneConfig {
    /// Creates a new control-plane configuration.
    ///
    /// A trailing slash on `base_url` is stripped.
    #[must_use]
    pub fn new(
        base_url: impl Into<String>,
        username: impl Into<String>,
        api_token: impl Into<String>,
    ) -> Self {
        let base_url = base_url.into();
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            username: username.into(),
            api_token: api_token.into(),
            timeout: Duration::from_secs(30),
        }
    }

    /// Sets the per-call timeout.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Top-level pipeline configuration, one value for the whole process.
#[derive(Debug, Clone, Default)]
pub struct PipelineConfig {
    /// Outbox dispatcher settings.
    pub outbox: OutboxConfig,
    /// Action-guard policy settings.
    pub guard: GuardConfig,
    /// Action-executor settings.
    pub executor: ExecutorConfig,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outbox_defaults_match_documented_values() {
        let config = OutboxConfig::default();
        assert_eq!(config.batch_size, 50);
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.incident_max_retries, 5);
        assert_eq!(config.lock_timeout, chrono::Duration::seconds(300));
    }

    #[test]
    fn guard_defaults_are_permissive() {
        let config = GuardConfig::default();
        assert!(config.allowed_jobs.is_empty());
        assert!(!config.business_hours_only);
    }

    #[test]
    fn control_plane_config_strips_trailing_slash() {
        let config = ControlPlaneConfig::new("http://jenkins:8080/", "ops", "token");
        assert_eq!(config.base_url, "http://jenkins:8080");
    }

    #[test]
    fn builders_compose() {
        let config = OutboxConfig::default()
            .with_batch_size(10)
            .with_max_retries(5)
            .with_retry_backoff(chrono::Duration::milliseconds(50));
        assert_eq!(config.batch_size, 10);
        assert_eq!(config.max_retries, 5);
    }
}
