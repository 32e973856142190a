//! Incident detection rules.
//!
//! The detector holds an ordered rule list and evaluates it against every
//! ingested entry. Rule order is the contract: for each entry, the **first**
//! matching rule wins and later rules are not consulted, so one entry can
//! never produce more than one incident. Rules can be appended at runtime.
//!
//! `analyze` is a pure function of its inputs and performs no I/O; the
//! ingest service runs it inside the same atomic operation that persists the
//! batch.

use std::sync::{PoisonError, RwLock};

use chrono::{DateTime, Utc};
use regex::{Regex, RegexBuilder};

use triage_core::LogId;

use crate::error::{Error, Result};
use crate::incident::{Incident, IncidentDetails, IncidentSeverity};
use crate::log::{LogEntry, LogKind};

/// How a rule matches a log entry.
enum RuleMatcher {
    /// Job-style: exact level plus a case-insensitive message pattern.
    LevelAndMessage {
        level: String,
        pattern: Regex,
    },
    /// Request-style: HTTP status within `[lo, hi)`.
    StatusRange {
        lo: u16,
        hi: u16,
    },
    /// Request-style: HTTP status in a fixed set.
    StatusIn(Vec<u16>),
    /// Arbitrary predicate for runtime-appended rules.
    Custom(Box<dyn Fn(&LogEntry) -> bool + Send + Sync>),
}

impl std::fmt::Debug for RuleMatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::LevelAndMessage { level, pattern } => f
                .debug_struct("LevelAndMessage")
                .field("level", level)
                .field("pattern", &pattern.as_str())
                .finish(),
            Self::StatusRange { lo, hi } => f
                .debug_struct("StatusRange")
                .field("lo", lo)
                .field("hi", hi)
                .finish(),
            Self::StatusIn(statuses) => f.debug_tuple("StatusIn").field(statuses).finish(),
            Self::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

/// A single detection rule.
#[derive(Debug)]
pub struct DetectionRule {
    /// Rule name; becomes `incident_type` on detected incidents.
    pub name: String,
    /// Which log kind the rule applies to.
    pub applies_to: LogKind,
    /// Severity assigned to detected incidents.
    pub severity: IncidentSeverity,
    /// Human-readable description.
    pub description: String,
    /// Runbook link attached to detected incidents.
    pub runbook: Option<String>,
    matcher: RuleMatcher,
}

impl DetectionRule {
    /// Creates a job-log rule matching a level and a case-insensitive
    /// message pattern.
    ///
    /// # Errors
    ///
    /// Returns a validation error if `pattern` is not a valid regex.
    pub fn level_and_message(
        name: impl Into<String>,
        severity: IncidentSeverity,
        level: impl Into<String>,
        pattern: &str,
        description: impl Into<String>,
    ) -> Result<Self> {
        let pattern = RegexBuilder::new(pattern)
            .case_insensitive(true)
            .build()
            .map_err(|e| Error::validation(format!("invalid rule pattern '{pattern}': {e}")))?;
        Ok(Self {
            name: name.into(),
            applies_to: LogKind::Jenkins,
            severity,
            description: description.into(),
            runbook: None,
            matcher: RuleMatcher::LevelAndMessage {
                level: level.into(),
                pattern,
            },
        })
    }

    /// Creates a request-log rule matching a status range `[lo, hi)`.
    #[must_use]
    pub fn status_range(
        name: impl Into<String>,
        severity: IncidentSeverity,
        lo: u16,
        hi: u16,
        description: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            applies_to: LogKind::Api,
            severity,
            description: description.into(),
            runbook: None,
            matcher: RuleMatcher::StatusRange { lo, hi },
        }
    }

    /// Creates a request-log rule matching a fixed status set.
    #[must_use]
    pub fn status_in(
        name: impl Into<String>,
        severity: IncidentSeverity,
        statuses: Vec<u16>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            applies_to: LogKind::Api,
            severity,
            description: description.into(),
            runbook: None,
            matcher: RuleMatcher::StatusIn(statuses),
        }
    }

    /// Creates a rule with an arbitrary predicate.
    #[must_use]
    pub fn custom(
        name: impl Into<String>,
        applies_to: LogKind,
        severity: IncidentSeverity,
        description: impl Into<String>,
        predicate: impl Fn(&LogEntry) -> bool + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            applies_to,
            severity,
            description: description.into(),
            runbook: None,
            matcher: RuleMatcher::Custom(Box::new(predicate)),
        }
    }

    /// Attaches a runbook link.
    #[must_use]
    pub fn with_runbook(mut self, runbook: impl Into<String>) -> Self {
        self.runbook = Some(runbook.into());
        self
    }

    /// Returns true if the rule matches the entry.
    #[must_use]
    pub fn matches(&self, entry: &LogEntry) -> bool {
        if entry.kind() != self.applies_to {
            return false;
        }
        match (&self.matcher, entry) {
            (
                RuleMatcher::LevelAndMessage { level, pattern },
                LogEntry::Jenkins {
                    level: entry_level,
                    message,
                    ..
                },
            ) => entry_level == level && pattern.is_match(message),
            (RuleMatcher::StatusRange { lo, hi }, LogEntry::Api { http_status, .. }) => {
                (*lo..*hi).contains(http_status)
            }
            (RuleMatcher::StatusIn(statuses), LogEntry::Api { http_status, .. }) => {
                statuses.contains(http_status)
            }
            (RuleMatcher::Custom(predicate), entry) => predicate(entry),
            _ => false,
        }
    }
}

/// Converts a lock poison error to a storage error.
fn poison_err<T>(_: PoisonError<T>) -> Error {
    Error::storage("detector rule lock poisoned")
}

/// The incident-detection rule engine.
///
/// ## Rule ordering contract
///
/// Rules are evaluated in list order and the first match wins. The default
/// request-log rules are ordered 5xx → auth failures → 4xx so a 401 is
/// reported as an auth failure, not folded into the generic 4xx rule.
#[derive(Debug)]
pub struct IncidentDetector {
    rules: RwLock<Vec<DetectionRule>>,
}

impl Default for IncidentDetector {
    fn default() -> Self {
        Self::new()
    }
}

impl IncidentDetector {
    /// Creates a detector with the default rule set.
    ///
    /// # Panics
    ///
    /// Never panics: the default rule patterns are compile-time constants
    /// known to be valid.
    #[must_use]
    pub fn new() -> Self {
        Self::with_rules(Self::default_rules())
    }

    /// Creates a detector with a custom rule set.
    #[must_use]
    pub fn with_rules(rules: Vec<DetectionRule>) -> Self {
        Self {
            rules: RwLock::new(rules),
        }
    }

    /// The built-in rule set.
    #[must_use]
    #[allow(clippy::missing_panics_doc)]
    pub fn default_rules() -> Vec<DetectionRule> {
        let level_rule = |name: &str, severity, pattern: &str, description: &str| {
            DetectionRule::level_and_message(name, severity, "ERROR", pattern, description)
                .unwrap_or_else(|_| unreachable!("built-in patterns are valid"))
        };

        vec![
            level_rule(
                "jenkins_deployment_failure",
                IncidentSeverity::Critical,
                r"deploy.*(fail|error)",
                "a deployment failed",
            ),
            level_rule(
                "jenkins_build_failure",
                IncidentSeverity::High,
                r"build.*(fail|error)",
                "a build failed",
            ),
            level_rule(
                "jenkins_pipeline_failure",
                IncidentSeverity::High,
                r"pipeline.*(fail|error)",
                "a pipeline stage failed",
            ),
            level_rule(
                "jenkins_exception",
                IncidentSeverity::High,
                r"exception|fatal",
                "an exception surfaced in job output",
            ),
            level_rule(
                "jenkins_test_failure",
                IncidentSeverity::Medium,
                r"test.*fail",
                "a test suite failed",
            ),
            level_rule(
                "jenkins_timeout",
                IncidentSeverity::Medium,
                r"timeout",
                "a job timed out",
            ),
            DetectionRule::status_range(
                "api_5xx_error",
                IncidentSeverity::Critical,
                500,
                600,
                "a request failed with a server error",
            ),
            DetectionRule::status_in(
                "api_auth_failure",
                IncidentSeverity::High,
                vec![401, 403],
                "a request was rejected for authentication/authorization",
            ),
            DetectionRule::status_range(
                "api_4xx_spike",
                IncidentSeverity::Medium,
                400,
                500,
                "a request failed with a client error",
            ),
        ]
    }

    /// Maps a batch of entries to zero or more incidents.
    ///
    /// `ids` are the storage ids minted for the batch, in insertion order.
    /// For each entry, applicable rules are evaluated in order and only the
    /// first match produces an incident.
    ///
    /// # Errors
    ///
    /// Returns a validation error if `ids` and `entries` differ in length,
    /// or a storage error if the rule lock is poisoned.
    pub fn analyze(
        &self,
        entries: &[LogEntry],
        ids: &[LogId],
        now: DateTime<Utc>,
    ) -> Result<Vec<Incident>> {
        if entries.len() != ids.len() {
            return Err(Error::validation(format!(
                "id count {} does not match entry count {}",
                ids.len(),
                entries.len()
            )));
        }

        let rules = self.rules.read().map_err(poison_err)?;
        let mut incidents = Vec::new();

        for (entry, &log_id) in entries.iter().zip(ids) {
            let Some(rule) = rules.iter().find(|rule| rule.matches(entry)) else {
                continue;
            };

            let details = Self::details_for(entry);
            let incident = Incident::new(
                rule.name.clone(),
                rule.severity,
                log_id,
                entry.kind(),
                details,
                rule.runbook.clone(),
                now,
            );

            tracing::warn!(
                incident_type = %rule.name,
                severity = %rule.severity,
                log_id = %log_id,
                message = entry.message(),
                "incident detected"
            );
            incidents.push(incident);
        }

        Ok(incidents)
    }

    /// Returns only the incidents that warrant an immediate,
    /// individually-addressed notification.
    #[must_use]
    pub fn filter_critical(incidents: &[Incident]) -> Vec<&Incident> {
        incidents
            .iter()
            .filter(|incident| incident.severity.is_immediate())
            .collect()
    }

    /// Appends a rule at runtime. Appended rules evaluate after the
    /// existing ones.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the rule lock is poisoned.
    pub fn add_rule(&self, rule: DetectionRule) -> Result<()> {
        let mut rules = self.rules.write().map_err(poison_err)?;
        tracing::info!(rule = %rule.name, "detection rule added");
        rules.push(rule);
        Ok(())
    }

    /// Returns the names of the active rules, in evaluation order.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the rule lock is poisoned.
    pub fn rule_names(&self) -> Result<Vec<String>> {
        let rules = self.rules.read().map_err(poison_err)?;
        Ok(rules.iter().map(|rule| rule.name.clone()).collect())
    }

    fn details_for(entry: &LogEntry) -> IncidentDetails {
        match entry {
            LogEntry::Jenkins {
                index_name,
                timestamp,
                level,
                message,
                job_name,
                build_number,
            } => IncidentDetails::Jenkins {
                level: level.clone(),
                message: message.clone(),
                timestamp: *timestamp,
                index_name: index_name.clone(),
                job_name: job_name.clone(),
                build_number: *build_number,
            },
            LogEntry::Api {
                index_name,
                timestamp,
                message,
                http_method,
                http_status,
            } => IncidentDetails::Api {
                http_method: http_method.clone(),
                http_status: *http_status,
                message: message.clone(),
                timestamp: *timestamp,
                index_name: index_name.clone(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids_for(entries: &[LogEntry]) -> Vec<LogId> {
        entries.iter().map(|_| LogId::generate()).collect()
    }

    #[test]
    fn build_failure_is_detected_as_high() {
        let detector = IncidentDetector::new();
        let entries = vec![LogEntry::jenkins(
            "logs-jenkins",
            Utc::now(),
            "ERROR",
            "build failed",
        )];
        let ids = ids_for(&entries);

        let incidents = detector.analyze(&entries, &ids, Utc::now()).unwrap();
        assert_eq!(incidents.len(), 1);
        assert_eq!(incidents[0].incident_type, "jenkins_build_failure");
        assert_eq!(incidents[0].severity, IncidentSeverity::High);
        assert_eq!(incidents[0].source_log_id, ids[0]);
    }

    #[test]
    fn matching_is_case_insensitive() {
        let detector = IncidentDetector::new();
        let entries = vec![LogEntry::jenkins(
            "logs-jenkins",
            Utc::now(),
            "ERROR",
            "Deploy to prod FAILED after 3 attempts",
        )];
        let ids = ids_for(&entries);

        let incidents = detector.analyze(&entries, &ids, Utc::now()).unwrap();
        assert_eq!(incidents[0].incident_type, "jenkins_deployment_failure");
        assert_eq!(incidents[0].severity, IncidentSeverity::Critical);
    }

    #[test]
    fn first_match_wins_over_later_rules() {
        // "deploy ... failed ... timeout" matches both the deployment rule
        // and the timeout rule; only the first (deployment) may fire.
        let detector = IncidentDetector::new();
        let entries = vec![LogEntry::jenkins(
            "logs-jenkins",
            Utc::now(),
            "ERROR",
            "deploy failed: timeout waiting for healthcheck",
        )];
        let ids = ids_for(&entries);

        let incidents = detector.analyze(&entries, &ids, Utc::now()).unwrap();
        assert_eq!(incidents.len(), 1);
        assert_eq!(incidents[0].incident_type, "jenkins_deployment_failure");
    }

    #[test]
    fn auth_failures_take_precedence_over_4xx() {
        let detector = IncidentDetector::new();
        let entries = vec![
            LogEntry::api("logs-api", Utc::now(), "GET /admin", "GET", 403),
            LogEntry::api("logs-api", Utc::now(), "GET /missing", "GET", 404),
            LogEntry::api("logs-api", Utc::now(), "POST /orders", "POST", 503),
        ];
        let ids = ids_for(&entries);

        let incidents = detector.analyze(&entries, &ids, Utc::now()).unwrap();
        let types: Vec<_> = incidents
            .iter()
            .map(|incident| incident.incident_type.as_str())
            .collect();
        assert_eq!(types, vec!["api_auth_failure", "api_4xx_spike", "api_5xx_error"]);
    }

    #[test]
    fn info_level_does_not_match_job_rules() {
        let detector = IncidentDetector::new();
        let entries = vec![LogEntry::jenkins(
            "logs-jenkins",
            Utc::now(),
            "INFO",
            "build failed tests will be retried",
        )];
        let ids = ids_for(&entries);

        let incidents = detector.analyze(&entries, &ids, Utc::now()).unwrap();
        assert!(incidents.is_empty());
    }

    #[test]
    fn filter_critical_keeps_critical_and_high() {
        let detector = IncidentDetector::new();
        let entries = vec![
            LogEntry::api("logs-api", Utc::now(), "POST /orders", "POST", 500),
            LogEntry::api("logs-api", Utc::now(), "GET /missing", "GET", 404),
        ];
        let ids = ids_for(&entries);
        let incidents = detector.analyze(&entries, &ids, Utc::now()).unwrap();

        let critical = IncidentDetector::filter_critical(&incidents);
        assert_eq!(critical.len(), 1);
        assert_eq!(critical[0].incident_type, "api_5xx_error");
    }

    #[test]
    fn rules_are_appendable_at_runtime() {
        let detector = IncidentDetector::new();
        let before = detector.rule_names().unwrap().len();

        detector
            .add_rule(DetectionRule::custom(
                "jenkins_disk_pressure",
                LogKind::Jenkins,
                IncidentSeverity::High,
                "the agent ran out of disk",
                |entry| entry.message().contains("no space left on device"),
            ))
            .unwrap();

        assert_eq!(detector.rule_names().unwrap().len(), before + 1);

        let entries = vec![LogEntry::jenkins(
            "logs-jenkins",
            Utc::now(),
            "WARN",
            "write error: no space left on device",
        )];
        let ids = ids_for(&entries);
        let incidents = detector.analyze(&entries, &ids, Utc::now()).unwrap();
        assert_eq!(incidents[0].incident_type, "jenkins_disk_pressure");
    }

    #[test]
    fn mismatched_id_count_is_rejected() {
        let detector = IncidentDetector::new();
        let entries = vec![LogEntry::jenkins(
            "logs-jenkins",
            Utc::now(),
            "ERROR",
            "build failed",
        )];
        let err = detector.analyze(&entries, &[], Utc::now()).unwrap_err();
        assert!(matches!(err, Error::Validation { .. }));
    }
}
