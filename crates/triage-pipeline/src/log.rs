//! Ingested log entries.
//!
//! Two kinds of logs flow through the pipeline: job-style logs from the build
//! orchestrator ("jenkins" kind) and request-style logs from HTTP services
//! ("api" kind). The scraper that produces these batches is an external
//! collaborator; this module only defines the shapes it must deliver.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The source kind of a log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogKind {
    /// Job-style logs from the build orchestrator.
    Jenkins,
    /// Request-style logs from HTTP services.
    Api,
}

impl LogKind {
    /// Returns a lowercase label suitable for routing keys and logs.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Jenkins => "jenkins",
            Self::Api => "api",
        }
    }
}

impl std::fmt::Display for LogKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single ingested log entry.
///
/// The job/build fields on the jenkins variant are optional: the scraper
/// fills them when the source index carries them, and incident resolution
/// uses them to link remediation results back to the originating incident.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LogEntry {
    /// A job-style log line.
    Jenkins {
        /// Source index the entry was scraped from.
        index_name: String,
        /// Original event timestamp.
        timestamp: DateTime<Utc>,
        /// Log level as emitted by the source (e.g. `ERROR`).
        level: String,
        /// Log message.
        message: String,
        /// Job the line belongs to, when known.
        #[serde(skip_serializing_if = "Option::is_none")]
        job_name: Option<String>,
        /// Build number the line belongs to, when known.
        #[serde(skip_serializing_if = "Option::is_none")]
        build_number: Option<u32>,
    },
    /// A request-style log line.
    Api {
        /// Source index the entry was scraped from.
        index_name: String,
        /// Original event timestamp.
        timestamp: DateTime<Utc>,
        /// Log message.
        message: String,
        /// HTTP method of the request.
        http_method: String,
        /// HTTP status code of the response.
        http_status: u16,
    },
}

impl LogEntry {
    /// Returns the kind of this entry.
    #[must_use]
    pub const fn kind(&self) -> LogKind {
        match self {
            Self::Jenkins { .. } => LogKind::Jenkins,
            Self::Api { .. } => LogKind::Api,
        }
    }

    /// Returns the original event timestamp.
    #[must_use]
    pub const fn timestamp(&self) -> DateTime<Utc> {
        match self {
            Self::Jenkins { timestamp, .. } | Self::Api { timestamp, .. } => *timestamp,
        }
    }

    /// Returns the log message.
    #[must_use]
    pub fn message(&self) -> &str {
        match self {
            Self::Jenkins { message, .. } | Self::Api { message, .. } => message,
        }
    }

    /// Creates a job-style entry without job attribution.
    #[must_use]
    pub fn jenkins(
        index_name: impl Into<String>,
        timestamp: DateTime<Utc>,
        level: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::Jenkins {
            index_name: index_name.into(),
            timestamp,
            level: level.into(),
            message: message.into(),
            job_name: None,
            build_number: None,
        }
    }

    /// Creates a request-style entry.
    #[must_use]
    pub fn api(
        index_name: impl Into<String>,
        timestamp: DateTime<Utc>,
        message: impl Into<String>,
        http_method: impl Into<String>,
        http_status: u16,
    ) -> Self {
        Self::Api {
            index_name: index_name.into(),
            timestamp,
            message: message.into(),
            http_method: http_method.into(),
            http_status,
        }
    }

    /// Attaches job attribution to a job-style entry. No-op for api entries.
    #[must_use]
    pub fn with_job(mut self, job: impl Into<String>, build: u32) -> Self {
        if let Self::Jenkins {
            job_name,
            build_number,
            ..
        } = &mut self
        {
            *job_name = Some(job.into());
            *build_number = Some(build);
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_labels() {
        assert_eq!(LogKind::Jenkins.as_str(), "jenkins");
        assert_eq!(LogKind::Api.as_str(), "api");
    }

    #[test]
    fn entry_roundtrips_through_json() {
        let entry = LogEntry::jenkins("logs-jenkins-2026.08", Utc::now(), "ERROR", "build failed")
            .with_job("nightly-build", 112);
        let json = serde_json::to_string(&entry).unwrap();
        let parsed: LogEntry = serde_json::from_str(&json).unwrap();
        assert_eq!(entry, parsed);
    }

    #[test]
    fn with_job_ignores_api_entries() {
        let entry = LogEntry::api("logs-api", Utc::now(), "GET /health", "GET", 200);
        let entry = entry.with_job("nightly-build", 1);
        assert_eq!(entry.kind(), LogKind::Api);
    }
}
