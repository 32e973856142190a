//! Error types for the pipeline domain.

use triage_core::{ActionId, EventId, IncidentId};

/// The result type used throughout triage-pipeline.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in pipeline operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// An input batch or request failed validation before any store work.
    #[error("validation error: {message}")]
    Validation {
        /// Description of the rejected input.
        message: String,
    },

    /// An invalid state transition was attempted.
    #[error("invalid state transition: {from} -> {to} ({reason})")]
    InvalidStateTransition {
        /// The current state.
        from: String,
        /// The attempted target state.
        to: String,
        /// The reason the transition is invalid.
        reason: String,
    },

    /// An incident was not found.
    #[error("incident not found: {incident_id}")]
    IncidentNotFound {
        /// The incident ID that was not found.
        incident_id: IncidentId,
    },

    /// An action request was not found.
    #[error("action not found: {action_id}")]
    ActionNotFound {
        /// The action ID that was not found.
        action_id: ActionId,
    },

    /// An outbox event was not found.
    #[error("outbox event not found: {event_id}")]
    EventNotFound {
        /// The event ID that was not found.
        event_id: EventId,
    },

    /// A storage operation failed.
    #[error("storage error: {message}")]
    Storage {
        /// Description of the storage failure.
        message: String,
        /// The underlying cause, if any.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// A serialization error occurred.
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of the serialization failure.
        message: String,
    },

    /// Publishing an event to the sink failed.
    #[error("publish error: {message}")]
    Publish {
        /// Description of the publish failure.
        message: String,
    },

    /// A remote control-plane call failed.
    #[error("control plane error: {message}")]
    ControlPlane {
        /// Description of the remote failure.
        message: String,
    },

    /// A configuration value is missing or malformed.
    #[error("configuration error: {message}")]
    Configuration {
        /// Description of the configuration problem.
        message: String,
    },

    /// An error from triage-core.
    #[error("core error: {0}")]
    Core(#[from] triage_core::Error),
}

impl Error {
    /// Creates a new validation error.
    #[must_use]
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    /// Creates a new storage error.
    #[must_use]
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
            source: None,
        }
    }

    /// Creates a new storage error with a source.
    #[must_use]
    pub fn storage_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Storage {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Creates a new serialization error.
    #[must_use]
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization {
            message: message.into(),
        }
    }

    /// Creates a new publish error.
    #[must_use]
    pub fn publish(message: impl Into<String>) -> Self {
        Self::Publish {
            message: message.into(),
        }
    }

    /// Creates a new control-plane error.
    #[must_use]
    pub fn control_plane(message: impl Into<String>) -> Self {
        Self::ControlPlane {
            message: message.into(),
        }
    }

    /// Creates a new configuration error.
    #[must_use]
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as StdError;

    #[test]
    fn validation_error_display() {
        let err = Error::validation("log batch is empty");
        assert!(err.to_string().contains("validation error"));
        assert!(err.to_string().contains("log batch is empty"));
    }

    #[test]
    fn state_transition_error_display() {
        let err = Error::InvalidStateTransition {
            from: "resolved".into(),
            to: "detected".into(),
            reason: "incident status never regresses".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("resolved"));
        assert!(msg.contains("detected"));
        assert!(msg.contains("never regresses"));
    }

    #[test]
    fn action_not_found_display() {
        let err = Error::ActionNotFound {
            action_id: ActionId::generate(),
        };
        assert!(err.to_string().contains("action not found"));
    }

    #[test]
    fn storage_error_with_source() {
        let source = std::io::Error::new(std::io::ErrorKind::NotFound, "row vanished");
        let err = Error::storage_with_source("failed to load event", source);
        assert!(err.to_string().contains("storage error"));
        assert!(StdError::source(&err).is_some());
    }
}
