//! Shared error definitions for triage components.

/// The result type used throughout triage-core.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised by core primitives.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// An identifier could not be parsed.
    #[error("invalid identifier: {message}")]
    InvalidId {
        /// Description of the parse failure.
        message: String,
    },

    /// A configuration value is missing or malformed.
    #[error("configuration error: {message}")]
    Configuration {
        /// Description of the configuration problem.
        message: String,
    },
}

impl Error {
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

    #[test]
    fn invalid_id_display() {
        let err = Error::InvalidId {
            message: "not a ULID".into(),
        };
        assert!(err.to_string().contains("invalid identifier"));
    }

    #[test]
    fn configuration_display() {
        let err = Error::configuration("missing base url");
        assert!(err.to_string().contains("missing base url"));
    }
}
