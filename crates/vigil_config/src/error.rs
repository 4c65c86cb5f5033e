//! Errors raised while loading `vigil.toml`.

use std::path::PathBuf;

/// Why a harness configuration could not be used.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The file exists but could not be read.
    #[error("cannot read {}: {source}", path.display())]
    Read {
        /// The file that was being read.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The content is not valid TOML for a harness configuration.
    #[error("invalid configuration: {0}")]
    Parse(String),

    /// A field that needs a value was left empty.
    #[error("{field} must not be empty")]
    EmptyField {
        /// Dotted name of the field, e.g. `link.bind`.
        field: &'static str,
    },

    /// A field holds a value the harness cannot use.
    #[error("{field}: {reason}")]
    InvalidValue {
        /// Dotted name of the field.
        field: &'static str,
        /// What is wrong with it.
        reason: String,
    },
}

impl ConfigError {
    pub(crate) fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        ConfigError::InvalidValue {
            field,
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_field_names_the_field() {
        let err = ConfigError::EmptyField { field: "link.bind" };
        assert_eq!(err.to_string(), "link.bind must not be empty");
    }

    #[test]
    fn invalid_value_names_field_and_reason() {
        let err = ConfigError::invalid("session.max_sessions", "must be at least 1");
        assert_eq!(err.to_string(), "session.max_sessions: must be at least 1");
    }

    #[test]
    fn read_error_names_the_file() {
        let err = ConfigError::Read {
            path: PathBuf::from("/etc/vigil.toml"),
            source: std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
        };
        let text = err.to_string();
        assert!(text.starts_with("cannot read /etc/vigil.toml"));
        assert!(std::error::Error::source(&err).is_some());
    }
}
