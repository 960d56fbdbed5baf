use thiserror::Error;

/// Result type for hdqn operations
pub type Result<T> = std::result::Result<T, HrlError>;

/// Main error type for the hierarchical agent
#[derive(Debug, Clone, Error)]
pub enum HrlError {
    /// Invalid dimensions for operations
    #[error("Dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch {
        expected: String,
        actual: String,
    },

    /// Invalid parameter value
    #[error("Invalid parameter '{name}': {reason}")]
    InvalidParameter {
        name: String,
        reason: String,
    },

    /// An operation that needs `compile()` was called on an uncompiled agent
    #[error("Agent not compiled: {0}")]
    NotCompiled(String),

    /// `forward`/`backward` were called out of order
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    /// Invalid action
    #[error("Invalid action {action}: must be less than {max_actions}")]
    InvalidAction {
        action: usize,
        max_actions: usize,
    },

    /// IO errors (file operations)
    #[error("IO error: {0}")]
    Io(String),

    /// Serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Malformed configuration
    #[error("Config error: {0}")]
    Config(String),

    /// Failure reported by the environment
    #[error("Environment error: {0}")]
    Environment(String),

    /// Training error
    #[error("Training error: {0}")]
    Training(String),
}

impl From<std::io::Error> for HrlError {
    fn from(err: std::io::Error) -> Self {
        HrlError::Io(err.to_string())
    }
}

impl From<bincode::Error> for HrlError {
    fn from(err: bincode::Error) -> Self {
        HrlError::Serialization(err.to_string())
    }
}

impl From<serde_json::Error> for HrlError {
    fn from(err: serde_json::Error) -> Self {
        HrlError::Config(err.to_string())
    }
}

// Helper functions for common error patterns
impl HrlError {
    pub fn dimension_mismatch<S: Into<String>>(expected: S, actual: S) -> Self {
        HrlError::DimensionMismatch {
            expected: expected.into(),
            actual: actual.into(),
        }
    }

    pub fn invalid_parameter<S: Into<String>>(name: S, reason: S) -> Self {
        HrlError::InvalidParameter {
            name: name.into(),
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_messages() {
        let err = HrlError::dimension_mismatch("32 experiences", "7 experiences");
        assert_eq!(err.to_string(), "Dimension mismatch: expected 32 experiences, got 7 experiences");

        let err = HrlError::invalid_parameter("target_model_update", "must be >= 0");
        assert_eq!(err.to_string(), "Invalid parameter 'target_model_update': must be >= 0");
    }

    #[test]
    fn test_io_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let err: HrlError = io.into();
        assert!(matches!(err, HrlError::Io(_)));
    }
}
