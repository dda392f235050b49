//! Error types for linkcache

use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the cache tier
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Store Errors
    // =========================================================================
    /// Volatile store could not be reached or rejected the command
    #[error("Volatile store unavailable: {0}")]
    StoreUnavailable(String),

    /// Durable record store failure
    #[error("Record store error: {0}")]
    Durable(String),

    /// Record does not exist in the durable store
    #[error("Record not found: {0}")]
    RecordNotFound(String),

    // =========================================================================
    // Codec Errors
    // =========================================================================
    /// Cached payload could not be decoded into the requested shape
    #[error("Failed to decode cached payload: {0}")]
    Decode(String),

    /// Payload could not be serialized for the cache
    #[error("Failed to encode payload: {0}")]
    Encode(#[from] serde_json::Error),

    // =========================================================================
    // Configuration Errors
    // =========================================================================
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Duration parse error
    #[error("Failed to parse duration: {0}")]
    DurationParse(String),

    /// YAML configuration parse error
    #[error("Failed to parse configuration file: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// True for failures of the volatile store, which callers absorb as a miss.
    pub fn is_store_unavailable(&self) -> bool {
        matches!(self, Error::StoreUnavailable(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_unavailable_classification() {
        assert!(Error::StoreUnavailable("connection refused".into()).is_store_unavailable());
        assert!(!Error::Durable("deadlock".into()).is_store_unavailable());
    }

    #[test]
    fn test_error_display() {
        let err = Error::RecordNotFound("abc123".into());
        assert_eq!(err.to_string(), "Record not found: abc123");
    }
}
