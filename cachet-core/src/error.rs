//! Error types for cachet operations

use thiserror::Error;

/// Malformed query keys.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum KeyError {
    #[error("Invalid key segment at index {index}: {reason}")]
    InvalidSegment { index: usize, reason: String },

    #[error("Query key must be an array of segments")]
    NotAnArray,
}

/// Failures while producing a value for a cache entry.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FetchError {
    #[error("Fetch for {key} failed after {attempts} attempt(s): {reason}")]
    Failed {
        key: String,
        reason: String,
        attempts: u32,
    },

    #[error("Fetch for {key} was cancelled")]
    Cancelled { key: String },

    #[error("Query {key} is disabled and has no cached data")]
    Disabled { key: String },

    #[error("Cached data for {key} could not be decoded: {reason}")]
    Decode { key: String, reason: String },

    #[error("Page param {param} for {key} is neither loaded nor next in the cursor chain")]
    PageOutOfChain { key: String, param: String },
}

impl FetchError {
    /// Canonical key of the entry the error belongs to.
    pub fn key(&self) -> &str {
        match self {
            Self::Failed { key, .. }
            | Self::Cancelled { key }
            | Self::Disabled { key }
            | Self::Decode { key, .. }
            | Self::PageOutOfChain { key, .. } => key,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }
}

/// Failures of side-effecting operations.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MutationError {
    #[error("Mutation failed: {reason}")]
    Failed { reason: String },

    #[error("Optimistic edit for {key} could not be applied: {reason}")]
    Decode { key: String, reason: String },
}

/// Configuration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {reason}")]
    Io { path: String, reason: String },

    #[error("Failed to parse config TOML: {reason}")]
    Parse { reason: String },

    #[error("Invalid config value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },
}

/// Master error type for all cachet errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CachetError {
    #[error("Key error: {0}")]
    Key(#[from] KeyError),

    #[error("Fetch error: {0}")]
    Fetch(#[from] FetchError),

    #[error("Mutation error: {0}")]
    Mutation(#[from] MutationError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
}

/// Result type alias for cachet operations.
pub type CachetResult<T> = Result<T, CachetError>;

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fetch_error_display_failed() {
        let err = FetchError::Failed {
            key: r#"["posts"]"#.to_string(),
            reason: "connection reset".to_string(),
            attempts: 3,
        };
        let msg = format!("{}", err);
        assert!(msg.contains("3 attempt(s)"));
        assert!(msg.contains("connection reset"));
        assert_eq!(err.key(), r#"["posts"]"#);
    }

    #[test]
    fn test_cancelled_is_flagged() {
        let err = FetchError::Cancelled {
            key: "[]".to_string(),
        };
        assert!(err.is_cancelled());
        assert!(!FetchError::Disabled { key: "[]".to_string() }.is_cancelled());
    }

    #[test]
    fn test_page_out_of_chain_names_the_param() {
        let err = FetchError::PageOutOfChain {
            key: r#"["posts"]"#.to_string(),
            param: "5".to_string(),
        };
        assert!(err.to_string().contains("Page param 5"));
        assert_eq!(err.key(), r#"["posts"]"#);
    }

    #[test]
    fn test_master_error_wraps_sources() {
        let err: CachetError = KeyError::NotAnArray.into();
        assert!(matches!(err, CachetError::Key(KeyError::NotAnArray)));
        assert!(format!("{}", err).starts_with("Key error"));

        let err: CachetError = MutationError::Failed {
            reason: "500".to_string(),
        }
        .into();
        assert!(format!("{}", err).contains("Mutation failed: 500"));
    }
}
