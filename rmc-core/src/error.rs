//! Error types for rmc-core.

use thiserror::Error;

/// Result type alias using rmc-core's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur during relational memory operations.
///
/// Degree-cap breaches and duplicate relations are not represented here: the
/// datastore resolves them by eviction and upsert. An unresolved conflict is a
/// persisted state, not an error.
#[derive(Error, Debug)]
pub enum Error {
    /// Embedding or model service could not be reached or returned garbage
    #[error("{capability} unavailable: {message}")]
    ExternalCapabilityUnavailable { capability: String, message: String },

    /// Entry rejected at write time
    #[error("Malformed input: {0}")]
    MalformedInput(String),

    /// Referenced record does not exist
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    /// Optimistic concurrency check failed
    #[error("Version conflict on {id}: expected version {expected}")]
    VersionConflict { id: String, expected: i64 },

    /// State machine transition not allowed (e.g. resolving an ignored conflict)
    #[error("Invalid transition: {0}")]
    InvalidTransition(String),

    /// Memory storage error
    #[error("Memory storage error: {0}")]
    MemoryStorage(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Timeout during operation
    #[error("Operation timed out after {duration_ms}ms")]
    Timeout { duration_ms: u64 },

    /// Batch interrupted by its cancellation token
    #[error("Operation cancelled")]
    Cancelled,

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create an external capability error.
    pub fn unavailable(capability: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ExternalCapabilityUnavailable {
            capability: capability.into(),
            message: message.into(),
        }
    }

    /// Create a malformed input error.
    pub fn malformed(message: impl Into<String>) -> Self {
        Self::MalformedInput(message.into())
    }

    /// Create a not-found error.
    pub fn not_found(kind: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            kind,
            id: id.to_string(),
        }
    }

    /// Create a version conflict error.
    pub fn version_conflict(id: impl ToString, expected: i64) -> Self {
        Self::VersionConflict {
            id: id.to_string(),
            expected,
        }
    }

    /// Create a timeout error.
    pub fn timeout(duration_ms: u64) -> Self {
        Self::Timeout { duration_ms }
    }

    /// Whether a background job hitting this error should be retried.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::ExternalCapabilityUnavailable { .. }
                | Self::Timeout { .. }
                | Self::VersionConflict { .. }
                | Self::MemoryStorage(_)
        )
    }
}

impl From<rusqlite::Error> for Error {
    fn from(e: rusqlite::Error) -> Self {
        Self::MemoryStorage(e.to_string())
    }
}
