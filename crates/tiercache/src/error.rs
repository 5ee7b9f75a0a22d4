//! Error types for the cache.
//!
//! Backend I/O errors are wrapped as-is. Contention and tombstoned dependency
//! keys are distinguished variants because callers branch on them.

/// Errors that can occur during cache operations.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    /// The Redis server or connection returned an error.
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// A pooled connection could not be obtained or a pool could not be built.
    #[error("Redis pool error: {0}")]
    Pool(String),

    /// A value or message could not be (de)serialized.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The caller passed arguments the operation can't work with.
    #[error("Invalid argument: {message}")]
    InvalidArgument {
        /// Description of what was wrong.
        message: String,
    },

    /// A key was outside of the provider's key space.
    #[error("Key {key} does not have prefix {prefix}")]
    KeyPrefix { key: String, prefix: String },

    /// An optimistic transaction kept conflicting until the retry budget ran out.
    #[error("{operation} reached maximum number of retries")]
    RetriesExhausted {
        /// Name of the provider operation.
        operation: &'static str,
    },

    /// The dependency key was replaced by a tombstone and is closed for writes.
    #[error("Can't add dependency: key is tombstoned")]
    TombstonedDependency,

    /// A lock could not be taken. The caller should retry the whole operation.
    #[error("Failed to get a cache lock due to contention. Please retry the call")]
    LockContention,

    /// The lock type is not valid for the requested lock.
    #[error("Unexpected lock type {lock_type} for collection lock")]
    InvalidLockType { lock_type: String },

    /// The provider does not implement the operation.
    #[error("{operation} is not supported by cache {cache}")]
    Unsupported {
        operation: &'static str,
        cache: String,
    },

    /// Configuration could not be loaded or failed validation.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Pub/sub transport failure.
    #[error("Communication error: {0}")]
    Comms(String),

    /// The operation was cancelled by the caller.
    #[error("Operation cancelled")]
    Cancelled,

    /// An item failed validation.
    #[error("Validation error: {0}")]
    Validation(String),
}

impl CacheError {
    /// Creates a new `InvalidArgument` error.
    #[must_use]
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }

    /// Creates a new `KeyPrefix` error.
    #[must_use]
    pub fn key_prefix(key: impl Into<String>, prefix: impl Into<String>) -> Self {
        Self::KeyPrefix {
            key: key.into(),
            prefix: prefix.into(),
        }
    }

    /// Creates a new `RetriesExhausted` error.
    #[must_use]
    pub fn retries_exhausted(operation: &'static str) -> Self {
        Self::RetriesExhausted { operation }
    }

    /// Creates a new `Unsupported` error.
    #[must_use]
    pub fn unsupported(operation: &'static str, cache: impl Into<String>) -> Self {
        Self::Unsupported {
            operation,
            cache: cache.into(),
        }
    }

    /// Creates a new `Pool` error.
    #[must_use]
    pub fn pool(message: impl ToString) -> Self {
        Self::Pool(message.to_string())
    }

    /// Creates a new `Comms` error.
    #[must_use]
    pub fn comms(message: impl ToString) -> Self {
        Self::Comms(message.to_string())
    }

    /// Returns `true` if the caller should retry the whole higher-level call.
    ///
    /// Maps to an HTTP 409 at the API boundary.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::LockContention | Self::RetriesExhausted { .. }
        )
    }

    /// Returns `true` if a dependency key was closed by a tombstone.
    #[must_use]
    pub fn is_tombstoned_dependency(&self) -> bool {
        matches!(self, Self::TombstonedDependency)
    }
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, CacheError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_errors() {
        assert!(CacheError::LockContention.is_retryable());
        assert!(CacheError::retries_exhausted("SetValue").is_retryable());
        assert!(!CacheError::TombstonedDependency.is_retryable());
        assert!(!CacheError::invalid_argument("x").is_retryable());
    }

    #[test]
    fn test_error_messages() {
        assert_eq!(
            CacheError::retries_exhausted("WriteSentinel").to_string(),
            "WriteSentinel reached maximum number of retries"
        );
        assert_eq!(
            CacheError::key_prefix("foo", "bar").to_string(),
            "Key foo does not have prefix bar"
        );
        assert_eq!(
            CacheError::TombstonedDependency.to_string(),
            "Can't add dependency: key is tombstoned"
        );
    }
}
