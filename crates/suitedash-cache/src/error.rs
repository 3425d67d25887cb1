//! Error types for the caching layer.
//!
//! Store failures never reach callers of the cache: the store client logs
//! them and degrades to a miss or a no-op. They are typed here so the
//! logging and metrics sites can tell the failure kinds apart.

/// Failures talking to the backing key-value store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// No pooled connection could be obtained.
    #[error("connection pool error: {0}")]
    Pool(#[from] deadpool_redis::PoolError),

    /// The store rejected or failed a command.
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// The operation exceeded the configured store timeout.
    #[error("store operation '{op}' timed out after {timeout_ms} ms")]
    Timeout {
        /// Name of the store operation that timed out.
        op: &'static str,
        /// Configured timeout in milliseconds.
        timeout_ms: u64,
    },

    /// A value could not be serialized for storage.
    #[error("failed to encode value: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    /// A stored value could not be deserialized into the requested type.
    #[error("failed to decode value: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    /// The blocking connection could not be opened.
    #[error("connect error: {message}")]
    Connect {
        /// Description of the connection failure.
        message: String,
    },
}

impl StoreError {
    /// Creates a new `Connect` error.
    #[must_use]
    pub fn connect(message: impl Into<String>) -> Self {
        Self::Connect {
            message: message.into(),
        }
    }

    /// Short, low-cardinality label used for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            StoreError::Pool(_) => "pool",
            StoreError::Redis(_) => "redis",
            StoreError::Timeout { .. } => "timeout",
            StoreError::Encode(_) => "encode",
            StoreError::Decode(_) => "decode",
            StoreError::Connect { .. } => "connect",
        }
    }
}

/// Errors raised while loading or validating cache configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The layered configuration could not be assembled.
    #[error("config build error: {0}")]
    Build(#[source] config::ConfigError),

    /// The merged configuration did not match the settings schema.
    #[error("config deserialize error: {0}")]
    Deserialize(#[source] config::ConfigError),

    /// A setting has a value outside its allowed range.
    #[error("invalid setting: {0}")]
    Invalid(String),
}

pub type StoreResult<T> = Result<T, StoreError>;
