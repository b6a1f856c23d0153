//! Error types for the coordination layer.
//!
//! Quota denial, cache misses and lock contention are ordinary outcomes and
//! are modelled as return values. Only failures of the shared store itself
//! (or invalid arguments) surface as [`CoordinationError`].

/// Errors raised while talking to the coordination store.
#[derive(Debug, thiserror::Error)]
pub enum CoordinationError {
    /// No connection could be checked out of the Redis pool.
    #[error("Redis pool error: {0}")]
    Pool(#[from] deadpool_redis::PoolError),

    /// The pool could not be created from the configured URL.
    #[error("Redis pool creation failed: {0}")]
    CreatePool(#[from] deadpool_redis::CreatePoolError),

    /// A Redis command or script failed.
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// A Redis reply did not have the expected shape.
    #[error("Unexpected store reply: {0}")]
    UnexpectedReply(String),

    /// A cached payload could not be encoded or decoded.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// The caller passed a value the store cannot honour.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
}

impl CoordinationError {
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument(message.into())
    }

    /// Whether this error means the store is unreachable or misbehaving,
    /// as opposed to a caller mistake.
    pub fn is_store_failure(&self) -> bool {
        !matches!(self, Self::InvalidArgument(_))
    }
}

impl From<rmp_serde::encode::Error> for CoordinationError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for CoordinationError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, CoordinationError>;
