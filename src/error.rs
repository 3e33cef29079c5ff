//! Error types for the limiter, its configuration, and stored-state decoding.
use std::time::Duration;
use thiserror::Error;

/// Failure of a facade operation against the shared store.
///
/// Every variant means "the decision could not be computed"; callers that need a
/// decision anyway go through `RateLimiter::admit`, which applies the configured
/// `FailurePolicy`.
#[derive(Debug, Error)]
pub enum LimiterError<E> {
    /// The backing store returned an error (connection refused, I/O, protocol).
    #[error("store unavailable: {0}")]
    StoreUnavailable(#[source] E),
    /// The store did not answer within the configured deadline.
    #[error("store call timed out after {elapsed:?} (limit: {timeout:?})")]
    Timeout {
        elapsed: Duration,
        timeout: Duration,
    },
    /// Every optimistic update attempt lost a race with another writer.
    #[error("bucket update gave up after {attempts} conflicting attempts")]
    Contention { attempts: usize },
}

impl<E> LimiterError<E> {
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    pub fn is_contention(&self) -> bool {
        matches!(self, Self::Contention { .. })
    }

    /// Short label for logs and telemetry.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::StoreUnavailable(_) => "store_unavailable",
            Self::Timeout { .. } => "timeout",
            Self::Contention { .. } => "contention",
        }
    }

    pub fn into_store_error(self) -> Option<E> {
        match self {
            Self::StoreUnavailable(e) => Some(e),
            _ => None,
        }
    }
}

/// Invalid limiter configuration.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("capacity must be greater than zero")]
    ZeroCapacity,
    #[error("refill rate must be finite and > 0 (got {0})")]
    InvalidRefillRate(f64),
    #[error("store timeout must be non-zero")]
    ZeroStoreTimeout,
    #[error("entry ttl must be at least one millisecond")]
    ZeroEntryTtl,
    #[error("contention retry needs at least one attempt")]
    ZeroAttempts,
    #[error("key prefix must be non-empty and free of whitespace")]
    InvalidKeyPrefix,
    #[error("failure policy must be chosen explicitly (fail-open or fail-closed)")]
    MissingFailurePolicy,
}

/// A stored sub-key that does not parse as the expected integer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("corrupted value {value:?} under {key}")]
pub struct CorruptedState {
    pub key: String,
    pub value: String,
}
