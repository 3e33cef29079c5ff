//! Limiter configuration.
//!
//! Configuration is fixed once a [`RateLimiter`](crate::RateLimiter) is built. The
//! failure policy has no default: `build()` refuses to produce a config until
//! fail-open or fail-closed has been chosen.
//!
//! ```rust
//! use bucketgate::{FailurePolicy, LimiterConfig};
//! use std::time::Duration;
//!
//! let config = LimiterConfig::builder()
//!     .capacity(20)
//!     .refill_rate_per_second(2.5)
//!     .entry_ttl(Duration::from_secs(3600))
//!     .failure_policy(FailurePolicy::FailClosed)
//!     .build()
//!     .unwrap();
//! assert_eq!(config.capacity(), 20);
//! ```

use crate::engine::{RefillRate, TokenBucket};
use crate::error::ConfigError;
use crate::store::DEFAULT_KEY_PREFIX;
use std::fmt;
use std::time::Duration;

pub const DEFAULT_CAPACITY: u64 = 10;
pub const DEFAULT_REFILL_RATE_PER_SECOND: f64 = 5.0;
pub const DEFAULT_STORE_TIMEOUT: Duration = Duration::from_millis(2_000);

/// What to decide when the store cannot produce a decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailurePolicy {
    /// Admit the request; a store outage must not take the whole tier down.
    FailOpen,
    /// Reject the request; for deployments where over-admission is the bigger risk.
    FailClosed,
}

impl FailurePolicy {
    pub fn admits(&self) -> bool {
        matches!(self, FailurePolicy::FailOpen)
    }
}

impl fmt::Display for FailurePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailurePolicy::FailOpen => write!(f, "fail-open"),
            FailurePolicy::FailClosed => write!(f, "fail-closed"),
        }
    }
}

impl std::str::FromStr for FailurePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "fail-open" | "open" => Ok(FailurePolicy::FailOpen),
            "fail-closed" | "closed" => Ok(FailurePolicy::FailClosed),
            other => Err(format!("unknown failure policy: {other}")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LimiterConfig {
    engine: TokenBucket,
    entry_ttl: Option<Duration>,
    store_timeout: Duration,
    key_prefix: String,
    failure_policy: FailurePolicy,
}

impl LimiterConfig {
    pub fn builder() -> LimiterConfigBuilder {
        LimiterConfigBuilder::new()
    }

    pub fn capacity(&self) -> u64 {
        self.engine.capacity()
    }

    pub fn refill_rate(&self) -> RefillRate {
        self.engine.rate()
    }

    pub fn engine(&self) -> &TokenBucket {
        &self.engine
    }

    pub fn entry_ttl(&self) -> Option<Duration> {
        self.entry_ttl
    }

    pub fn store_timeout(&self) -> Duration {
        self.store_timeout
    }

    pub fn key_prefix(&self) -> &str {
        &self.key_prefix
    }

    pub fn failure_policy(&self) -> FailurePolicy {
        self.failure_policy
    }
}

/// Builder for [`LimiterConfig`]. Everything except the failure policy has a default.
#[derive(Debug, Clone)]
pub struct LimiterConfigBuilder {
    capacity: u64,
    refill_rate_per_second: f64,
    entry_ttl: Option<Duration>,
    store_timeout: Duration,
    key_prefix: String,
    failure_policy: Option<FailurePolicy>,
}

impl Default for LimiterConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl LimiterConfigBuilder {
    pub fn new() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
            refill_rate_per_second: DEFAULT_REFILL_RATE_PER_SECOND,
            entry_ttl: None,
            store_timeout: DEFAULT_STORE_TIMEOUT,
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            failure_policy: None,
        }
    }

    pub fn capacity(mut self, capacity: u64) -> Self {
        self.capacity = capacity;
        self
    }

    pub fn refill_rate_per_second(mut self, rate: f64) -> Self {
        self.refill_rate_per_second = rate;
        self
    }

    /// Idle buckets are evicted by the store after `ttl` without access.
    pub fn entry_ttl(mut self, ttl: Duration) -> Self {
        self.entry_ttl = Some(ttl);
        self
    }

    pub fn store_timeout(mut self, timeout: Duration) -> Self {
        self.store_timeout = timeout;
        self
    }

    pub fn key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    pub fn failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.failure_policy = Some(policy);
        self
    }

    pub fn build(self) -> Result<LimiterConfig, ConfigError> {
        if self.capacity == 0 {
            return Err(ConfigError::ZeroCapacity);
        }
        let rate = RefillRate::new(self.refill_rate_per_second)?;
        if self.store_timeout.is_zero() {
            return Err(ConfigError::ZeroStoreTimeout);
        }
        if self.entry_ttl.is_some_and(|t| t.as_millis() == 0) {
            return Err(ConfigError::ZeroEntryTtl);
        }
        if self.key_prefix.is_empty() || self.key_prefix.chars().any(char::is_whitespace) {
            return Err(ConfigError::InvalidKeyPrefix);
        }
        let Some(failure_policy) = self.failure_policy else {
            return Err(ConfigError::MissingFailurePolicy);
        };
        Ok(LimiterConfig {
            engine: TokenBucket::new(self.capacity, rate),
            entry_ttl: self.entry_ttl,
            store_timeout: self.store_timeout,
            key_prefix: self.key_prefix,
            failure_policy,
        })
    }
}
