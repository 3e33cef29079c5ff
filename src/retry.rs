//! Bounded retry for optimistic bucket updates.
//!
//! Only compare-and-swap conflicts are retried: a conflict proves our write was
//! not applied, so replaying the read-compute-write cycle cannot double-count.
//! Store failures and timeouts are never retried here.
//!
//! Delays grow exponentially from `base_delay`, are capped at `max_delay`, and get
//! full jitter (uniform in `[0, delay]`).

use crate::error::ConfigError;
use rand::{rng, Rng};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Abstraction for sleeping between attempts
pub trait Sleeper: Send + Sync + std::fmt::Debug {
    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send>>;
}

/// Production sleeper using the tokio timer.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioSleeper;

impl Sleeper for TokioSleeper {
    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        Box::pin(tokio::time::sleep(duration))
    }
}

/// Records requested delays and returns immediately.
#[derive(Debug, Clone, Default)]
pub struct TrackingSleeper {
    calls: Arc<Mutex<Vec<Duration>>>,
}

impl TrackingSleeper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<Duration> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }
}

impl Sleeper for TrackingSleeper {
    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(duration);
        }
        Box::pin(async {})
    }
}

/// Retry budget for compare-and-swap conflicts.
#[derive(Clone)]
pub struct ContentionRetry {
    max_attempts: usize,
    base_delay: Duration,
    max_delay: Duration,
    jitter: bool,
    sleeper: Arc<dyn Sleeper>,
}

impl std::fmt::Debug for ContentionRetry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContentionRetry")
            .field("max_attempts", &self.max_attempts)
            .field("base_delay", &self.base_delay)
            .field("max_delay", &self.max_delay)
            .field("jitter", &self.jitter)
            .field("sleeper", &self.sleeper)
            .finish()
    }
}

impl Default for ContentionRetry {
    /// 5 attempts, 2ms doubling to at most 50ms, full jitter.
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(2),
            max_delay: Duration::from_millis(50),
            jitter: true,
            sleeper: Arc::new(TokioSleeper),
        }
    }
}

impl ContentionRetry {
    /// Total attempts including the first. Must be > 0.
    pub fn new(max_attempts: usize) -> Result<Self, ConfigError> {
        if max_attempts == 0 {
            return Err(ConfigError::ZeroAttempts);
        }
        Ok(Self {
            max_attempts,
            ..Self::default()
        })
    }

    /// Exponential delay bounds. `max` below `base` is raised to `base`.
    pub fn with_delays(mut self, base: Duration, max: Duration) -> Self {
        self.base_delay = base;
        self.max_delay = max.max(base);
        self
    }

    pub fn without_jitter(mut self) -> Self {
        self.jitter = false;
        self
    }

    pub fn with_sleeper<S: Sleeper + 'static>(mut self, sleeper: S) -> Self {
        self.sleeper = Arc::new(sleeper);
        self
    }

    pub fn max_attempts(&self) -> usize {
        self.max_attempts
    }

    /// Un-jittered delay before retry number `retry` (1-based).
    pub fn delay(&self, retry: usize) -> Duration {
        let exponent = retry.saturating_sub(1).min(31) as u32;
        let nanos = self.base_delay.as_nanos().saturating_mul(1u128 << exponent);
        let capped = nanos.min(self.max_delay.as_nanos());
        Duration::from_nanos(u64::try_from(capped).unwrap_or(u64::MAX))
    }

    /// Sleep before retry number `retry`.
    pub async fn pause(&self, retry: usize) {
        let mut delay = self.delay(retry);
        if self.jitter {
            let millis = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
            delay = Duration::from_millis(rng().random_range(0..=millis));
        }
        self.sleeper.sleep(delay).await;
    }
}
