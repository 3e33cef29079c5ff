//! Token bucket engine.
//!
//! Pure arithmetic: `(prior state, now, capacity, rate) -> (next state, decision)`.
//! Nothing in here touches a store or reads a clock, which is what lets the
//! store adapters replay it inside a compare-and-swap loop.
//!
//! Refill semantics:
//! - A missing bucket is a full bucket observed at `now`.
//! - Elapsed time is `max(0, now - last_refill)`; a clock that steps backwards
//!   grants nothing and leaves `last_refill` untouched.
//! - Only whole tokens are added. `last_refill` advances by the time those whole
//!   tokens cost, so sub-token progress carries over to the next call.
//! - The token count is clamped to `capacity`; the clamp never moves `last_refill`.
//!
//! ```rust
//! use bucketgate::engine::{RefillRate, TokenBucket};
//!
//! let bucket = TokenBucket::new(1, RefillRate::new(1.0).unwrap());
//! let first = bucket.consume(None, 0);
//! assert!(first.admitted);
//! let second = bucket.consume(Some(first.state), 500);
//! assert!(!second.admitted); // half a token floors to zero
//! ```

use crate::error::ConfigError;
use std::time::Duration;

/// Tokens restored per second. Finite and strictly positive; may be fractional.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RefillRate(f64);

impl RefillRate {
    pub fn new(per_second: f64) -> Result<Self, ConfigError> {
        if per_second.is_finite() && per_second > 0.0 {
            Ok(Self(per_second))
        } else {
            Err(ConfigError::InvalidRefillRate(per_second))
        }
    }

    pub fn per_second(&self) -> f64 {
        self.0
    }

    /// Whole tokens earned over `elapsed_ms`.
    fn tokens_in(&self, elapsed_ms: u64) -> u64 {
        // `as` saturates for out-of-range floats.
        (elapsed_ms as f64 * self.0 / 1000.0).floor() as u64
    }

    /// Milliseconds needed to earn `tokens` whole tokens, rounded up so a repeated
    /// refill at the same instant can never mint an extra token.
    fn millis_for(&self, tokens: u64) -> u64 {
        (tokens as f64 * 1000.0 / self.0).ceil() as u64
    }
}

/// Persisted per-client bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BucketState {
    pub tokens: u64,
    pub last_refill_ms: u64,
}

/// Result of applying refill without consumption.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Refill {
    pub state: BucketState,
    /// Whole tokens credited by this refill, after the capacity cap.
    pub added: u64,
    /// How far `now` lagged the stored timestamp; zero when time moved forward.
    pub clock_regressed_by_ms: u64,
}

/// Result of a refill followed by an attempt to take one token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Outcome {
    pub state: BucketState,
    pub admitted: bool,
    pub clock_regressed_by_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TokenBucket {
    capacity: u64,
    rate: RefillRate,
}

impl TokenBucket {
    /// Build an engine. A zero `capacity` is rejected by `LimiterConfig`; here it
    /// simply yields a bucket that never admits.
    pub fn new(capacity: u64, rate: RefillRate) -> Self {
        Self { capacity, rate }
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn rate(&self) -> RefillRate {
        self.rate
    }

    /// The state a never-seen client starts from.
    pub fn fresh(&self, now_ms: u64) -> BucketState {
        BucketState {
            tokens: self.capacity,
            last_refill_ms: now_ms,
        }
    }

    pub fn refill(&self, prior: Option<BucketState>, now_ms: u64) -> Refill {
        let prior = prior.unwrap_or_else(|| self.fresh(now_ms));
        let regressed = prior.last_refill_ms.saturating_sub(now_ms);
        let elapsed = now_ms.saturating_sub(prior.last_refill_ms);
        let earned = self.rate.tokens_in(elapsed);
        let held = prior.tokens.min(self.capacity);

        if earned == 0 {
            return Refill {
                state: BucketState {
                    tokens: held,
                    last_refill_ms: prior.last_refill_ms,
                },
                added: 0,
                clock_regressed_by_ms: regressed,
            };
        }

        let tokens = held.saturating_add(earned).min(self.capacity);
        let spent = self.rate.millis_for(earned).min(elapsed);

        Refill {
            state: BucketState {
                tokens,
                last_refill_ms: prior.last_refill_ms + spent,
            },
            added: tokens - held,
            clock_regressed_by_ms: regressed,
        }
    }

    pub fn consume(&self, prior: Option<BucketState>, now_ms: u64) -> Outcome {
        let refill = self.refill(prior, now_ms);
        let mut state = refill.state;
        let admitted = state.tokens >= 1;
        if admitted {
            state.tokens -= 1;
        }
        Outcome {
            state,
            admitted,
            clock_regressed_by_ms: refill.clock_regressed_by_ms,
        }
    }

    /// Time until `state` holds at least one whole token, counting carried-over
    /// progress. Zero when a token is already available.
    pub fn retry_after(&self, state: &BucketState, now_ms: u64) -> Duration {
        if state.tokens >= 1 || self.capacity == 0 {
            return Duration::ZERO;
        }
        let progressed = now_ms.saturating_sub(state.last_refill_ms);
        Duration::from_millis(self.rate.millis_for(1).saturating_sub(progressed))
    }
}
