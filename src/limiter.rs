//! Rate limiter facade: binds the token bucket engine to a shared store.
//!
//! Every operation is one [`BucketStore::atomic_update`] call parameterized by the
//! pure engine, so concurrent callers on any number of instances cannot both spend
//! the same token. Each store call runs under the configured deadline.
//!
//! Two layers of API:
//! - [`RateLimiter::try_consume`] / [`RateLimiter::available_tokens`] return
//!   [`LimiterError`] when the store fails, for callers that want to decide.
//! - [`RateLimiter::admit`] always produces an [`Admission`], applying the
//!   configured [`FailurePolicy`] when the store fails.
//!
//! ```rust
//! use bucketgate::{FailurePolicy, InMemoryStore, LimiterConfig, ManualClock, RateLimiter};
//!
//! # tokio::runtime::Runtime::new().unwrap().block_on(async {
//! let clock = ManualClock::new(0);
//! let config = LimiterConfig::builder()
//!     .capacity(1)
//!     .refill_rate_per_second(1.0)
//!     .failure_policy(FailurePolicy::FailOpen)
//!     .build()
//!     .unwrap();
//! let store = InMemoryStore::new(clock.clone());
//! let limiter = RateLimiter::new(store, config).with_clock(clock.clone());
//!
//! assert!(limiter.try_consume("c1").await.unwrap().is_allowed());
//! assert!(!limiter.try_consume("c1").await.unwrap().is_allowed());
//! clock.set(1_000);
//! assert!(limiter.try_consume("c1").await.unwrap().is_allowed());
//! assert_eq!(limiter.available_tokens("c1").await.unwrap(), 0);
//! # });
//! ```

use crate::clock::{Clock, SystemClock};
use crate::config::{FailurePolicy, LimiterConfig};
use crate::error::{CorruptedState, LimiterError};
use crate::store::{BucketKey, BucketStore, StoredBucket, UpdateError};
use crate::telemetry::{emit_best_effort, LimiterEvent, NullSink, TelemetrySink};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Outcome of a successful `try_consume`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// A token was taken.
    Allowed {
        /// Tokens left after the decrement. Feeds `X-RateLimit-Remaining`.
        remaining: u64,
    },
    /// The bucket held no whole token.
    Denied {
        /// Tokens after refill (always 0 with integer tokens).
        remaining: u64,
        /// Time until the next whole token. Feeds `Retry-After`.
        retry_after: Duration,
    },
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allowed { .. })
    }

    pub fn remaining(&self) -> u64 {
        match self {
            Decision::Allowed { remaining } | Decision::Denied { remaining, .. } => *remaining,
        }
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Decision::Allowed { .. } => None,
            Decision::Denied { retry_after, .. } => Some(*retry_after),
        }
    }
}

/// A final admit/reject answer, even when the store is down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Admission {
    pub admitted: bool,
    /// Configured capacity (`X-RateLimit-Limit`).
    pub limit: u64,
    /// Tokens left after this call; 0 when the store could not be consulted.
    pub remaining: u64,
    pub retry_after: Option<Duration>,
    /// Set when the failure policy made the decision instead of the bucket.
    pub fallback: Option<FailurePolicy>,
}

impl Admission {
    pub fn is_fallback(&self) -> bool {
        self.fallback.is_some()
    }
}

/// Read-only view used by the status endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BucketStatus {
    pub client_id: String,
    pub capacity: u64,
    pub available_tokens: u64,
}

/// Per-call result carried out of the atomic update closure.
struct Step<T> {
    value: T,
    corrupted: Vec<CorruptedState>,
    clock_regressed_by_ms: u64,
}

pub struct RateLimiter<S, T = NullSink> {
    store: Arc<S>,
    clock: Arc<dyn Clock>,
    config: LimiterConfig,
    sink: T,
}

impl<S, T: Clone> Clone for RateLimiter<S, T> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            clock: self.clock.clone(),
            config: self.config.clone(),
            sink: self.sink.clone(),
        }
    }
}

impl<S, T> std::fmt::Debug for RateLimiter<S, T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("config", &self.config)
            .field("clock", &self.clock)
            .field("store", &"<store>")
            .finish()
    }
}

impl<S> RateLimiter<S, NullSink> {
    /// Limiter on the system clock with telemetry disabled.
    pub fn new(store: S, config: LimiterConfig) -> Self {
        Self {
            store: Arc::new(store),
            clock: Arc::new(SystemClock),
            config,
            sink: NullSink,
        }
    }
}

impl<S, T> RateLimiter<S, T> {
    pub fn with_clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    pub fn with_sink<U: TelemetrySink>(self, sink: U) -> RateLimiter<S, U> {
        RateLimiter {
            store: self.store,
            clock: self.clock,
            config: self.config,
            sink,
        }
    }

    pub fn config(&self) -> &LimiterConfig {
        &self.config
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Configured capacity. Independent of stored state; the client id is accepted
    /// so per-client limits can be introduced without changing callers.
    pub fn capacity(&self, _client_id: &str) -> u64 {
        self.config.capacity()
    }

    pub fn key(&self, client_id: &str) -> BucketKey {
        BucketKey::new(self.config.key_prefix(), client_id)
    }
}

impl<S, T> RateLimiter<S, T>
where
    S: BucketStore + 'static,
    T: TelemetrySink,
    T::Future: Send + 'static,
{
    /// Refill, then take one token if a whole token is available.
    pub async fn try_consume(&self, client_id: &str) -> Result<Decision, LimiterError<S::Error>> {
        let key = self.key(client_id);
        let engine = *self.config.engine();
        let clock = &self.clock;
        let ttl = self.config.entry_ttl();

        let update = self.store.atomic_update(&key, ttl, |raw| {
            // Read per attempt: a replay after a lost swap must see the current time.
            let now = clock.now_millis();
            let decoded = raw.decode(&key, &engine, now);
            let outcome = engine.consume(decoded.state, now);
            let decision = if outcome.admitted {
                Decision::Allowed {
                    remaining: outcome.state.tokens,
                }
            } else {
                Decision::Denied {
                    remaining: outcome.state.tokens,
                    retry_after: engine.retry_after(&outcome.state, now),
                }
            };
            let step = Step {
                value: decision,
                corrupted: decoded.corrupted,
                clock_regressed_by_ms: outcome.clock_regressed_by_ms,
            };
            (StoredBucket::encode(&outcome.state), step)
        });
        let step = self.bounded(update).await?;

        self.report_anomalies(client_id, &step).await;
        let decision = step.value;
        match decision {
            Decision::Allowed { remaining } => {
                tracing::debug!(client = client_id, remaining, "request admitted");
                self.emit(LimiterEvent::Admitted {
                    client_id: client_id.to_string(),
                    remaining,
                })
                .await;
            }
            Decision::Denied { retry_after, .. } => {
                tracing::debug!(client = client_id, ?retry_after, "request rejected");
                self.emit(LimiterEvent::Rejected {
                    client_id: client_id.to_string(),
                    retry_after,
                })
                .await;
            }
        }
        Ok(decision)
    }

    /// Refill and persist without consuming; returns the refilled token count.
    pub async fn available_tokens(&self, client_id: &str) -> Result<u64, LimiterError<S::Error>> {
        let key = self.key(client_id);
        let engine = *self.config.engine();
        let clock = &self.clock;
        let ttl = self.config.entry_ttl();

        let update = self.store.atomic_update(&key, ttl, |raw| {
            let now = clock.now_millis();
            let decoded = raw.decode(&key, &engine, now);
            let refill = engine.refill(decoded.state, now);
            let step = Step {
                value: refill.state.tokens,
                corrupted: decoded.corrupted,
                clock_regressed_by_ms: refill.clock_regressed_by_ms,
            };
            (StoredBucket::encode(&refill.state), step)
        });
        let step = self.bounded(update).await?;

        self.report_anomalies(client_id, &step).await;
        Ok(step.value)
    }

    pub async fn status(&self, client_id: &str) -> Result<BucketStatus, LimiterError<S::Error>> {
        Ok(BucketStatus {
            client_id: client_id.to_string(),
            capacity: self.capacity(client_id),
            available_tokens: self.available_tokens(client_id).await?,
        })
    }

    /// `try_consume` with the failure policy applied. Never fails.
    pub async fn admit(&self, client_id: &str) -> Admission {
        let limit = self.capacity(client_id);
        match self.try_consume(client_id).await {
            Ok(decision) => Admission {
                admitted: decision.is_allowed(),
                limit,
                remaining: decision.remaining(),
                retry_after: decision.retry_after(),
                fallback: None,
            },
            Err(err) => {
                let policy = self.config.failure_policy();
                tracing::warn!(
                    client = client_id,
                    error = %err,
                    policy = %policy,
                    "bucket store failed; applying failure policy"
                );
                self.emit(LimiterEvent::StoreFailure {
                    client_id: client_id.to_string(),
                    error: err.kind(),
                    policy,
                })
                .await;
                Admission {
                    admitted: policy.admits(),
                    limit,
                    remaining: 0,
                    retry_after: None,
                    fallback: Some(policy),
                }
            }
        }
    }

    async fn bounded<R, F>(&self, call: F) -> Result<R, LimiterError<S::Error>>
    where
        F: Future<Output = Result<R, UpdateError<S::Error>>>,
    {
        let timeout = self.config.store_timeout();
        let started = tokio::time::Instant::now();
        match tokio::time::timeout(timeout, call).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(UpdateError::Store(e))) => Err(LimiterError::StoreUnavailable(e)),
            Ok(Err(UpdateError::Contention { attempts })) => {
                Err(LimiterError::Contention { attempts })
            }
            Err(_) => Err(LimiterError::Timeout {
                elapsed: started.elapsed(),
                timeout,
            }),
        }
    }

    async fn report_anomalies<V>(&self, client_id: &str, step: &Step<V>) {
        for bad in &step.corrupted {
            tracing::warn!(key = %bad.key, value = %bad.value, "corrupted value reset");
            self.emit(LimiterEvent::CorruptedState {
                key: bad.key.clone(),
                value: bad.value.clone(),
            })
            .await;
        }
        if step.clock_regressed_by_ms > 0 {
            tracing::warn!(
                client = client_id,
                by_ms = step.clock_regressed_by_ms,
                "clock behind stored refill time; elapsed clamped to zero"
            );
            self.emit(LimiterEvent::ClockRegression {
                client_id: client_id.to_string(),
                by_ms: step.clock_regressed_by_ms,
            })
            .await;
        }
    }

    async fn emit(&self, event: LimiterEvent) {
        emit_best_effort(self.sink.clone(), event).await;
    }
}
