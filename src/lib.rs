#![forbid(unsafe_code)]
#![deny(warnings)]
#![cfg_attr(not(test), deny(clippy::all))]

//! # bucketgate
//!
//! Distributed token-bucket rate limiting for HTTP services. Bucket state lives in a
//! shared store, so every gateway instance in front of an API enforces one budget
//! per client.
//!
//! ## Features
//!
//! - **Pure bucket engine** with integer tokens and carried-over refill progress
//! - **Atomic store updates**: lock-holding in-memory backend, compare-and-swap
//!   loop for remote backends
//! - **Store deadlines** and an explicit fail-open / fail-closed policy
//! - **Tower middleware** for `http` services with the usual `X-RateLimit-*` headers
//! - **Telemetry** as `tower::Service` sinks
//!
//! ## Quick Start
//!
//! ```rust
//! use bucketgate::{FailurePolicy, InMemoryStore, LimiterConfig, RateLimiter};
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = LimiterConfig::builder()
//!         .capacity(10)
//!         .refill_rate_per_second(5.0)
//!         .failure_policy(FailurePolicy::FailOpen)
//!         .build()
//!         .unwrap();
//!     let limiter = RateLimiter::new(InMemoryStore::default(), config);
//!
//!     let admission = limiter.admit("203.0.113.7").await;
//!     assert!(admission.admitted);
//!     assert_eq!(admission.remaining, 9);
//! }
//! ```

pub mod clock;
pub mod config;
pub mod engine;
pub mod error;
pub mod limiter;
pub mod middleware;
pub mod prelude;
pub mod retry;
pub mod store;
pub mod telemetry;

// Re-exports
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{FailurePolicy, LimiterConfig, LimiterConfigBuilder};
pub use engine::{BucketState, RefillRate, TokenBucket};
pub use error::{ConfigError, CorruptedState, LimiterError};
pub use limiter::{Admission, BucketStatus, Decision, RateLimiter};
pub use middleware::{client_identity, AdmissionLayer, AdmissionService, PeerAddr};
pub use retry::{ContentionRetry, Sleeper, TokioSleeper, TrackingSleeper};
pub use store::{
    optimistic_update, BucketKey, BucketStore, CasStore, InMemoryStore, MemoryStoreError,
    StoredBucket, UpdateError,
};
pub use telemetry::{LimiterEvent, LogSink, MemorySink, NullSink, TelemetrySink};
