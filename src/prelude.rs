//! Convenient re-exports for wiring a limiter into a service.
pub use crate::{
    config::{FailurePolicy, LimiterConfig},
    limiter::{Admission, Decision, RateLimiter},
    middleware::{AdmissionLayer, PeerAddr},
    store::{BucketStore, CasStore, InMemoryStore},
    telemetry::{LimiterEvent, LogSink, MemorySink, TelemetrySink},
    LimiterError,
};
