//! Telemetry for admission decisions.
//!
//! The limiter reports what it decided and what went wrong while deciding as
//! [`LimiterEvent`]s. Events flow through a [`TelemetrySink`], which is just a
//! `tower::Service<LimiterEvent>`, so sinks compose with ordinary tower
//! combinators.
//!
//! # Event Types
//!
//! - **Decisions**: `Admitted`, `Rejected`
//! - **Degraded decisions**: `StoreFailure` (the failure policy decided instead)
//! - **Recovered anomalies**: `CorruptedState`, `ClockRegression`
//!
//! Emission is best-effort: a sink that is not ready or fails never delays or
//! changes an admission decision.
//!
//! ```rust
//! use bucketgate::telemetry::LimiterEvent;
//!
//! let event = LimiterEvent::Admitted { client_id: "10.0.0.7".into(), remaining: 4 };
//! assert_eq!(event.to_string(), "Admitted(client=10.0.0.7, remaining=4)");
//! ```

pub mod events;
pub mod sinks;

pub use events::LimiterEvent;
pub use sinks::{emit_best_effort, LogSink, MemorySink, NullSink, TelemetrySink};
