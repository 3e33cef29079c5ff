use crate::config::FailurePolicy;
use std::fmt;
use std::time::Duration;

/// Events emitted by the rate limiter facade.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LimiterEvent {
    /// A token was consumed.
    Admitted {
        client_id: String,
        /// Tokens left after the decrement
        remaining: u64,
    },
    /// The bucket was empty.
    Rejected {
        client_id: String,
        /// Time until the next whole token
        retry_after: Duration,
    },
    /// The store could not produce a decision; `policy` decided instead.
    StoreFailure {
        client_id: String,
        /// `LimiterError::kind()` of the failure
        error: &'static str,
        policy: FailurePolicy,
    },
    /// A stored sub-key failed to parse and was reset.
    CorruptedState { key: String, value: String },
    /// The clock read earlier than the stored refill time; elapsed time was clamped.
    ClockRegression { client_id: String, by_ms: u64 },
}

impl LimiterEvent {
    /// Stable snake_case label, e.g. for metric names.
    pub fn kind(&self) -> &'static str {
        match self {
            LimiterEvent::Admitted { .. } => "admitted",
            LimiterEvent::Rejected { .. } => "rejected",
            LimiterEvent::StoreFailure { .. } => "store_failure",
            LimiterEvent::CorruptedState { .. } => "corrupted_state",
            LimiterEvent::ClockRegression { .. } => "clock_regression",
        }
    }

    /// Whether this event reports something an operator should look at.
    pub fn is_anomaly(&self) -> bool {
        match self {
            LimiterEvent::Admitted { .. } | LimiterEvent::Rejected { .. } => false,
            _ => true,
        }
    }
}

impl fmt::Display for LimiterEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LimiterEvent::Admitted {
                client_id,
                remaining,
            } => write!(f, "Admitted(client={client_id}, remaining={remaining})"),
            LimiterEvent::Rejected {
                client_id,
                retry_after,
            } => write!(f, "Rejected(client={client_id}, retry_after={retry_after:?})"),
            LimiterEvent::StoreFailure {
                client_id,
                error,
                policy,
            } => write!(f, "StoreFailure(client={client_id}, error={error}, policy={policy})"),
            LimiterEvent::CorruptedState { key, value } => {
                write!(f, "CorruptedState(key={key}, value={value:?})")
            }
            LimiterEvent::ClockRegression { client_id, by_ms } => {
                write!(f, "ClockRegression(client={client_id}, by={by_ms}ms)")
            }
        }
    }
}
