//! Shared bucket storage.
//!
//! A bucket lives under two string keys so operators can inspect it directly:
//!
//! - `{prefix}:tokens:{client_id}` holds the token count as a decimal string.
//! - `{prefix}:last_refill:{client_id}` holds epoch milliseconds as a decimal string.
//!
//! Backends implement [`BucketStore`]. The one operation the limiter relies on for
//! correctness is [`BucketStore::atomic_update`]: read both sub-keys, run the
//! caller's pure update, and write the result with no other writer interleaved.
//! Backends without server-side transactions implement [`CasStore`] and delegate
//! to [`optimistic_update`].

use crate::engine::{BucketState, TokenBucket};
use crate::error::CorruptedState;
use crate::retry::ContentionRetry;
use async_trait::async_trait;
use std::time::Duration;

pub mod memory;

pub use memory::{InMemoryStore, MemoryStoreError};

/// Default key prefix, shared with deployments that read the keys directly.
pub const DEFAULT_KEY_PREFIX: &str = "rate_limiter";

/// Store keys for one client.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BucketKey {
    client_id: String,
    tokens: String,
    last_refill: String,
}

impl BucketKey {
    pub fn new(prefix: &str, client_id: &str) -> Self {
        Self {
            client_id: client_id.to_string(),
            tokens: format!("{prefix}:tokens:{client_id}"),
            last_refill: format!("{prefix}:last_refill:{client_id}"),
        }
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn tokens_key(&self) -> &str {
        &self.tokens
    }

    pub fn last_refill_key(&self) -> &str {
        &self.last_refill
    }
}

/// Raw sub-key values as the store holds them. `None` means the key is absent.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoredBucket {
    pub tokens: Option<String>,
    pub last_refill: Option<String>,
}

/// A decoded bucket plus whatever could not be parsed on the way.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decoded {
    pub state: Option<BucketState>,
    pub corrupted: Vec<CorruptedState>,
}

impl StoredBucket {
    pub fn encode(state: &BucketState) -> Self {
        Self {
            tokens: Some(state.tokens.to_string()),
            last_refill: Some(state.last_refill_ms.to_string()),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_none() && self.last_refill.is_none()
    }

    /// Parse both sub-keys independently.
    ///
    /// An absent or unparsable sub-key falls back to the fresh-bucket default for
    /// that field only (`capacity` tokens, refill time `now_ms`), so one bad write
    /// cannot wedge a client. Both absent means the bucket does not exist yet.
    pub fn decode(&self, key: &BucketKey, engine: &TokenBucket, now_ms: u64) -> Decoded {
        if self.is_empty() {
            return Decoded {
                state: None,
                corrupted: Vec::new(),
            };
        }
        let mut corrupted = Vec::new();
        let mut field = |raw: &Option<String>, name: &str| -> Option<u64> {
            let raw = raw.as_deref()?;
            match raw.parse::<u64>() {
                Ok(v) => Some(v),
                Err(_) => {
                    corrupted.push(CorruptedState {
                        key: name.to_string(),
                        value: raw.to_string(),
                    });
                    None
                }
            }
        };
        let tokens = field(&self.tokens, key.tokens_key());
        let last_refill_ms = field(&self.last_refill, key.last_refill_key());
        let fresh = engine.fresh(now_ms);
        Decoded {
            state: Some(BucketState {
                tokens: tokens.unwrap_or(fresh.tokens),
                last_refill_ms: last_refill_ms.unwrap_or(fresh.last_refill_ms),
            }),
            corrupted,
        }
    }
}

/// Failure of an atomic bucket update.
#[derive(Debug, thiserror::Error)]
pub enum UpdateError<E> {
    #[error("{0}")]
    Store(#[source] E),
    #[error("gave up after {attempts} conflicting compare-and-swap attempts")]
    Contention { attempts: usize },
}

/// Capability set every bucket backend provides.
///
/// `atomic_update` may invoke `update` more than once (optimistic backends replay
/// it after a conflict), so `update` must be a pure function of its input.
#[async_trait]
pub trait BucketStore: Send + Sync {
    type Error: std::error::Error + Send + Sync + 'static;

    async fn read(&self, key: &BucketKey) -> Result<StoredBucket, Self::Error>;

    /// Unconditional write. `None` fields delete the matching sub-key.
    async fn write(
        &self,
        key: &BucketKey,
        value: &StoredBucket,
        ttl: Option<Duration>,
    ) -> Result<(), Self::Error>;

    /// Reset the expiry of both sub-keys. Returns `false` if the bucket does not exist.
    async fn expire(&self, key: &BucketKey, ttl: Duration) -> Result<bool, Self::Error>;

    async fn atomic_update<F, R>(
        &self,
        key: &BucketKey,
        ttl: Option<Duration>,
        update: F,
    ) -> Result<R, UpdateError<Self::Error>>
    where
        F: FnMut(&StoredBucket) -> (StoredBucket, R) + Send,
        R: Send;
}

/// Backends that can conditionally replace a bucket.
#[async_trait]
pub trait CasStore: BucketStore {
    /// Write `new` only if the bucket still equals `expected`. Returns whether the
    /// write happened.
    async fn compare_and_swap(
        &self,
        key: &BucketKey,
        expected: &StoredBucket,
        new: &StoredBucket,
        ttl: Option<Duration>,
    ) -> Result<bool, Self::Error>;
}

/// Read → compute → compare-and-swap, retried on conflict within `retry`'s budget.
pub async fn optimistic_update<S, F, R>(
    store: &S,
    key: &BucketKey,
    ttl: Option<Duration>,
    retry: &ContentionRetry,
    mut update: F,
) -> Result<R, UpdateError<S::Error>>
where
    S: CasStore + ?Sized,
    F: FnMut(&StoredBucket) -> (StoredBucket, R) + Send,
    R: Send,
{
    let attempts = retry.max_attempts();
    for attempt in 1..=attempts {
        let current = store.read(key).await.map_err(UpdateError::Store)?;
        let (next, result) = update(&current);
        let swapped = store
            .compare_and_swap(key, &current, &next, ttl)
            .await
            .map_err(UpdateError::Store)?;
        if swapped {
            return Ok(result);
        }
        tracing::debug!(client = key.client_id(), attempt, "bucket CAS conflict");
        if attempt < attempts {
            retry.pause(attempt).await;
        }
    }
    Err(UpdateError::Contention { attempts })
}
