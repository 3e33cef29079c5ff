//! Shared fixtures for integration tests.
#![allow(dead_code)]

use async_trait::async_trait;
use bucketgate::{
    optimistic_update, BucketKey, BucketStore, CasStore, Clock, ContentionRetry, FailurePolicy,
    InMemoryStore, LimiterConfig, ManualClock, MemoryStoreError, StoredBucket, UpdateError,
};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Route `tracing` output through the test harness; repeated calls are no-ops.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("bucketgate=debug")
        .with_test_writer()
        .try_init();
}

pub fn config(capacity: u64, rate: f64, policy: FailurePolicy) -> LimiterConfig {
    LimiterConfig::builder()
        .capacity(capacity)
        .refill_rate_per_second(rate)
        .failure_policy(policy)
        .build()
        .expect("valid config")
}

/// Another gateway instance that wins the first swap: it stores `tokens` refilled
/// `ahead_ms` after the current instant, and the shared clock moves there too.
#[derive(Debug, Clone, Copy)]
pub struct Rival {
    pub tokens: u64,
    pub ahead_ms: u64,
}

/// Store that only offers compare-and-swap, like a remote key-value backend.
///
/// Yields between the read and the swap so concurrent callers interleave.
#[derive(Debug, Clone)]
pub struct CasOnlyStore {
    inner: InMemoryStore,
    clock: ManualClock,
    retry: ContentionRetry,
    conflicts: Arc<AtomicUsize>,
    rival: Option<Rival>,
    rival_done: Arc<AtomicBool>,
}

impl CasOnlyStore {
    pub fn new(clock: ManualClock, retry: ContentionRetry) -> Self {
        Self {
            inner: InMemoryStore::new(clock.clone()),
            clock,
            retry,
            conflicts: Arc::new(AtomicUsize::new(0)),
            rival: None,
            rival_done: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_rival(mut self, rival: Rival) -> Self {
        self.rival = Some(rival);
        self
    }

    pub fn conflicts(&self) -> usize {
        self.conflicts.load(Ordering::SeqCst)
    }

    pub fn inner(&self) -> &InMemoryStore {
        &self.inner
    }

    fn let_rival_win(&self, key: &BucketKey) {
        let Some(rival) = self.rival else {
            return;
        };
        if self.rival_done.swap(true, Ordering::SeqCst) {
            return;
        }
        let at = self.clock.now_millis() + rival.ahead_ms;
        let (tokens, last_refill) = (rival.tokens.to_string(), at.to_string());
        self.inner.put_raw(key.tokens_key(), &tokens);
        self.inner.put_raw(key.last_refill_key(), &last_refill);
        self.clock.set(at);
    }
}

#[async_trait]
impl BucketStore for CasOnlyStore {
    type Error = MemoryStoreError;

    async fn read(&self, key: &BucketKey) -> Result<StoredBucket, Self::Error> {
        self.inner.read(key).await
    }

    async fn write(
        &self,
        key: &BucketKey,
        value: &StoredBucket,
        ttl: Option<Duration>,
    ) -> Result<(), Self::Error> {
        self.inner.write(key, value, ttl).await
    }

    async fn expire(&self, key: &BucketKey, ttl: Duration) -> Result<bool, Self::Error> {
        self.inner.expire(key, ttl).await
    }

    async fn atomic_update<F, R>(
        &self,
        key: &BucketKey,
        ttl: Option<Duration>,
        update: F,
    ) -> Result<R, UpdateError<Self::Error>>
    where
        F: FnMut(&StoredBucket) -> (StoredBucket, R) + Send,
        R: Send,
    {
        optimistic_update(self, key, ttl, &self.retry, update).await
    }
}

#[async_trait]
impl CasStore for CasOnlyStore {
    async fn compare_and_swap(
        &self,
        key: &BucketKey,
        expected: &StoredBucket,
        new: &StoredBucket,
        ttl: Option<Duration>,
    ) -> Result<bool, Self::Error> {
        tokio::task::yield_now().await;
        self.let_rival_win(key);
        let swapped = self.inner.compare_and_swap(key, expected, new, ttl).await?;
        if !swapped {
            self.conflicts.fetch_add(1, Ordering::SeqCst);
        }
        Ok(swapped)
    }
}
