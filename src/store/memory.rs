//! In-process bucket store.
//!
//! Backs tests and single-instance deployments. `atomic_update` holds one lock for
//! the whole read-compute-write, so it is linearizable per key without retries.
//! Expiry is evaluated lazily against the injected clock.

use super::{BucketKey, BucketStore, CasStore, StoredBucket, UpdateError};
use crate::clock::{Clock, SystemClock};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MemoryStoreError {
    /// Injected outage (see [`InMemoryStore::set_unavailable`]).
    #[error("in-memory store marked unavailable")]
    Unavailable,
    #[error("in-memory store lock poisoned")]
    Poisoned,
}

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at_ms: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct InMemoryStore {
    entries: Arc<Mutex<HashMap<String, Entry>>>,
    clock: Arc<dyn Clock>,
    unavailable: Arc<AtomicBool>,
    latency: Arc<Mutex<Duration>>,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new(SystemClock)
    }
}

impl InMemoryStore {
    pub fn new<C: Clock + 'static>(clock: C) -> Self {
        Self {
            entries: Arc::new(Mutex::new(HashMap::new())),
            clock: Arc::new(clock),
            unavailable: Arc::new(AtomicBool::new(false)),
            latency: Arc::new(Mutex::new(Duration::ZERO)),
        }
    }

    /// Make every subsequent call fail with [`MemoryStoreError::Unavailable`].
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Delay every subsequent call by `latency` (tokio timer).
    pub fn set_latency(&self, latency: Duration) {
        if let Ok(mut l) = self.latency.lock() {
            *l = latency;
        }
    }

    /// Raw value under `key`, ignoring the bucket schema. Expired keys read as absent.
    pub fn get_raw(&self, key: &str) -> Option<String> {
        let now = self.clock.now_millis();
        let entries = self.entries.lock().ok()?;
        live_value(&entries, key, now)
    }

    /// Overwrite a raw value with no expiry (corruption and race injection in tests).
    pub fn put_raw(&self, key: &str, value: &str) {
        if let Ok(mut entries) = self.entries.lock() {
            let entry = Entry {
                value: value.to_string(),
                expires_at_ms: None,
            };
            entries.insert(key.to_string(), entry);
        }
    }

    /// Remaining time to live of a raw key, if it has one.
    pub fn ttl_of(&self, key: &str) -> Option<Duration> {
        let now = self.clock.now_millis();
        let entries = self.entries.lock().ok()?;
        let at = live(&entries, key, now)?.expires_at_ms?;
        Some(Duration::from_millis(at - now))
    }

    async fn enter(&self) -> Result<(), MemoryStoreError> {
        let latency = match self.latency.lock() {
            Ok(latency) => *latency,
            Err(_) => return Err(MemoryStoreError::Poisoned),
        };
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(MemoryStoreError::Unavailable);
        }
        Ok(())
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<String, Entry>>, MemoryStoreError> {
        self.entries.lock().map_err(|_| MemoryStoreError::Poisoned)
    }

    fn snapshot(entries: &HashMap<String, Entry>, key: &BucketKey, now: u64) -> StoredBucket {
        StoredBucket {
            tokens: live_value(entries, key.tokens_key(), now),
            last_refill: live_value(entries, key.last_refill_key(), now),
        }
    }

    fn store(
        entries: &mut HashMap<String, Entry>,
        key: &BucketKey,
        value: &StoredBucket,
        ttl: Option<Duration>,
        now: u64,
    ) {
        let expires_at_ms = ttl.map(|t| {
            let millis = u64::try_from(t.as_millis()).unwrap_or(u64::MAX);
            now.saturating_add(millis)
        });
        let fields = [
            (key.tokens_key(), &value.tokens),
            (key.last_refill_key(), &value.last_refill),
        ];
        for (name, v) in fields {
            match v {
                Some(v) => {
                    let entry = Entry {
                        value: v.clone(),
                        expires_at_ms,
                    };
                    entries.insert(name.to_string(), entry);
                }
                None => {
                    entries.remove(name);
                }
            }
        }
    }
}

fn live<'a>(entries: &'a HashMap<String, Entry>, key: &str, now: u64) -> Option<&'a Entry> {
    let entry = entries.get(key)?;
    match entry.expires_at_ms {
        Some(at) if at <= now => None,
        _ => Some(entry),
    }
}

fn live_value(entries: &HashMap<String, Entry>, key: &str, now: u64) -> Option<String> {
    live(entries, key, now).map(|e| e.value.clone())
}

#[async_trait]
impl BucketStore for InMemoryStore {
    type Error = MemoryStoreError;

    async fn read(&self, key: &BucketKey) -> Result<StoredBucket, Self::Error> {
        self.enter().await?;
        let now = self.clock.now_millis();
        Ok(Self::snapshot(&*self.lock()?, key, now))
    }

    async fn write(
        &self,
        key: &BucketKey,
        value: &StoredBucket,
        ttl: Option<Duration>,
    ) -> Result<(), Self::Error> {
        self.enter().await?;
        let now = self.clock.now_millis();
        Self::store(&mut *self.lock()?, key, value, ttl, now);
        Ok(())
    }

    async fn expire(&self, key: &BucketKey, ttl: Duration) -> Result<bool, Self::Error> {
        self.enter().await?;
        let now = self.clock.now_millis();
        let mut entries = self.lock()?;
        let current = Self::snapshot(&entries, key, now);
        if current.is_empty() {
            return Ok(false);
        }
        Self::store(&mut entries, key, &current, Some(ttl), now);
        Ok(true)
    }

    async fn atomic_update<F, R>(
        &self,
        key: &BucketKey,
        ttl: Option<Duration>,
        mut update: F,
    ) -> Result<R, UpdateError<Self::Error>>
    where
        F: FnMut(&StoredBucket) -> (StoredBucket, R) + Send,
        R: Send,
    {
        self.enter().await.map_err(UpdateError::Store)?;
        let now = self.clock.now_millis();
        let mut entries = self.lock().map_err(UpdateError::Store)?;
        let current = Self::snapshot(&entries, key, now);
        let (next, result) = update(&current);
        Self::store(&mut entries, key, &next, ttl, now);
        Ok(result)
    }
}

#[async_trait]
impl CasStore for InMemoryStore {
    async fn compare_and_swap(
        &self,
        key: &BucketKey,
        expected: &StoredBucket,
        new: &StoredBucket,
        ttl: Option<Duration>,
    ) -> Result<bool, Self::Error> {
        self.enter().await?;
        let now = self.clock.now_millis();
        let mut entries = self.lock()?;
        if Self::snapshot(&entries, key, now) != *expected {
            return Ok(false);
        }
        Self::store(&mut entries, key, new, ttl, now);
        Ok(true)
    }
}
