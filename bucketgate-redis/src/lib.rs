//! Redis-backed bucket store.
//!
//! Buckets use the shared two-key layout (`{prefix}:tokens:{id}` and
//! `{prefix}:last_refill:{id}`, decimal strings), so operators can inspect them
//! with `redis-cli`. Atomic updates run the limiter's engine in process and
//! commit through a Lua compare-and-swap over both keys, retried on conflict.
//!
//! ```no_run
//! use bucketgate::{FailurePolicy, LimiterConfig, RateLimiter};
//! use bucketgate_redis::{RedisSettings, RedisStore};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let settings = RedisSettings::default();
//! let store = RedisStore::connect(&settings).await?;
//! let config = LimiterConfig::builder()
//!     .store_timeout(settings.timeout)
//!     .failure_policy(FailurePolicy::FailOpen)
//!     .build()?;
//! let limiter = RateLimiter::new(store, config);
//! let admission = limiter.admit("203.0.113.7").await;
//! # let _ = admission;
//! # Ok(())
//! # }
//! ```

use async_trait::async_trait;
use bucketgate::{
    optimistic_update, BucketKey, BucketStore, CasStore, ContentionRetry, StoredBucket,
    UpdateError,
};
use redis::aio::ConnectionManager;
use redis::{ConnectionAddr, ConnectionInfo, RedisConnectionInfo, Script};
use std::time::Duration;

/// Connection settings for the Redis server holding the buckets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedisSettings {
    pub host: String,
    pub port: u16,
    /// Connect deadline; also the natural per-call store timeout.
    pub timeout: Duration,
    pub password: Option<String>,
    pub database: u32,
}

impl Default for RedisSettings {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 6379,
            timeout: Duration::from_millis(2_000),
            password: None,
            database: 0,
        }
    }
}

impl RedisSettings {
    /// Structured client parameters. The password is passed through as-is, so
    /// characters such as `@`, `/` or `:` need no URL escaping.
    pub fn connection_info(&self) -> ConnectionInfo {
        ConnectionInfo {
            addr: ConnectionAddr::Tcp(self.host.clone(), self.port),
            redis: RedisConnectionInfo {
                db: i64::from(self.database),
                password: self.password.clone(),
                ..RedisConnectionInfo::default()
            },
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RedisStoreError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("timed out connecting to redis after {0:?}")]
    ConnectTimeout(Duration),
}

/// Compare both sub-keys against the expected raw values, then set or delete both.
///
/// ARGV: expected tokens (flag, value), expected last_refill (flag, value),
/// new tokens (flag, value), new last_refill (flag, value), ttl in ms (0 = none).
/// A flag of "1" means the key holds the value; "0" means the key is absent.
const COMPARE_AND_SWAP: &str = r#"
local function matches(current, present, expected)
  if present == "1" then
    return current == expected
  end
  return current == false
end

local tokens = redis.call("GET", KEYS[1])
local last_refill = redis.call("GET", KEYS[2])
if not matches(tokens, ARGV[1], ARGV[2]) or not matches(last_refill, ARGV[3], ARGV[4]) then
  return 0
end

local ttl_ms = tonumber(ARGV[9])
local function put(key, present, value)
  if present ~= "1" then
    redis.call("DEL", key)
  elseif ttl_ms > 0 then
    redis.call("SET", key, value, "PX", ttl_ms)
  else
    redis.call("SET", key, value)
  end
end

put(KEYS[1], ARGV[5], ARGV[6])
put(KEYS[2], ARGV[7], ARGV[8])
return 1
"#;

/// Script arguments for one optional raw value.
fn presence(value: &Option<String>) -> (&'static str, &str) {
    match value {
        Some(v) => ("1", v.as_str()),
        None => ("0", ""),
    }
}

fn ttl_millis(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1)
}

/// Bucket store over a multiplexed, auto-reconnecting Redis connection.
#[derive(Clone)]
pub struct RedisStore {
    connection_manager: ConnectionManager,
    retry: ContentionRetry,
    cas: Script,
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore")
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

impl RedisStore {
    pub fn new(connection_manager: ConnectionManager) -> Self {
        Self {
            connection_manager,
            retry: ContentionRetry::default(),
            cas: Script::new(COMPARE_AND_SWAP),
        }
    }

    /// Open a client for `settings` and wait at most `settings.timeout` for the
    /// first connection.
    pub async fn connect(settings: &RedisSettings) -> Result<Self, RedisStoreError> {
        let client = redis::Client::open(settings.connection_info())?;
        let manager = tokio::time::timeout(settings.timeout, ConnectionManager::new(client))
            .await
            .map_err(|_| RedisStoreError::ConnectTimeout(settings.timeout))??;
        tracing::info!(host = %settings.host, port = settings.port, "connected to redis");
        Ok(Self::new(manager))
    }

    /// Budget for compare-and-swap conflicts on hot keys.
    pub fn with_contention(mut self, retry: ContentionRetry) -> Self {
        self.retry = retry;
        self
    }

    pub async fn ping(&self) -> Result<(), RedisStoreError> {
        let mut conn = self.connection_manager.clone();
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }
}

#[async_trait]
impl BucketStore for RedisStore {
    type Error = RedisStoreError;

    async fn read(&self, key: &BucketKey) -> Result<StoredBucket, Self::Error> {
        let mut conn = self.connection_manager.clone();
        let (tokens, last_refill): (Option<String>, Option<String>) = redis::cmd("MGET")
            .arg(key.tokens_key())
            .arg(key.last_refill_key())
            .query_async(&mut conn)
            .await?;
        Ok(StoredBucket {
            tokens,
            last_refill,
        })
    }

    async fn write(
        &self,
        key: &BucketKey,
        value: &StoredBucket,
        ttl: Option<Duration>,
    ) -> Result<(), Self::Error> {
        let mut pipe = redis::pipe();
        pipe.atomic();
        let fields = [
            (key.tokens_key(), &value.tokens),
            (key.last_refill_key(), &value.last_refill),
        ];
        for (name, raw) in fields {
            match (raw, ttl) {
                (Some(v), Some(ttl)) => {
                    pipe.cmd("SET")
                        .arg(name)
                        .arg(v)
                        .arg("PX")
                        .arg(ttl_millis(ttl))
                        .ignore();
                }
                (Some(v), None) => {
                    pipe.cmd("SET").arg(name).arg(v).ignore();
                }
                (None, _) => {
                    pipe.cmd("DEL").arg(name).ignore();
                }
            }
        }
        let mut conn = self.connection_manager.clone();
        let () = pipe.query_async(&mut conn).await?;
        Ok(())
    }

    async fn expire(&self, key: &BucketKey, ttl: Duration) -> Result<bool, Self::Error> {
        let ms = ttl_millis(ttl);
        let mut pipe = redis::pipe();
        pipe.atomic()
            .cmd("PEXPIRE")
            .arg(key.tokens_key())
            .arg(ms)
            .cmd("PEXPIRE")
            .arg(key.last_refill_key())
            .arg(ms);
        let mut conn = self.connection_manager.clone();
        let (tokens, last_refill): (i64, i64) = pipe.query_async(&mut conn).await?;
        Ok(tokens == 1 || last_refill == 1)
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
impl CasStore for RedisStore {
    async fn compare_and_swap(
        &self,
        key: &BucketKey,
        expected: &StoredBucket,
        new: &StoredBucket,
        ttl: Option<Duration>,
    ) -> Result<bool, Self::Error> {
        let (exp_tokens_flag, exp_tokens) = presence(&expected.tokens);
        let (exp_last_flag, exp_last) = presence(&expected.last_refill);
        let (new_tokens_flag, new_tokens) = presence(&new.tokens);
        let (new_last_flag, new_last) = presence(&new.last_refill);

        let mut conn = self.connection_manager.clone();
        let swapped: i64 = self
            .cas
            .key(key.tokens_key())
            .key(key.last_refill_key())
            .arg(exp_tokens_flag)
            .arg(exp_tokens)
            .arg(exp_last_flag)
            .arg(exp_last)
            .arg(new_tokens_flag)
            .arg(new_tokens)
            .arg(new_last_flag)
            .arg(new_last)
            .arg(ttl.map_or(0, ttl_millis))
            .invoke_async(&mut conn)
            .await?;
        Ok(swapped == 1)
    }
}
