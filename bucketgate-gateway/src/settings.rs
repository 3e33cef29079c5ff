//! Gateway settings: defaults, then an optional TOML file, then `BUCKETGATE_`
//! environment variables (`__` separates sections).

use crate::error::GatewayError;
use bucketgate::{FailurePolicy, LimiterConfig};
use bucketgate_redis::RedisSettings;
use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreKind {
    Redis,
    /// Per-process buckets; only correct with a single gateway instance.
    Memory,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatewaySettings {
    pub listen: SocketAddr,
    /// Where admitted `/api/**` requests go, with the `/api` segment stripped.
    pub upstream_url: String,
    pub store: StoreKind,
    pub rate_limiter: RateLimiterSection,
    pub redis: RedisSection,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimiterSection {
    pub capacity: u64,
    pub refill_rate: f64,
    /// `fail-open` or `fail-closed`. No default; startup fails until one is set.
    pub failure_policy: Option<String>,
    pub store_timeout_ms: u64,
    pub key_prefix: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedisSection {
    pub host: String,
    pub port: u16,
    pub password: Option<String>,
    pub database: u32,
    pub timeout_ms: u64,
    /// Idle buckets expire after this many seconds; 0 keeps them forever.
    pub ttl_seconds: u64,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([0, 0, 0, 0], 9000)),
            upstream_url: "http://localhost:8080".to_string(),
            store: StoreKind::Redis,
            rate_limiter: RateLimiterSection {
                capacity: bucketgate::config::DEFAULT_CAPACITY,
                refill_rate: bucketgate::config::DEFAULT_REFILL_RATE_PER_SECOND,
                failure_policy: None,
                store_timeout_ms: 2_000,
                key_prefix: bucketgate::store::DEFAULT_KEY_PREFIX.to_string(),
            },
            redis: RedisSection {
                host: "localhost".to_string(),
                port: 6379,
                password: None,
                database: 0,
                timeout_ms: 2_000,
                ttl_seconds: 3_600,
            },
        }
    }
}

impl GatewaySettings {
    /// Layered provider chain; exposed so tests can merge in-memory sources.
    pub fn figment(path: Option<&Path>) -> Figment {
        let mut figment = Figment::from(Serialized::defaults(GatewaySettings::default()));
        if let Some(path) = path {
            figment = figment.merge(Toml::file(path));
        }
        figment.merge(Env::prefixed("BUCKETGATE_").split("__"))
    }

    pub fn load(path: Option<&Path>) -> Result<Self, GatewayError> {
        Self::from_figment(Self::figment(path))
    }

    pub fn from_figment(figment: Figment) -> Result<Self, GatewayError> {
        figment
            .extract()
            .map_err(|e| GatewayError::Settings(Box::new(e)))
    }

    pub fn failure_policy(&self) -> Result<Option<FailurePolicy>, GatewayError> {
        let Some(raw) = self.rate_limiter.failure_policy.as_deref() else {
            return Ok(None);
        };
        let policy: FailurePolicy = raw.parse().map_err(GatewayError::FailurePolicy)?;
        Ok(Some(policy))
    }

    pub fn limiter_config(&self) -> Result<LimiterConfig, GatewayError> {
        let section = &self.rate_limiter;
        let mut builder = LimiterConfig::builder()
            .capacity(section.capacity)
            .refill_rate_per_second(section.refill_rate)
            .store_timeout(Duration::from_millis(section.store_timeout_ms))
            .key_prefix(section.key_prefix.clone());
        if self.redis.ttl_seconds > 0 {
            builder = builder.entry_ttl(Duration::from_secs(self.redis.ttl_seconds));
        }
        if let Some(policy) = self.failure_policy()? {
            builder = builder.failure_policy(policy);
        }
        Ok(builder.build()?)
    }

    pub fn redis_settings(&self) -> RedisSettings {
        RedisSettings {
            host: self.redis.host.clone(),
            port: self.redis.port,
            timeout: Duration::from_millis(self.redis.timeout_ms),
            password: self.redis.password.clone(),
            database: self.redis.database,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bucketgate::ConfigError;

    fn with_toml(toml: &str) -> Result<GatewaySettings, GatewayError> {
        let defaults = Serialized::defaults(GatewaySettings::default());
        GatewaySettings::from_figment(Figment::from(defaults).merge(Toml::string(toml)))
    }

    #[test]
    fn defaults_follow_documented_values() {
        let settings = GatewaySettings::default();
        assert_eq!(settings.upstream_url, "http://localhost:8080");
        assert_eq!(settings.redis.ttl_seconds, 3_600);
        assert_eq!(settings.redis_settings(), RedisSettings::default());
    }

    #[test]
    fn missing_failure_policy_blocks_startup() {
        let err = GatewaySettings::default().limiter_config().unwrap_err();
        assert!(matches!(
            err,
            GatewayError::Limiter(ConfigError::MissingFailurePolicy)
        ));
    }

    #[test]
    fn toml_overrides_defaults() {
        let settings = with_toml(
            r#"
            store = "memory"
            [rate_limiter]
            capacity = 3
            refill_rate = 0.5
            failure_policy = "fail-closed"
            [redis]
            ttl_seconds = 0
            "#,
        )
        .unwrap();
        assert_eq!(settings.store, StoreKind::Memory);
        let config = settings.limiter_config().unwrap();
        assert_eq!(config.capacity(), 3);
        assert_eq!(config.refill_rate().per_second(), 0.5);
        assert_eq!(config.failure_policy(), FailurePolicy::FailClosed);
        assert_eq!(config.entry_ttl(), None);
    }

    #[test]
    fn ttl_becomes_entry_ttl() {
        let settings = with_toml("[rate_limiter]\nfailure_policy = \"open\"").unwrap();
        let config = settings.limiter_config().unwrap();
        assert_eq!(config.entry_ttl(), Some(Duration::from_secs(3_600)));
        assert_eq!(config.failure_policy(), FailurePolicy::FailOpen);
    }

    #[test]
    fn unknown_policy_is_reported() {
        let settings = with_toml("[rate_limiter]\nfailure_policy = \"sometimes\"").unwrap();
        assert!(matches!(
            settings.limiter_config(),
            Err(GatewayError::FailurePolicy(_))
        ));
    }
}
