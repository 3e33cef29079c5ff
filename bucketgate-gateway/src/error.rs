use bucketgate::ConfigError;
use bucketgate_redis::RedisStoreError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("invalid settings: {0}")]
    Settings(Box<figment::Error>),
    #[error("invalid rate limiter settings: {0}")]
    Limiter(#[from] ConfigError),
    #[error("invalid failure_policy: {0}")]
    FailurePolicy(String),
    #[error("invalid upstream_url {url:?}: {reason}")]
    Upstream { url: String, reason: String },
    #[error("bucket store unavailable: {0}")]
    Store(#[from] RedisStoreError),
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("server error: {0}")]
    Serve(#[source] std::io::Error),
}
