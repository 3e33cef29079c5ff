//! HTTP server that binds the gateway router to a TCP socket.

use crate::error::GatewayError;
use crate::proxy::Upstream;
use crate::router::{build_router, AppState};
use crate::settings::{GatewaySettings, StoreKind};
use bucketgate::{BucketStore, InMemoryStore, LogSink, RateLimiter};
use bucketgate_redis::RedisStore;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;

/// Connect the configured store and serve until ctrl-c.
pub async fn run(settings: GatewaySettings) -> Result<(), GatewayError> {
    let config = settings.limiter_config()?;
    let upstream = Upstream::new(&settings.upstream_url)?;
    tracing::info!(
        capacity = config.capacity(),
        refill_rate = config.refill_rate().per_second(),
        failure_policy = %config.failure_policy(),
        upstream = upstream.base(),
        "rate limiter configured"
    );

    match settings.store {
        StoreKind::Redis => {
            let store = RedisStore::connect(&settings.redis_settings()).await?;
            let limiter = RateLimiter::new(store, config);
            serve(settings.listen, limiter, upstream).await
        }
        StoreKind::Memory => {
            tracing::warn!("using in-memory buckets; limits are not shared across instances");
            let limiter = RateLimiter::new(InMemoryStore::default(), config);
            serve(settings.listen, limiter, upstream).await
        }
    }
}

async fn serve<S>(
    addr: SocketAddr,
    limiter: RateLimiter<S>,
    upstream: Upstream,
) -> Result<(), GatewayError>
where
    S: BucketStore + 'static,
{
    let state = AppState {
        limiter: Arc::new(limiter.with_sink(LogSink)),
        upstream,
    };
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| GatewayError::Bind {
            addr: addr.to_string(),
            source: e,
        })?;

    tracing::info!(addr = %addr, "gateway ready");

    let app = build_router(state).into_make_service_with_connect_info::<SocketAddr>();
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(GatewayError::Serve)
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutting down");
}
