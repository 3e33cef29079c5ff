//! Axum router for the gateway.
//! Routes: `GET /gateway/health`, `GET /gateway/rate-limit/status`, and `/api`
//! plus everything below it (rate limited, then proxied upstream).

use crate::proxy::Upstream;
use axum::extract::{ConnectInfo, Request, State};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get};
use axum::{Json, Router};
use bucketgate::{
    client_identity, AdmissionLayer, BucketStore, PeerAddr, RateLimiter, TelemetrySink,
};
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;

/// Shared state threaded through the gateway handlers.
pub struct AppState<S, T> {
    pub limiter: Arc<RateLimiter<S, T>>,
    pub upstream: Upstream,
}

impl<S, T> Clone for AppState<S, T> {
    fn clone(&self) -> Self {
        Self {
            limiter: self.limiter.clone(),
            upstream: self.upstream.clone(),
        }
    }
}

pub fn build_router<S, T>(state: AppState<S, T>) -> Router
where
    S: BucketStore + 'static,
    T: TelemetrySink,
    T::Future: Send + 'static,
{
    let api = Router::new()
        .route("/api", any(handle_proxy::<S, T>))
        .route("/api/*rest", any(handle_proxy::<S, T>))
        .layer(AdmissionLayer::new(state.limiter.clone()));

    Router::new()
        .route("/gateway/health", get(handle_health))
        .route("/gateway/rate-limit/status", get(handle_status::<S, T>))
        .merge(api)
        .with_state(state)
        .layer(middleware::from_fn(attach_peer_addr))
}

/// Copy the socket peer from `ConnectInfo` into the extension the limiter reads.
async fn attach_peer_addr(mut req: Request, next: Next) -> Response {
    if let Some(ConnectInfo(addr)) = req.extensions().get::<ConnectInfo<SocketAddr>>().copied() {
        req.extensions_mut().insert(PeerAddr(addr));
    }
    next.run(req).await
}

async fn handle_health() -> impl IntoResponse {
    Json(json!({"status": "UP", "service": "Rate Limiter Gateway"}))
}

async fn handle_status<S, T>(State(state): State<AppState<S, T>>, req: Request) -> Response
where
    S: BucketStore + 'static,
    T: TelemetrySink,
    T::Future: Send + 'static,
{
    let client_id = client_identity(&req);
    match state.limiter.status(&client_id).await {
        Ok(status) => Json(json!({
            "clientId": status.client_id,
            "capacity": status.capacity,
            "availableTokens": status.available_tokens,
        }))
        .into_response(),
        Err(err) => {
            tracing::warn!(client = %client_id, error = %err, "status lookup failed");
            let body = json!({"error": "Rate limiter store unavailable", "clientId": client_id});
            (StatusCode::SERVICE_UNAVAILABLE, Json(body)).into_response()
        }
    }
}

async fn handle_proxy<S, T>(State(state): State<AppState<S, T>>, req: Request) -> Response {
    state.upstream.forward(req).await
}
