//! HTTP admission layer.
//!
//! [`AdmissionLayer`] wraps any `tower::Service<http::Request<_>>`. Each request is
//! attributed to a client, charged one token, and either forwarded or answered
//! with `429 Too Many Requests`:
//!
//! - Admitted responses carry `X-RateLimit-Limit` and `X-RateLimit-Remaining`.
//! - Rejected responses carry both headers, `Retry-After` (whole seconds, rounded
//!   up) and the JSON body `{"error":"Rate limit exceeded","clientId":"..."}`.
//!
//! Store failures never surface as errors here; the limiter's failure policy
//! decides.

use crate::limiter::{Admission, RateLimiter};
use crate::store::BucketStore;
use crate::telemetry::TelemetrySink;
use http::header::{HeaderName, HeaderValue, CONTENT_TYPE, RETRY_AFTER};
use http::{Request, Response, StatusCode};
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tower_layer::Layer;
use tower_service::Service;

pub static RATE_LIMIT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
pub static RATE_LIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");

const FORWARDED_FOR: &str = "x-forwarded-for";
const UNKNOWN_CLIENT: &str = "unknown";

/// Transport-level peer address, inserted as a request extension by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerAddr(pub SocketAddr);

/// Client identity for a request: the first `X-Forwarded-For` entry, else the
/// [`PeerAddr`] extension's IP, else `"unknown"`.
pub fn client_identity<B>(req: &Request<B>) -> String {
    let forwarded = req
        .headers()
        .get(FORWARDED_FOR)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty());
    if let Some(first) = forwarded {
        return first.to_string();
    }
    req.extensions()
        .get::<PeerAddr>()
        .map(|peer| peer.0.ip().to_string())
        .unwrap_or_else(|| UNKNOWN_CLIENT.to_string())
}

/// Whole seconds for `Retry-After`: rounded up, at least 1.
fn retry_after_secs(admission: &Admission) -> u64 {
    let millis = admission.retry_after.map_or(0, |d| d.as_millis());
    let secs = u64::try_from(millis.div_ceil(1000)).unwrap_or(u64::MAX);
    secs.max(1)
}

fn rejection_body(client_id: &str) -> String {
    serde_json::json!({ "error": "Rate limit exceeded", "clientId": client_id }).to_string()
}

fn set_rate_headers(headers: &mut http::HeaderMap, admission: &Admission) {
    let limit = HeaderValue::from(admission.limit);
    let remaining = HeaderValue::from(admission.remaining);
    headers.insert(RATE_LIMIT_LIMIT.clone(), limit);
    headers.insert(RATE_LIMIT_REMAINING.clone(), remaining);
}

fn reject<ResBody: From<String>>(client_id: &str, admission: &Admission) -> Response<ResBody> {
    let mut response = Response::new(ResBody::from(rejection_body(client_id)));
    *response.status_mut() = StatusCode::TOO_MANY_REQUESTS;
    let headers = response.headers_mut();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    set_rate_headers(headers, admission);
    headers.insert(RETRY_AFTER, HeaderValue::from(retry_after_secs(admission)));
    response
}

/// Layer that puts a [`RateLimiter`] in front of an HTTP service.
pub struct AdmissionLayer<S, T> {
    limiter: Arc<RateLimiter<S, T>>,
}

impl<S, T> AdmissionLayer<S, T> {
    pub fn new(limiter: Arc<RateLimiter<S, T>>) -> Self {
        Self { limiter }
    }
}

impl<S, T> Clone for AdmissionLayer<S, T> {
    fn clone(&self) -> Self {
        Self {
            limiter: self.limiter.clone(),
        }
    }
}

impl<Svc, S, T> Layer<Svc> for AdmissionLayer<S, T> {
    type Service = AdmissionService<Svc, S, T>;

    fn layer(&self, inner: Svc) -> Self::Service {
        AdmissionService {
            inner,
            limiter: self.limiter.clone(),
        }
    }
}

pub struct AdmissionService<Svc, S, T> {
    inner: Svc,
    limiter: Arc<RateLimiter<S, T>>,
}

impl<Svc: Clone, S, T> Clone for AdmissionService<Svc, S, T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            limiter: self.limiter.clone(),
        }
    }
}

impl<Svc, S, T, ReqBody, ResBody> Service<Request<ReqBody>> for AdmissionService<Svc, S, T>
where
    Svc: Service<Request<ReqBody>, Response = Response<ResBody>> + Clone + Send + 'static,
    Svc::Future: Send + 'static,
    S: BucketStore + 'static,
    T: TelemetrySink,
    T::Future: Send + 'static,
    ReqBody: Send + 'static,
    ResBody: From<String> + Send + 'static,
{
    type Response = Response<ResBody>;
    type Error = Svc::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<ReqBody>) -> Self::Future {
        let limiter = self.limiter.clone();
        // Drive the instance that was polled ready; leave a fresh clone behind.
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);

        Box::pin(async move {
            let client_id = client_identity(&req);
            let admission = limiter.admit(&client_id).await;
            if !admission.admitted {
                tracing::info!(client = %client_id, "rate limit exceeded");
                return Ok(reject(&client_id, &admission));
            }
            let mut response = inner.call(req).await?;
            set_rate_headers(response.headers_mut(), &admission);
            Ok(response)
        })
    }
}
