//! Forwarding of admitted `/api/**` requests to the upstream API server.

use crate::error::GatewayError;
use axum::body::Body;
use axum::extract::Request;
use axum::response::{IntoResponse, Response};
use axum::Json;
use http::header::{self, HeaderMap, HeaderName};
use http::{StatusCode, Uri};
use serde_json::json;

/// Request bodies above this size are refused with 413.
pub const MAX_BODY_BYTES: usize = 8 * 1024 * 1024;

/// Hop-by-hop headers that must not cross the proxy.
static HOP_BY_HOP: [HeaderName; 7] = [
    header::CONNECTION,
    header::PROXY_AUTHENTICATE,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
];

#[derive(Debug, Clone)]
pub struct Upstream {
    client: reqwest::Client,
    base: String,
}

impl Upstream {
    pub fn new(base_url: &str) -> Result<Self, GatewayError> {
        let invalid = |reason: String| GatewayError::Upstream {
            url: base_url.to_string(),
            reason,
        };
        let parsed: Uri = base_url
            .parse()
            .map_err(|e: http::uri::InvalidUri| invalid(e.to_string()))?;
        if parsed.scheme().is_none() || parsed.authority().is_none() {
            return Err(invalid("expected an absolute http(s) URL".to_string()));
        }
        Ok(Self {
            client: reqwest::Client::new(),
            base: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn base(&self) -> &str {
        &self.base
    }

    /// Upstream URL for `uri` with its first path segment removed.
    pub fn target(&self, uri: &Uri) -> String {
        let stripped = strip_first_segment(uri.path());
        match uri.query() {
            Some(query) => format!("{}{}?{}", self.base, stripped, query),
            None => format!("{}{}", self.base, stripped),
        }
    }

    pub async fn forward(&self, req: Request) -> Response {
        let target = self.target(req.uri());
        let (parts, body) = req.into_parts();
        let body = match axum::body::to_bytes(body, MAX_BODY_BYTES).await {
            Ok(bytes) => bytes,
            Err(_) => return StatusCode::PAYLOAD_TOO_LARGE.into_response(),
        };

        let mut headers = parts.headers;
        strip_hop_by_hop(&mut headers);
        headers.remove(header::HOST);

        let sent = self
            .client
            .request(parts.method, &target)
            .headers(headers)
            .body(body)
            .send()
            .await;
        let upstream = match sent {
            Ok(upstream) => upstream,
            Err(err) => {
                tracing::warn!(target = %target, error = %err, "upstream request failed");
                return bad_gateway();
            }
        };

        let status = upstream.status();
        let mut headers = upstream.headers().clone();
        strip_hop_by_hop(&mut headers);
        headers.remove(header::CONTENT_LENGTH);
        match upstream.bytes().await {
            Ok(bytes) => {
                let mut response = Response::new(Body::from(bytes));
                *response.status_mut() = status;
                *response.headers_mut() = headers;
                response
            }
            Err(err) => {
                tracing::warn!(target = %target, error = %err, "upstream body failed");
                bad_gateway()
            }
        }
    }
}

fn strip_first_segment(path: &str) -> &str {
    let trimmed = path.strip_prefix('/').unwrap_or(path);
    match trimmed.find('/') {
        Some(idx) => &trimmed[idx..],
        None => "/",
    }
}

fn strip_hop_by_hop(headers: &mut HeaderMap) {
    for name in HOP_BY_HOP.iter() {
        headers.remove(name);
    }
}

fn bad_gateway() -> Response {
    let body = Json(json!({ "error": "Upstream unavailable" }));
    (StatusCode::BAD_GATEWAY, body).into_response()
}
