//! Axum layer: resolve the profile, count, set headers, reject over-limit requests.
//! Limiter errors never block a request.

use axum::{
    extract::{ConnectInfo, Request, State},
    http::{HeaderMap, HeaderName, HeaderValue, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use metrics::counter;
use std::net::SocketAddr;
use std::sync::Arc;

use crate::ratelimit::{client_id, profile_for, Decision, RateLimiter};

pub const HEADER_LIMIT: &str = "x-ratelimit-limit";
pub const HEADER_REMAINING: &str = "x-ratelimit-remaining";
pub const HEADER_RESET: &str = "x-ratelimit-reset";

pub async fn rate_limit(
    State(limiter): State<Arc<RateLimiter>>,
    req: Request,
    next: Next,
) -> Response {
    let Some(profile) = profile_for(req.method(), req.uri().path()) else {
        return next.run(req).await;
    };

    let forwarded = req
        .headers()
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok());
    let peer = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ci| ci.0.ip().to_string());
    let client = client_id(forwarded, peer.as_deref());

    let decision = match limiter.check(profile, &client).await {
        Ok(d) => d,
        Err(e) => {
            tracing::warn!(target: "ratelimit", error = %e, profile = profile.as_str(), "limiter failed, allowing request");
            counter!("ratelimit_fail_open_total").increment(1);
            return next.run(req).await;
        }
    };

    if !decision.allowed {
        counter!("ratelimit_rejected_total", "profile" => profile.as_str()).increment(1);
        tracing::debug!(target: "ratelimit", %client, profile = profile.as_str(), "request rejected");
        let body = Json(serde_json::json!({
            "error": crate::error::ErrorKind::RateLimited.as_str(),
            "message": "too many requests",
            "retryAfterSeconds": decision.retry_after_secs,
        }));
        let mut resp = (StatusCode::TOO_MANY_REQUESTS, body).into_response();
        apply_headers(resp.headers_mut(), &decision);
        if let Ok(v) = HeaderValue::from_str(&decision.retry_after_secs.to_string()) {
            resp.headers_mut().insert(axum::http::header::RETRY_AFTER, v);
        }
        return resp;
    }

    let mut resp = next.run(req).await;
    apply_headers(resp.headers_mut(), &decision);
    resp
}

fn apply_headers(headers: &mut HeaderMap, d: &Decision) {
    for (name, value) in [
        (HEADER_LIMIT, d.limit),
        (HEADER_REMAINING, d.remaining),
        (HEADER_RESET, d.reset_at),
    ] {
        if let Ok(v) = HeaderValue::from_str(&value.to_string()) {
            headers.insert(HeaderName::from_static(name), v);
        }
    }
}
