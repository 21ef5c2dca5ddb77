// SPDX-FileCopyrightText: 2025 Hyperpolymath
// SPDX-License-Identifier: PMPL-1.0-or-later

//! HTTP handlers and middleware for the ingress rate limiter.
//!
//! The request pipeline is an explicit ordered chain: panic boundary,
//! trace, request logging, rate-limit gate, then the routes. Every
//! stage either passes the request through or short-circuits with a
//! complete response.

use crate::config::{Config, KeyStrategy};
use crate::limiter::{Decision, RateLimiter};
use crate::metrics::Metrics;
use axum::{
    body::Body,
    extract::{ConnectInfo, Request, State},
    http::{header::HeaderName, HeaderMap, HeaderValue, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

/// Shared application state.
pub struct AppState {
    pub limiter: RateLimiter,
    pub metrics: Metrics,
    pub config: Config,
}

/// Error response body. Stable and machine-parseable; also used for the
/// fail-closed outage path so clients cannot distinguish it from a
/// genuine limit breach.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub success: bool,
    pub message: &'static str,
}

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub service: &'static str,
    pub version: &'static str,
}

/// Rate limit check request (for external validation mode, where a
/// proxy resolves the client key itself).
#[derive(Debug, Deserialize)]
pub struct CheckRequest {
    pub key: String,
}

/// Rate limit check response.
#[derive(Debug, Serialize)]
pub struct CheckResponse {
    pub allowed: bool,
    pub remaining: u32,
    pub reset_at: chrono::DateTime<chrono::Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_secs: Option<u64>,
}

/// Build the service router with the full middleware pipeline.
pub fn router(state: Arc<AppState>) -> Router {
    let mut gated = Router::new()
        .route("/", get(index))
        .route("/health", get(health))
        .route("/healthz", get(health));

    if state.config.metrics.enabled {
        gated = gated.route(&state.config.metrics.path, get(metrics));
    }

    let gated = gated.layer(middleware::from_fn_with_state(state.clone(), rate_limit));

    // External validation mode charges only the caller-resolved key,
    // so /check sits outside the gate: the calling proxy's own address
    // is never counted and the endpoint always answers 200.
    //
    // Layers execute top-down for a request in reverse declaration
    // order: panic boundary outermost, then trace, then logging.
    Router::new()
        .route("/check", post(check))
        .merge(gated)
        .layer(middleware::from_fn(request_log))
        .layer(TraceLayer::new_for_http())
        .layer(CatchPanicLayer::custom(handle_panic))
        .with_state(state)
}

/// Index endpoint.
pub async fn index() -> &'static str {
    "ingress-rate-limiter ready"
}

/// Health check endpoint.
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        service: "ingress-rate-limiter",
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// Prometheus metrics endpoint.
pub async fn metrics(State(state): State<Arc<AppState>>) -> String {
    state.metrics.render()
}

/// Check the rate limit for a caller-resolved client key.
///
/// External validation mode: a reverse proxy calls this once per
/// inbound request and forwards or rejects based on the body. Always
/// returns 200 so the proxy can read the decision.
pub async fn check(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CheckRequest>,
) -> Json<CheckResponse> {
    let decision = state.limiter.check(&req.key).await;
    state.metrics.record(decision.outcome);

    Json(CheckResponse {
        allowed: decision.allowed,
        remaining: decision.remaining,
        reset_at: decision.reset_at,
        retry_after_secs: (!decision.allowed).then(|| decision.retry_after_secs()),
    })
}

/// Request logging stage.
pub async fn request_log(req: Request, next: Next) -> Response {
    info!(method = %req.method(), path = %req.uri().path(), "Received request");
    next.run(req).await
}

/// Rate-limit gate stage.
///
/// Derives the client key, charges the shared counter, and either
/// passes the request through (stamping rate-limit headers on the
/// response) or short-circuits with 429.
pub async fn rate_limit(
    State(state): State<Arc<AppState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    req: Request,
    next: Next,
) -> Response {
    let key = client_key(&state.config.rate_limit.key_strategy, req.headers(), peer);
    let decision = state.limiter.check(&key).await;
    state.metrics.record(decision.outcome);

    if decision.allowed {
        let mut response = next.run(req).await;
        stamp_headers(&state, &decision, response.headers_mut());
        response
    } else {
        warn!(client_key = %key, "Rate limit exceeded");
        let mut response = (
            StatusCode::TOO_MANY_REQUESTS,
            Json(ErrorResponse {
                success: false,
                message: "Too many requests. Please try again later.",
            }),
        )
            .into_response();

        stamp_headers(&state, &decision, response.headers_mut());
        if let Ok(value) = HeaderValue::from_str(&decision.retry_after_secs().to_string()) {
            response
                .headers_mut()
                .insert(HeaderName::from_static("retry-after"), value);
        }
        response
    }
}

/// Derive the client key from the request per the configured strategy.
/// Header-based strategies fall back to the peer address when the
/// header is missing or malformed.
pub fn client_key(strategy: &KeyStrategy, headers: &HeaderMap, peer: SocketAddr) -> String {
    let from_header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    };

    match strategy {
        KeyStrategy::SourceIp => peer.ip().to_string(),
        KeyStrategy::ForwardedFor => {
            from_header("x-forwarded-for").unwrap_or_else(|| peer.ip().to_string())
        }
        KeyStrategy::Header(name) => from_header(name).unwrap_or_else(|| peer.ip().to_string()),
    }
}

/// Stamp rate-limit headers on a response.
fn stamp_headers(state: &AppState, decision: &Decision, headers: &mut HeaderMap) {
    let policy = &state.config.rate_limit;
    let insert = |headers: &mut HeaderMap, name: HeaderName, value: String| {
        if let Ok(value) = HeaderValue::from_str(&value) {
            headers.insert(name, value);
        }
    };

    if policy.standard_headers {
        insert(
            headers,
            HeaderName::from_static("ratelimit-limit"),
            state.limiter.limit().to_string(),
        );
        insert(
            headers,
            HeaderName::from_static("ratelimit-remaining"),
            decision.remaining.to_string(),
        );
        insert(
            headers,
            HeaderName::from_static("ratelimit-reset"),
            decision.retry_after_secs().to_string(),
        );
    }

    if policy.legacy_headers {
        insert(
            headers,
            HeaderName::from_static("x-ratelimit-limit"),
            state.limiter.limit().to_string(),
        );
        insert(
            headers,
            HeaderName::from_static("x-ratelimit-remaining"),
            decision.remaining.to_string(),
        );
        // Legacy variant reports the reset as an epoch timestamp
        insert(
            headers,
            HeaderName::from_static("x-ratelimit-reset"),
            decision.reset_at.timestamp().to_string(),
        );
    }
}

/// Panic/error boundary. Any uncaught failure from downstream stages is
/// logged with its details and mapped to a generic 500 body; internals
/// never leak to the client.
pub fn handle_panic(err: Box<dyn std::any::Any + Send + 'static>) -> Response<Body> {
    let detail = if let Some(s) = err.downcast_ref::<String>() {
        s.as_str()
    } else if let Some(s) = err.downcast_ref::<&str>() {
        s
    } else {
        "unknown panic"
    };
    error!(error = %detail, "Unhandled failure in request pipeline");

    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ErrorResponse {
            success: false,
            message: "Internal server error",
        }),
    )
        .into_response()
}
