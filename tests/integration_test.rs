// SPDX-FileCopyrightText: 2025 Hyperpolymath
// SPDX-License-Identifier: Apache-2.0

//! Integration tests for the ingress rate limiter.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::ConnectInfo;
use axum::http::{Request, StatusCode};
use tower::ServiceExt;

use ingress_rate_limiter::{
    config::{Config, RateLimitConfig},
    handlers::{router, AppState},
    limiter::RateLimiter,
    metrics::Metrics,
    store::MemoryStore,
};

fn limiter_with(max_requests: u32, window_ms: u64) -> RateLimiter {
    RateLimiter::new(
        RateLimitConfig {
            max_requests,
            window_ms,
            ..Default::default()
        },
        "rl:",
        Arc::new(MemoryStore::new()),
    )
}

#[tokio::test]
async fn test_default_policy_scenario() {
    // 100 requests / 15 minutes from one address
    let limiter = limiter_with(100, 900_000);

    for expected_remaining in (0..100).rev() {
        let decision = limiter.check("1.2.3.4").await;
        assert!(decision.allowed, "request within the window must be allowed");
        assert_eq!(decision.remaining, expected_remaining);
    }

    // 101st request rejects
    let decision = limiter.check("1.2.3.4").await;
    assert!(!decision.allowed);
    assert_eq!(decision.remaining, 0);
}

#[tokio::test]
async fn test_window_elapse_resets_counter() {
    let limiter = limiter_with(2, 40);

    assert!(limiter.check("10.0.0.1").await.allowed);
    assert!(limiter.check("10.0.0.1").await.allowed);
    assert!(!limiter.check("10.0.0.1").await.allowed);

    tokio::time::sleep(Duration::from_millis(60)).await;

    let decision = limiter.check("10.0.0.1").await;
    assert!(decision.allowed, "a fresh window must admit again");
    assert_eq!(decision.remaining, 1, "counter must have reset to 1");
}

#[tokio::test]
async fn test_keys_are_isolated() {
    let limiter = limiter_with(2, 60_000);

    limiter.check("a").await;
    limiter.check("a").await;
    assert!(!limiter.check("a").await.allowed);

    let decision = limiter.check("b").await;
    assert!(decision.allowed);
    assert_eq!(decision.remaining, 1);
}

// HTTP-level tests below exercise the assembled pipeline.

fn app_state(max_requests: u32) -> Arc<AppState> {
    let mut config = Config::default();
    config.rate_limit.max_requests = max_requests;
    config.rate_limit.window_ms = 60_000;
    config.rate_limit.legacy_headers = true;

    let limiter = RateLimiter::new(
        config.rate_limit.clone(),
        config.store.key_prefix.clone(),
        Arc::new(MemoryStore::new()),
    );

    Arc::new(AppState {
        limiter,
        metrics: Metrics::new(),
        config,
    })
}

fn peer() -> ConnectInfo<SocketAddr> {
    ConnectInfo("198.51.100.7:9000".parse().unwrap())
}

fn get(path: &str) -> Request<Body> {
    Request::builder()
        .uri(path)
        .extension(peer())
        .body(Body::empty())
        .unwrap()
}

async fn body_json(response: axum::response::Response) -> serde_json::Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn test_health_endpoint() {
    let app = router(app_state(100));

    let response = app.oneshot(get("/health")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = body_json(response).await;
    assert_eq!(body["status"], "healthy");
}

#[tokio::test]
async fn test_allowed_response_carries_rate_limit_headers() {
    let app = router(app_state(100));

    let response = app.oneshot(get("/")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let headers = response.headers();
    assert_eq!(headers["ratelimit-limit"], "100");
    assert_eq!(headers["ratelimit-remaining"], "99");
    assert!(headers.contains_key("ratelimit-reset"));
    assert_eq!(headers["x-ratelimit-limit"], "100");
}

#[tokio::test]
async fn test_rejection_is_429_with_stable_body() {
    let app = router(app_state(1));

    let response = app.clone().oneshot(get("/")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = app.oneshot(get("/")).await.unwrap();
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    assert!(response.headers().contains_key("retry-after"));
    assert_eq!(response.headers()["ratelimit-remaining"], "0");

    let body = body_json(response).await;
    assert_eq!(body["success"], false);
    assert_eq!(body["message"], "Too many requests. Please try again later.");
}

#[tokio::test]
async fn test_check_endpoint_reports_decision() {
    let app = router(app_state(2));

    let post = |key: &str| {
        Request::builder()
            .method("POST")
            .uri("/check")
            .header("content-type", "application/json")
            .extension(peer())
            .body(Body::from(format!(r#"{{"key":"{key}"}}"#)))
            .unwrap()
    };

    let response = app.clone().oneshot(post("client-9")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["allowed"], true);
    assert_eq!(body["remaining"], 1);

    app.clone().oneshot(post("client-9")).await.unwrap();
    let response = app.oneshot(post("client-9")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["allowed"], false);
    assert_eq!(body["remaining"], 0);
    assert!(body["retry_after_secs"].is_u64());
}

#[tokio::test]
async fn test_check_endpoint_is_not_gated() {
    // One proxy address, a budget of 2, and three calls with distinct
    // client keys: the gate must never charge the proxy itself, so
    // every call answers 200 and every key gets its own fresh window.
    let app = router(app_state(2));

    for i in 0..3 {
        let request = Request::builder()
            .method("POST")
            .uri("/check")
            .header("content-type", "application/json")
            .extension(peer())
            .body(Body::from(format!(r#"{{"key":"client-{i}"}}"#)))
            .unwrap();

        let response = app.clone().oneshot(request).await.unwrap();
        assert_eq!(
            response.status(),
            StatusCode::OK,
            "/check must always return 200 so the proxy can read the decision"
        );
        let body = body_json(response).await;
        assert_eq!(body["allowed"], true);
    }
}
