// SPDX-FileCopyrightText: 2025 Hyperpolymath
// SPDX-License-Identifier: PMPL-1.0-or-later

//! Ingress Rate Limiter Service
//!
//! A distributed fixed-window rate limiter for HTTP ingress. All
//! counter state lives in a shared store, so multiple replicas enforce
//! one consistent global limit.
//!
//! ## Configuration
//!
//! Configuration is loaded from environment variables:
//!
//! - `BIND_ADDR`: Server bind address (default: 0.0.0.0:8080)
//! - `STORE_BACKEND`: `redis` or `memory` (default: redis)
//! - `REDIS_URL`: Counter store URL (default: redis://127.0.0.1:6379)
//! - `KEY_PREFIX`: Counter key namespace (default: rl:)
//! - `WINDOW_MS`: Window duration in milliseconds (default: 900000)
//! - `MAX_REQUESTS`: Max requests per key per window (default: 100)
//! - `FAIL_OPEN`: Allow traffic on store outage (default: false)
//! - `KEY_STRATEGY`: `source-ip`, `forwarded-for`, or `header:<name>`

use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use ingress_rate_limiter::{
    config::{Config, KeyStrategy, StoreBackend},
    handlers::{router, AppState},
    limiter::RateLimiter,
    metrics::Metrics,
    store::{CounterStore, MemoryStore, RedisStore},
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(fmt::layer().json())
        .with(
            EnvFilter::builder()
                .with_default_directive(Level::INFO.into())
                .from_env_lossy(),
        )
        .init();

    // Load and validate configuration; an invalid policy must never
    // accept traffic
    let config = load_config();
    config.validate()?;
    info!(
        bind_addr = %config.bind_addr,
        window_ms = config.rate_limit.window_ms,
        max_requests = config.rate_limit.max_requests,
        fail_open = config.rate_limit.fail_open,
        backend = ?config.store.backend,
        "Starting ingress rate limiter"
    );

    // Connect the counter store
    let store: Arc<dyn CounterStore> = match config.store.backend {
        StoreBackend::Redis => Arc::new(RedisStore::connect(&config.store.url).await?),
        StoreBackend::Memory => Arc::new(MemoryStore::new()),
    };

    // Create application state
    let limiter = RateLimiter::new(
        config.rate_limit.clone(),
        config.store.key_prefix.clone(),
        store,
    );

    let state = Arc::new(AppState {
        limiter,
        metrics: Metrics::new(),
        config: config.clone(),
    });

    // Build router and start server
    let app = router(state);
    let addr: SocketAddr = config.bind_addr.parse()?;
    let listener = TcpListener::bind(addr).await?;
    info!(addr = %addr, "Server listening");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(())
}

/// Load configuration from environment variables.
fn load_config() -> Config {
    let mut config = Config::default();

    if let Ok(addr) = std::env::var("BIND_ADDR") {
        config.bind_addr = addr;
    }
    if let Ok(backend) = std::env::var("STORE_BACKEND") {
        config.store.backend = parse_store_backend(&backend);
    }
    if let Ok(url) = std::env::var("REDIS_URL") {
        config.store.url = url;
    }
    if let Ok(prefix) = std::env::var("KEY_PREFIX") {
        config.store.key_prefix = prefix;
    }
    if let Some(window_ms) = env_parse("WINDOW_MS") {
        config.rate_limit.window_ms = window_ms;
    }
    if let Some(max) = env_parse("MAX_REQUESTS") {
        config.rate_limit.max_requests = max;
    }
    if let Some(fail_open) = env_parse("FAIL_OPEN") {
        config.rate_limit.fail_open = fail_open;
    }
    if let Ok(strategy) = std::env::var("KEY_STRATEGY") {
        config.rate_limit.key_strategy = parse_key_strategy(&strategy);
    }

    config
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    let value = std::env::var(name).ok()?;
    parse_env_value(name, &value)
}

/// Parse an environment value, warning on garbage instead of silently
/// keeping the default.
fn parse_env_value<T: std::str::FromStr>(name: &str, value: &str) -> Option<T> {
    match value.parse() {
        Ok(parsed) => Some(parsed),
        Err(_) => {
            warn!(var = name, value = %value, "Ignoring unparseable environment variable");
            None
        }
    }
}

fn parse_store_backend(value: &str) -> StoreBackend {
    if value.eq_ignore_ascii_case("memory") {
        StoreBackend::Memory
    } else {
        if !value.eq_ignore_ascii_case("redis") {
            warn!(value = %value, "Unrecognized STORE_BACKEND, using redis");
        }
        StoreBackend::Redis
    }
}

fn parse_key_strategy(value: &str) -> KeyStrategy {
    match value.to_ascii_lowercase().as_str() {
        "forwarded-for" => KeyStrategy::ForwardedFor,
        other => match other.strip_prefix("header:") {
            Some(name) => KeyStrategy::Header(name.to_string()),
            None => KeyStrategy::SourceIp,
        },
    }
}
