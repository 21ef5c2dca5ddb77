// SPDX-FileCopyrightText: 2025 Hyperpolymath
// SPDX-License-Identifier: PMPL-1.0-or-later

//! Configuration for the ingress rate limiter.
//!
//! Defaults mirror the classic ingress policy: 100 requests per IP per
//! 15-minute window, fail-closed when the counter store is unreachable.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Configuration for the ingress rate limiter service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Server bind address (default: 0.0.0.0:8080)
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// Counter store configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// Rate limiting configuration
    #[serde(default)]
    pub rate_limit: RateLimitConfig,

    /// Metrics configuration
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Counter store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Store backend (default: redis)
    #[serde(default)]
    pub backend: StoreBackend,

    /// Store connection URL (default: redis://127.0.0.1:6379)
    #[serde(default = "default_store_url")]
    pub url: String,

    /// Namespace prefix for counter keys (default: rl:)
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
}

/// Available counter store backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// Shared Redis counters; required for multi-replica enforcement
    #[default]
    Redis,
    /// Process-local counters; single instance or tests only
    Memory,
}

/// Fixed-window rate limiting policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Window duration in milliseconds (default: 900000, i.e. 15 minutes)
    #[serde(default = "default_window_ms")]
    pub window_ms: u64,

    /// Maximum requests per client key per window (default: 100)
    #[serde(default = "default_max_requests")]
    pub max_requests: u32,

    /// Allow traffic through when the counter store is unreachable
    /// (default: false, i.e. fail closed)
    #[serde(default)]
    pub fail_open: bool,

    /// How the client key is derived from a request (default: source-ip)
    #[serde(default)]
    pub key_strategy: KeyStrategy,

    /// Emit draft-standard RateLimit-* response headers (default: true)
    #[serde(default = "default_true")]
    pub standard_headers: bool,

    /// Emit legacy X-RateLimit-* response headers (default: false)
    #[serde(default)]
    pub legacy_headers: bool,
}

/// Strategy for deriving the client key from a request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum KeyStrategy {
    /// Peer socket address
    #[default]
    SourceIp,
    /// First entry of X-Forwarded-For, falling back to the socket address
    ForwardedFor,
    /// A named request header, falling back to the socket address
    Header(String),
}

/// Metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Enable Prometheus metrics endpoint (default: true)
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Metrics endpoint path (default: /metrics)
    #[serde(default = "default_metrics_path")]
    pub path: String,
}

/// Configuration validation errors. Fatal at startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("window_ms must be positive")]
    NonPositiveWindow,

    #[error("max_requests must be positive")]
    NonPositiveMax,

    #[error("key_strategy header name must not be empty")]
    EmptyHeaderName,
}

// Default value functions
fn default_bind_addr() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_store_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

fn default_key_prefix() -> String {
    "rl:".to_string()
}

fn default_window_ms() -> u64 {
    900_000 // 15 minutes
}

fn default_max_requests() -> u32 {
    100
}

fn default_true() -> bool {
    true
}

fn default_metrics_path() -> String {
    "/metrics".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            store: StoreConfig::default(),
            rate_limit: RateLimitConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            url: default_store_url(),
            key_prefix: default_key_prefix(),
        }
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            window_ms: default_window_ms(),
            max_requests: default_max_requests(),
            fail_open: false,
            key_strategy: KeyStrategy::default(),
            standard_headers: default_true(),
            legacy_headers: false,
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            path: default_metrics_path(),
        }
    }
}

impl RateLimitConfig {
    /// Get the window duration
    pub fn window_duration(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }
}

impl Config {
    /// Validate the policy. Must be called before the listener binds;
    /// an invalid policy must never accept traffic.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.rate_limit.window_ms == 0 {
            return Err(ConfigError::NonPositiveWindow);
        }
        if self.rate_limit.max_requests == 0 {
            return Err(ConfigError::NonPositiveMax);
        }
        if let KeyStrategy::Header(name) = &self.rate_limit.key_strategy {
            if name.trim().is_empty() {
                return Err(ConfigError::EmptyHeaderName);
            }
        }
        Ok(())
    }
}
