// SPDX-FileCopyrightText: 2025 Hyperpolymath
// SPDX-License-Identifier: PMPL-1.0-or-later

//! Ingress Rate Limiter
//!
//! This crate provides a distributed fixed-window request rate limiter
//! for HTTP ingress:
//!
//! - 100 requests per client per 15-minute window (default)
//! - Counters held in a shared store (Redis), so any number of service
//!   replicas enforce one consistent global limit
//! - Configurable client-key derivation (source IP, X-Forwarded-For,
//!   arbitrary header)
//! - Explicit fail-open/fail-closed behavior on store outage
//! - 429 responses with standard and legacy rate-limit headers

pub mod config;
pub mod handlers;
pub mod limiter;
pub mod metrics;
pub mod store;

pub use config::Config;
pub use limiter::{Decision, Outcome, RateLimiter};
pub use store::{CounterStore, MemoryStore, RedisStore, StoreError};
