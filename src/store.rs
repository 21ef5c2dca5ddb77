// SPDX-FileCopyrightText: 2025 Hyperpolymath
// SPDX-License-Identifier: PMPL-1.0-or-later

//! Counter store backends.
//!
//! The limiter delegates all counter state to a [`CounterStore`]: an
//! atomic increment-with-expiry capability. The store's increment is the
//! sole serialization point for a client key; the limiter itself holds
//! no locks and no mutable state.
//!
//! Two backends:
//! - [`RedisStore`]: shared counters, required for multi-replica
//!   enforcement of one global limit.
//! - [`MemoryStore`]: process-local counters for single-instance
//!   deployments and tests.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, warn};

/// Counter state observed after an increment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowState {
    /// Counter value after this increment
    pub count: u64,
    /// Time until the window expires
    pub ttl: Duration,
}

/// Store failures. Never escapes the limiter's public call; resolved
/// there per the fail-open flag.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("counter store unavailable: {0}")]
    Unavailable(String),
}

impl From<redis::RedisError> for StoreError {
    fn from(err: redis::RedisError) -> Self {
        StoreError::Unavailable(err.to_string())
    }
}

/// Atomic increment-with-expiry capability backing the limiter.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Atomically increment the counter at `key`, creating it at 1 with
    /// an expiry of `window` if absent. Returns the post-increment count
    /// and the remaining window TTL.
    async fn incr(&self, key: &str, window: Duration) -> Result<WindowState, StoreError>;
}

/// Redis-backed counter store.
///
/// Holds one multiplexed connection handle, cheaply cloned per call and
/// shared concurrently across all request tasks. The manager reconnects
/// in the background after an outage.
#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
}

impl RedisStore {
    /// Connect to the store at `url`.
    ///
    /// Fails if the store is unreachable; an unreachable store at
    /// startup is a deployment error, unlike a mid-flight outage.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(url)?;
        let conn = client.get_connection_manager().await?;
        debug!(url = %url, "Connected to counter store");
        Ok(Self { conn })
    }
}

#[async_trait]
impl CounterStore for RedisStore {
    async fn incr(&self, key: &str, window: Duration) -> Result<WindowState, StoreError> {
        let mut conn = self.conn.clone();
        let window_ms = window.as_millis() as i64;

        let count: u64 = conn.incr(key, 1u64).await?;
        if count == 1 {
            // First hit of a fresh window. Setting the expiry twice is
            // harmless, so a concurrent first-hit does not need fencing.
            let _: i64 = conn.pexpire(key, window_ms).await?;
        }

        let ttl_ms: i64 = conn.pttl(key).await?;
        let ttl = if ttl_ms < 0 {
            // Counter exists without an expiry: the create-time PEXPIRE
            // was lost (e.g. a crash between INCR and PEXPIRE). Re-arm.
            warn!(key = %key, "Counter had no expiry, re-arming window");
            let _: i64 = conn.pexpire(key, window_ms).await?;
            window
        } else {
            Duration::from_millis(ttl_ms as u64)
        };

        Ok(WindowState { count, ttl })
    }
}

/// Entry in the in-memory store.
#[derive(Debug)]
struct MemoryEntry {
    count: u64,
    expires_at: Instant,
}

/// Process-local counter store.
///
/// Counters live in a map guarded by an async lock; expired entries are
/// reset lazily on the next increment rather than swept.
#[derive(Default)]
pub struct MemoryStore {
    counters: RwLock<HashMap<String, MemoryEntry>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CounterStore for MemoryStore {
    async fn incr(&self, key: &str, window: Duration) -> Result<WindowState, StoreError> {
        let now = Instant::now();
        let mut counters = self.counters.write().await;

        let entry = counters
            .entry(key.to_string())
            .and_modify(|e| {
                if e.expires_at <= now {
                    // Window elapsed; this hit opens a fresh one
                    e.count = 0;
                    e.expires_at = now + window;
                }
            })
            .or_insert_with(|| MemoryEntry {
                count: 0,
                expires_at: now + window,
            });

        entry.count += 1;
        Ok(WindowState {
            count: entry.count,
            ttl: entry.expires_at.saturating_duration_since(now),
        })
    }
}
