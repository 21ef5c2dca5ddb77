// SPDX-FileCopyrightText: 2025 Hyperpolymath
// SPDX-License-Identifier: PMPL-1.0-or-later

//! Prometheus metrics for rate limit decisions.

use prometheus::{Encoder, IntCounterVec, Opts, Registry, TextEncoder};

use crate::limiter::Outcome;

/// Metrics registry and counters, owned by the application state.
pub struct Metrics {
    registry: Registry,
    decisions: IntCounterVec,
    store_errors: prometheus::IntCounter,
}

impl Metrics {
    /// Create and register all counters.
    pub fn new() -> Self {
        let registry = Registry::new();

        let decisions = IntCounterVec::new(
            Opts::new(
                "rate_limit_decisions_total",
                "Rate limit decisions by outcome",
            ),
            &["outcome"],
        )
        .unwrap();

        let store_errors = prometheus::IntCounter::new(
            "counter_store_errors_total",
            "Failed round trips to the shared counter store",
        )
        .unwrap();

        registry.register(Box::new(decisions.clone())).unwrap();
        registry.register(Box::new(store_errors.clone())).unwrap();

        Self {
            registry,
            decisions,
            store_errors,
        }
    }

    /// Record a decision outcome.
    pub fn record(&self, outcome: Outcome) {
        self.decisions.with_label_values(&[outcome.as_str()]).inc();
        if matches!(outcome, Outcome::FailedOpen | Outcome::FailedClosed) {
            self.store_errors.inc();
        }
    }

    /// Render all metrics in the Prometheus text format.
    pub fn render(&self) -> String {
        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();
        if encoder
            .encode(&self.registry.gather(), &mut buffer)
            .is_err()
        {
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decisions_appear_in_output() {
        let metrics = Metrics::new();
        metrics.record(Outcome::Allowed);
        metrics.record(Outcome::Allowed);
        metrics.record(Outcome::Limited);
        metrics.record(Outcome::FailedClosed);

        let output = metrics.render();
        assert!(output.contains("rate_limit_decisions_total"));
        assert!(output.contains("counter_store_errors_total"));
    }
}
