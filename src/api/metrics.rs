//! Lightweight counters tracking request outcomes and latency so the client
//! can expose aggregated snapshots.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

#[derive(Debug, Default)]
pub(crate) struct RequestMetrics {
    total_requests: AtomicU64,
    total_errors: AtomicU64,
    rate_limited: AtomicU64,
    total_latency_ns: AtomicU64,
}

impl RequestMetrics {
    pub(crate) fn record_success(&self, latency: Duration) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        self.add_latency(latency);
    }

    pub(crate) fn record_failure(&self, latency: Duration) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        self.total_errors.fetch_add(1, Ordering::Relaxed);
        self.add_latency(latency);
    }

    pub(crate) fn record_rate_limited(&self, latency: Duration) {
        self.record_failure(latency);
        self.rate_limited.fetch_add(1, Ordering::Relaxed);
    }

    fn add_latency(&self, latency: Duration) {
        let nanos = latency.as_nanos().min(u128::from(u64::MAX)) as u64;
        self.total_latency_ns.fetch_add(nanos, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> RequestMetricsSnapshot {
        let total_requests = self.total_requests.load(Ordering::Relaxed);
        let total_errors = self.total_errors.load(Ordering::Relaxed);
        let total_latency_ns = self.total_latency_ns.load(Ordering::Relaxed);

        let average_latency_ms = if total_requests == 0 {
            0.0
        } else {
            (total_latency_ns as f64 / total_requests as f64) / 1_000_000.0
        };

        let error_rate = if total_requests == 0 {
            0.0
        } else {
            total_errors as f64 / total_requests as f64
        };

        RequestMetricsSnapshot {
            total_requests,
            total_errors,
            rate_limited: self.rate_limited.load(Ordering::Relaxed),
            average_latency_ms,
            error_rate,
        }
    }
}

#[derive(Debug, Copy, Clone)]
pub struct RequestMetricsSnapshot {
    pub total_requests: u64,
    pub total_errors: u64,
    /// Responses answered with HTTP 429. Also counted in `total_errors`.
    pub rate_limited: u64,
    pub average_latency_ms: f64,
    pub error_rate: f64,
}
