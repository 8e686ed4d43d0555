//! Delivery counters for observability.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Process-local delivery counters.
#[derive(Debug, Default)]
pub struct DeliveryMetrics {
    delivered: AtomicU64,
    failed: AtomicU64,
    skipped_duplicates: AtomicU64,
    rate_limited: AtomicU64,
    validation_failures: AtomicU64,
}

impl DeliveryMetrics {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_delivered(&self) {
        self.delivered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_skipped_duplicate(&self) {
        self.skipped_duplicates.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rate_limited(&self) {
        self.rate_limited.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_validation_failure(&self) {
        self.validation_failures.fetch_add(1, Ordering::Relaxed);
    }

    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            delivered: self.delivered.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            skipped_duplicates: self.skipped_duplicates.load(Ordering::Relaxed),
            rate_limited: self.rate_limited.load(Ordering::Relaxed),
            validation_failures: self.validation_failures.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time view of the counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub delivered: u64,
    pub failed: u64,
    pub skipped_duplicates: u64,
    pub rate_limited: u64,
    pub validation_failures: u64,
}
