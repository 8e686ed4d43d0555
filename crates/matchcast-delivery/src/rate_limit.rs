//! Sliding-window rate limiting over the durable store.
//!
//! Buckets are JSON arrays of epoch-millisecond timestamps under
//! `rate_limit_<sanitized_identifier>_<window_ms>`. The limiter favors
//! availability over strict quota correctness: corrupt buckets are reset
//! rather than raised, persistence failures fail open, and an identifier
//! whose failure counter trips the breaker bypasses enforcement entirely
//! until a cooldown elapses.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::store::{Clock, Store};

/// Failure count above which enforcement is bypassed for an identifier.
pub const FAILURE_BYPASS_THRESHOLD: u32 = 5;

/// Cooldown after which a tripped failure counter resets.
pub const FAILURE_COOLDOWN_SECS: i64 = 300;

/// Store key of the global corruption counter.
pub const CORRUPTION_COUNTER_KEY: &str = "rate_limit_corruption_count";

const WRITE_RETRY_ATTEMPTS: u32 = 3;
const WRITE_RETRY_DELAY_MS: u64 = 25;
const MAX_IDENTIFIER_LEN: usize = 50;

/// Outcome of a permit check.
#[derive(Debug, Clone, Serialize)]
pub struct RateLimitDecision {
    pub allowed: bool,
    /// Permits left in the deciding window after this check.
    pub remaining: u32,
    /// When the oldest tracked permit leaves the window.
    pub reset_time: DateTime<Utc>,
    /// Window size that produced this decision.
    pub window_ms: i64,
    /// True when the circuit breaker skipped enforcement entirely.
    pub bypassed: bool,
}

/// A named enforcement window for multi-window checks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WindowLimit {
    pub name: String,
    pub max: u32,
    pub window_ms: i64,
}

impl WindowLimit {
    #[must_use]
    pub fn new(name: impl Into<String>, max: u32, window_ms: i64) -> Self {
        Self {
            name: name.into(),
            max,
            window_ms,
        }
    }

    #[must_use]
    pub fn per_second(max: u32) -> Self {
        Self::new("per_second", max, 1_000)
    }

    #[must_use]
    pub fn per_minute(max: u32) -> Self {
        Self::new("per_minute", max, 60_000)
    }

    #[must_use]
    pub fn per_hour(max: u32) -> Self {
        Self::new("per_hour", max, 3_600_000)
    }
}

/// Per-identifier failure bookkeeping for the circuit breaker.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct FailureCounter {
    count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    opened_at: Option<DateTime<Utc>>,
}

/// Sliding-window rate limiter persisted in the shared store.
#[derive(Clone)]
pub struct RateLimiter {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
}

impl RateLimiter {
    #[must_use]
    pub fn new(store: Arc<dyn Store>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Check and consume one permit for `identifier` within a sliding window.
    ///
    /// A denied check does not consume a permit. Storage trouble never denies:
    /// corrupt buckets are healed to empty and write failures fail open.
    pub async fn check(&self, identifier: &str, max: u32, window_ms: i64) -> RateLimitDecision {
        let sanitized = sanitize_identifier(identifier);
        let now = self.clock.now();

        if self.bypass_active(&sanitized, now).await {
            return RateLimitDecision {
                allowed: true,
                remaining: max,
                reset_time: now,
                window_ms,
                bypassed: true,
            };
        }

        let key = bucket_key(&sanitized, window_ms);
        let now_ms = now.timestamp_millis();
        let mut timestamps = self.load_bucket(&key, now_ms).await;

        let cutoff = now_ms - window_ms;
        timestamps.retain(|t| *t > cutoff);

        let allowed = (timestamps.len() as u32) < max;
        if allowed {
            timestamps.push(now_ms);
            self.persist_bucket(&sanitized, &key, &timestamps).await;
        } else {
            tracing::debug!(
                target: "rate_limit",
                identifier = %sanitized,
                window_ms,
                max,
                "Permit denied"
            );
        }

        let remaining = max.saturating_sub(timestamps.len() as u32);
        let reset_time = timestamps
            .first()
            .map(|oldest| ms_to_datetime(*oldest + window_ms))
            .unwrap_or(now);

        RateLimitDecision {
            allowed,
            remaining,
            reset_time,
            window_ms,
            bypassed: false,
        }
    }

    /// Check several named windows at once. The first window to deny wins and
    /// later windows are not consulted; when all allow, the decision with the
    /// fewest remaining permits is returned.
    pub async fn check_windows(
        &self,
        identifier: &str,
        windows: &[WindowLimit],
    ) -> RateLimitDecision {
        let mut tightest: Option<RateLimitDecision> = None;

        for window in windows {
            let decision = self.check(identifier, window.max, window.window_ms).await;
            if !decision.allowed {
                tracing::debug!(
                    target: "rate_limit",
                    identifier,
                    window = %window.name,
                    "Window denied, short-circuiting remaining checks"
                );
                return decision;
            }
            let replace = tightest
                .as_ref()
                .map(|t| decision.remaining < t.remaining)
                .unwrap_or(true);
            if replace {
                tightest = Some(decision);
            }
        }

        tightest.unwrap_or(RateLimitDecision {
            allowed: true,
            remaining: u32::MAX,
            reset_time: self.clock.now(),
            window_ms: 0,
            bypassed: false,
        })
    }

    /// Current failure count for an identifier (observability).
    pub async fn failure_count(&self, identifier: &str) -> u32 {
        let sanitized = sanitize_identifier(identifier);
        self.load_failures(&sanitized).await.count
    }

    /// Total corrupt-bucket resets seen by this store (observability).
    pub async fn corruption_count(&self) -> u64 {
        match self.store.get(CORRUPTION_COUNTER_KEY).await {
            Ok(Some(raw)) => raw.trim().parse().unwrap_or(0),
            _ => 0,
        }
    }

    // -- internals ----------------------------------------------------------

    /// Load a bucket, healing corruption by resetting to empty.
    async fn load_bucket(&self, key: &str, now_ms: i64) -> Vec<i64> {
        let raw = match self.store.get(key).await {
            Ok(Some(raw)) => raw,
            Ok(None) => return Vec::new(),
            Err(e) => {
                // Fail open: an unreadable bucket must not deny the request.
                tracing::warn!(
                    target: "rate_limit",
                    key,
                    error = %e,
                    "Bucket read failed, treating as empty"
                );
                return Vec::new();
            }
        };

        match parse_bucket(&raw, now_ms) {
            Some(timestamps) => timestamps,
            None => {
                self.heal_corrupt_bucket(key).await;
                Vec::new()
            }
        }
    }

    async fn heal_corrupt_bucket(&self, key: &str) {
        tracing::warn!(
            target: "rate_limit",
            key,
            "Corrupt bucket data, resetting to empty"
        );
        let _ = self.store.delete(key).await;

        let next = self.corruption_count().await.saturating_add(1);
        if let Err(e) = self.store.put(CORRUPTION_COUNTER_KEY, &next.to_string()).await {
            tracing::debug!(
                target: "rate_limit",
                error = %e,
                "Failed to bump corruption counter"
            );
        }
    }

    /// Persist the updated window with bounded retries; persistent failure
    /// fails open and feeds the circuit breaker.
    async fn persist_bucket(&self, sanitized: &str, key: &str, timestamps: &[i64]) {
        let value = serde_json::to_string(timestamps).unwrap_or_else(|_| "[]".to_string());

        for attempt in 1..=WRITE_RETRY_ATTEMPTS {
            match self.store.put(key, &value).await {
                Ok(()) => return,
                Err(e) if attempt < WRITE_RETRY_ATTEMPTS => {
                    tracing::debug!(
                        target: "rate_limit",
                        key,
                        attempt,
                        error = %e,
                        "Bucket write failed, retrying"
                    );
                    tokio::time::sleep(Duration::from_millis(WRITE_RETRY_DELAY_MS)).await;
                }
                Err(e) => {
                    tracing::warn!(
                        target: "rate_limit",
                        key,
                        error = %e,
                        "Bucket write failed after retries, failing open"
                    );
                    self.record_failure(sanitized).await;
                }
            }
        }
    }

    async fn record_failure(&self, sanitized: &str) {
        let now = self.clock.now();
        let mut counter = self.load_failures(sanitized).await;
        counter.count = counter.count.saturating_add(1);

        if counter.count > FAILURE_BYPASS_THRESHOLD && counter.opened_at.is_none() {
            counter.opened_at = Some(now);
            tracing::warn!(
                target: "rate_limit",
                identifier = %sanitized,
                failures = counter.count,
                cooldown_secs = FAILURE_COOLDOWN_SECS,
                "Failure threshold exceeded, bypassing enforcement"
            );
        }

        let key = failures_key(sanitized);
        if let Ok(value) = serde_json::to_string(&counter) {
            if let Err(e) = self.store.put(&key, &value).await {
                tracing::debug!(
                    target: "rate_limit",
                    key,
                    error = %e,
                    "Failed to persist failure counter"
                );
            }
        }
    }

    /// Whether the breaker currently bypasses enforcement for an identifier.
    /// Resets the counter once the cooldown has elapsed.
    async fn bypass_active(&self, sanitized: &str, now: DateTime<Utc>) -> bool {
        let counter = self.load_failures(sanitized).await;
        if counter.count <= FAILURE_BYPASS_THRESHOLD {
            return false;
        }

        let opened_at = match counter.opened_at {
            Some(at) => at,
            // Tripped counter without a trip time: stamp it now.
            None => {
                self.record_failure(sanitized).await;
                now
            }
        };

        if (now - opened_at).num_seconds() >= FAILURE_COOLDOWN_SECS {
            tracing::info!(
                target: "rate_limit",
                identifier = %sanitized,
                "Cooldown elapsed, resetting failure counter and resuming enforcement"
            );
            let _ = self.store.delete(&failures_key(sanitized)).await;
            false
        } else {
            true
        }
    }

    async fn load_failures(&self, sanitized: &str) -> FailureCounter {
        match self.store.get(&failures_key(sanitized)).await {
            Ok(Some(raw)) => serde_json::from_str(&raw).unwrap_or_default(),
            _ => FailureCounter::default(),
        }
    }
}

/// Reduce an identifier to a safe storage-key character set, length-capped.
#[must_use]
pub fn sanitize_identifier(raw: &str) -> String {
    let mut out: String = raw
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .take(MAX_IDENTIFIER_LEN)
        .collect();
    if out.is_empty() {
        out.push_str("unknown");
    }
    out
}

fn bucket_key(sanitized: &str, window_ms: i64) -> String {
    format!("rate_limit_{sanitized}_{window_ms}")
}

fn failures_key(sanitized: &str) -> String {
    format!("rate_limit_failures_{sanitized}")
}

/// Parse a stored bucket. Returns `None` when the data is not a JSON array
/// of valid, non-future epoch-millisecond timestamps.
fn parse_bucket(raw: &str, now_ms: i64) -> Option<Vec<i64>> {
    let timestamps: Vec<i64> = serde_json::from_str(raw).ok()?;
    // Allow a second of clock skew before calling a timestamp "future".
    let horizon = now_ms + 1_000;
    if timestamps.iter().any(|t| *t <= 0 || *t > horizon) {
        return None;
    }
    Some(timestamps)
}

fn ms_to_datetime(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_else(Utc::now)
}
