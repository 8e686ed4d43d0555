//! Payload fingerprinting and duplicate suppression.
//!
//! A fingerprint is the SHA-256 of the canonical JSON of a payload with its
//! volatile fields stripped. Dedup records live in two tiers: a short-TTL
//! fast cache checked first, then the durable store with an explicit expiry
//! that is enforced lazily on read.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::DeliveryError;
use crate::models::DeliveryPayload;
use crate::signature::canonical_json;
use crate::store::{Cache, Clock, Store};

/// Prefix for durable dedup records.
pub const KEY_PREFIX: &str = "IDEMPOTENCY_";

/// Default record lifetime.
pub const DEFAULT_TTL_SECS: i64 = 24 * 3600;

/// Fast-cache entries never outlive this, whatever the logical TTL.
pub const CACHE_TTL_CAP_SECS: i64 = 6 * 3600;

/// Which top-level payload fields are excluded from the fingerprint.
///
/// The default drops `timestamp` and the dispatcher's `delivery` enhancement
/// metadata so that retried submissions of the same logical payload collide.
#[derive(Debug, Clone)]
pub struct FingerprintPolicy {
    pub exclude_fields: Vec<String>,
}

impl Default for FingerprintPolicy {
    fn default() -> Self {
        Self {
            exclude_fields: vec!["timestamp".to_string(), "delivery".to_string()],
        }
    }
}

impl FingerprintPolicy {
    #[must_use]
    pub fn with_excluded(fields: &[&str]) -> Self {
        Self {
            exclude_fields: fields.iter().map(|s| (*s).to_string()).collect(),
        }
    }
}

/// Durable dedup record.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct IdempotencyRecord {
    key: String,
    expires_at: DateTime<Utc>,
}

/// Two-tier idempotency store.
#[derive(Clone)]
pub struct IdempotencyStore {
    store: Arc<dyn Store>,
    cache: Option<Arc<dyn Cache>>,
    clock: Arc<dyn Clock>,
    policy: FingerprintPolicy,
}

impl IdempotencyStore {
    #[must_use]
    pub fn new(store: Arc<dyn Store>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            cache: None,
            clock,
            policy: FingerprintPolicy::default(),
        }
    }

    /// Attach a fast cache tier.
    #[must_use]
    pub fn with_cache(mut self, cache: Arc<dyn Cache>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Replace the volatile-field exclusion policy.
    #[must_use]
    pub fn with_policy(mut self, policy: FingerprintPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// SHA-256 hex fingerprint of the payload's non-volatile content.
    #[must_use]
    pub fn fingerprint(&self, payload: &DeliveryPayload) -> String {
        let mut value = serde_json::to_value(payload).unwrap_or_default();
        if let Some(obj) = value.as_object_mut() {
            for field in &self.policy.exclude_fields {
                obj.remove(field);
            }
        }
        let canonical = canonical_json(&value);
        hex::encode(Sha256::digest(canonical.as_bytes()))
    }

    /// Resolve the idempotency key: an explicit override wins, otherwise
    /// `<event_type>_<fingerprint>`.
    #[must_use]
    pub fn resolve_key(&self, payload: &DeliveryPayload, override_key: Option<&str>) -> String {
        match override_key {
            Some(key) if !key.trim().is_empty() => key.to_string(),
            _ => format!("{}_{}", payload.event_type, self.fingerprint(payload)),
        }
    }

    /// Whether this key was already processed within its TTL.
    ///
    /// Checks the fast cache first; on miss, reads the durable record and
    /// actively deletes it when stale.
    pub async fn is_duplicate(&self, key: &str) -> Result<bool, DeliveryError> {
        if let Some(cache) = &self.cache {
            if cache.get(&store_key(key)).await.is_some() {
                return Ok(true);
            }
        }

        let durable_key = store_key(key);
        let Some(raw) = self.store.get(&durable_key).await? else {
            return Ok(false);
        };

        let record: IdempotencyRecord = match serde_json::from_str(&raw) {
            Ok(record) => record,
            Err(_) => {
                // Unreadable record: heal by dropping it rather than
                // suppressing deliveries forever.
                tracing::warn!(
                    target: "idempotency",
                    key = %durable_key,
                    "Corrupt idempotency record, deleting"
                );
                self.store.delete(&durable_key).await?;
                return Ok(false);
            }
        };

        if record.expires_at <= self.clock.now() {
            self.store.delete(&durable_key).await?;
            return Ok(false);
        }

        Ok(true)
    }

    /// Mark a key processed in both tiers.
    pub async fn mark_processed(&self, key: &str, ttl_secs: i64) -> Result<(), DeliveryError> {
        let ttl_secs = ttl_secs.max(1);
        let now = self.clock.now();
        let record = IdempotencyRecord {
            key: key.to_string(),
            expires_at: now + chrono::Duration::seconds(ttl_secs),
        };

        let durable_key = store_key(key);
        let value = serde_json::to_string(&record)
            .map_err(|e| DeliveryError::Storage(format!("record serialization: {e}")))?;
        self.store.put(&durable_key, &value).await?;

        if let Some(cache) = &self.cache {
            let cache_ttl = ttl_secs.min(CACHE_TTL_CAP_SECS);
            cache
                .put(
                    &durable_key,
                    "1",
                    Duration::from_secs(cache_ttl.unsigned_abs()),
                )
                .await;
        }

        tracing::debug!(
            target: "idempotency",
            key,
            ttl_secs,
            "Marked processed"
        );
        Ok(())
    }
}

/// Scope a key for a multi-tenant boundary.
#[must_use]
pub fn tenant_scoped(tenant_id: &str, key: &str) -> String {
    format!("{tenant_id}:{key}")
}

fn store_key(key: &str) -> String {
    format!("{KEY_PREFIX}{key}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::MatchEvent;
    use crate::store::{ManualClock, MemoryCache, MemoryStore};

    fn goal_payload(clock: &dyn Clock) -> DeliveryPayload {
        DeliveryPayload::from_event(
            &MatchEvent::Goal {
                match_id: "M1".to_string(),
                player: "Smith".to_string(),
                minute: 23,
                assist: None,
                home_score: 1,
                away_score: 0,
            },
            clock,
        )
    }

    fn fixture() -> (IdempotencyStore, Arc<MemoryStore>, Arc<ManualClock>) {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(Utc::now()));
        (
            IdempotencyStore::new(store.clone(), clock.clone()),
            store,
            clock,
        )
    }

    #[test]
    fn test_fingerprint_ignores_volatile_fields() {
        let (idem, _, clock) = fixture();

        let mut a = goal_payload(clock.as_ref());
        let mut b = goal_payload(clock.as_ref());
        a.timestamp = Some(clock.now());
        b.timestamp = Some(clock.now() + chrono::Duration::hours(2));
        b.delivery = Some(serde_json::json!({"priority": "high"}));

        assert_eq!(idem.fingerprint(&a), idem.fingerprint(&b));
    }

    #[test]
    fn test_fingerprint_differs_for_different_content() {
        let (idem, _, clock) = fixture();

        let a = goal_payload(clock.as_ref());
        let mut b = goal_payload(clock.as_ref());
        b.data["minute"] = serde_json::json!(24);

        assert_ne!(idem.fingerprint(&a), idem.fingerprint(&b));
    }

    #[test]
    fn test_custom_policy_changes_collisions() {
        let (idem, _, clock) = fixture();
        let loose = idem
            .clone()
            .with_policy(FingerprintPolicy::with_excluded(&[
                "timestamp", "delivery", "channels",
            ]));

        let a = goal_payload(clock.as_ref());
        let mut b = goal_payload(clock.as_ref());
        b.channels = vec!["x".to_string()];

        assert_ne!(idem.fingerprint(&a), idem.fingerprint(&b));
        assert_eq!(loose.fingerprint(&a), loose.fingerprint(&b));
    }

    #[test]
    fn test_resolve_key_shape_and_override() {
        let (idem, _, clock) = fixture();
        let payload = goal_payload(clock.as_ref());

        let key = idem.resolve_key(&payload, None);
        assert!(key.starts_with("goal_"));
        assert_eq!(key.len(), "goal_".len() + 64);

        assert_eq!(idem.resolve_key(&payload, Some("explicit")), "explicit");
        // Blank overrides fall back to the fingerprint.
        assert!(idem.resolve_key(&payload, Some("  ")).starts_with("goal_"));
    }

    #[tokio::test]
    async fn test_mark_then_duplicate() {
        let (idem, _, _) = fixture();

        assert!(!idem.is_duplicate("goal_abc").await.unwrap());
        idem.mark_processed("goal_abc", DEFAULT_TTL_SECS).await.unwrap();
        assert!(idem.is_duplicate("goal_abc").await.unwrap());
    }

    #[tokio::test]
    async fn test_expired_record_is_deleted_on_read() {
        let (idem, store, clock) = fixture();

        idem.mark_processed("goal_abc", 60).await.unwrap();
        clock.advance(chrono::Duration::seconds(61));

        assert!(!idem.is_duplicate("goal_abc").await.unwrap());
        assert_eq!(store.get("IDEMPOTENCY_goal_abc").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_corrupt_record_is_healed() {
        let (idem, store, _) = fixture();

        store.put("IDEMPOTENCY_goal_abc", "garbage").await.unwrap();
        assert!(!idem.is_duplicate("goal_abc").await.unwrap());
        assert_eq!(store.get("IDEMPOTENCY_goal_abc").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_cache_tier_hit_skips_durable_read() {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let cache = Arc::new(MemoryCache::new(clock.clone()));
        let idem = IdempotencyStore::new(store.clone(), clock.clone())
            .with_cache(cache.clone());

        idem.mark_processed("goal_abc", DEFAULT_TTL_SECS).await.unwrap();

        // Remove the durable record; the cache alone reports the duplicate.
        store.delete("IDEMPOTENCY_goal_abc").await.unwrap();
        assert!(idem.is_duplicate("goal_abc").await.unwrap());

        // Cache TTL is capped at six hours even with a 24h logical TTL, so
        // after the cap only the (deleted) durable record would answer.
        clock.advance(chrono::Duration::seconds(CACHE_TTL_CAP_SECS + 1));
        assert!(!idem.is_duplicate("goal_abc").await.unwrap());
    }

    #[test]
    fn test_tenant_scoping() {
        assert_eq!(tenant_scoped("club-17", "goal_abc"), "club-17:goal_abc");
    }
}
