//! Storage and clock abstractions.
//!
//! The durable [`Store`] is the single source of truth shared by concurrently
//! scheduled invocations; the optional [`Cache`] is a short-TTL fast tier
//! that is never authoritative for write-confirming operations. Both are
//! injected so the engine runs against an in-memory fake in tests and any
//! persistent backend in production.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

/// Failure of the underlying storage backend.
#[derive(Debug, thiserror::Error)]
#[error("storage backend failure: {0}")]
pub struct StoreError(pub String);

/// Durable key-value properties.
#[async_trait]
pub trait Store: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;
    async fn put(&self, key: &str, value: &str) -> Result<(), StoreError>;
    async fn delete(&self, key: &str) -> Result<(), StoreError>;
}

/// Short-TTL fast cache. Lookup misses are silent; expiry is enforced on
/// read. Cache failures never surface to callers.
#[async_trait]
pub trait Cache: Send + Sync {
    async fn get(&self, key: &str) -> Option<String>;
    async fn put(&self, key: &str, value: &str, ttl: Duration);
    async fn remove(&self, key: &str);
}

/// Wall-clock source, injectable for tests.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Production clock backed by `Utc::now()`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Manually advanced clock for deterministic tests.
#[derive(Debug)]
pub struct ManualClock {
    now: std::sync::Mutex<DateTime<Utc>>,
}

impl ManualClock {
    #[must_use]
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: std::sync::Mutex::new(start),
        }
    }

    pub fn advance(&self, by: chrono::Duration) {
        let mut guard = self.now.lock().expect("clock lock");
        *guard += by;
    }

    pub fn set(&self, to: DateTime<Utc>) {
        let mut guard = self.now.lock().expect("clock lock");
        *guard = to;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().expect("clock lock")
    }
}

/// In-memory store for tests and lightweight deployments.
#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored keys.
    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.entries.lock().await.get(key).cloned())
    }

    async fn put(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.entries
            .lock()
            .await
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.entries.lock().await.remove(key);
        Ok(())
    }
}

/// In-memory TTL cache. Expired entries are dropped on read against the
/// injected clock.
pub struct MemoryCache {
    entries: Mutex<HashMap<String, (String, DateTime<Utc>)>>,
    clock: std::sync::Arc<dyn Clock>,
}

impl MemoryCache {
    #[must_use]
    pub fn new(clock: std::sync::Arc<dyn Clock>) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            clock,
        }
    }
}

#[async_trait]
impl Cache for MemoryCache {
    async fn get(&self, key: &str) -> Option<String> {
        let mut entries = self.entries.lock().await;
        match entries.get(key) {
            Some((value, expires_at)) if *expires_at > self.clock.now() => Some(value.clone()),
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    async fn put(&self, key: &str, value: &str, ttl: Duration) {
        let expires_at = self.clock.now()
            + chrono::Duration::milliseconds(i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX));
        self.entries
            .lock()
            .await
            .insert(key.to_string(), (value.to_string(), expires_at));
    }

    async fn remove(&self, key: &str) {
        self.entries.lock().await.remove(key);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[tokio::test]
    async fn test_memory_store_roundtrip() {
        let store = MemoryStore::new();
        store.put("k", "v").await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), Some("v".to_string()));

        store.delete("k").await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_memory_store_overwrites() {
        let store = MemoryStore::new();
        store.put("k", "v1").await.unwrap();
        store.put("k", "v2").await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), Some("v2".to_string()));
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn test_memory_cache_expires_on_read() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let cache = MemoryCache::new(clock.clone());

        cache.put("k", "v", Duration::from_secs(60)).await;
        assert_eq!(cache.get("k").await, Some("v".to_string()));

        clock.advance(chrono::Duration::seconds(61));
        assert_eq!(cache.get("k").await, None);
    }

    #[tokio::test]
    async fn test_memory_cache_remove() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let cache = MemoryCache::new(clock);

        cache.put("k", "v", Duration::from_secs(60)).await;
        cache.remove("k").await;
        assert_eq!(cache.get("k").await, None);
    }

    #[test]
    fn test_manual_clock_advance() {
        let start = Utc::now();
        let clock = ManualClock::new(start);
        clock.advance(chrono::Duration::seconds(30));
        assert_eq!(clock.now(), start + chrono::Duration::seconds(30));
    }
}
