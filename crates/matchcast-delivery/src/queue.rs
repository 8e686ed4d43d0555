//! Event queue and debouncer.
//!
//! Events get a deterministic ID so retried submissions of the same
//! real-world moment collide and short-circuit as duplicates. The pending
//! queue is a bounded FIFO persisted under `LIVE_EVENT_QUEUE`; drains process
//! a fixed batch per invocation and give each event a bounded retry budget.
//!
//! Insertion beyond capacity evicts the oldest entry. Operators should know
//! the queue trades data loss for boundedness under sustained backlog.

use std::sync::Arc;

use sha2::{Digest, Sha256};

use crate::dispatcher::{Dispatcher, SendOptions};
use crate::error::DeliveryError;
use crate::models::{
    DeadLetterRecord, DeliveryPayload, DrainReport, EnqueueOutcome, MatchEvent, QueuedEvent,
};
use crate::store::{Clock, Store};

/// Store key of the pending queue.
pub const QUEUE_KEY: &str = "LIVE_EVENT_QUEUE";

/// Store key of the processed-ID set.
pub const PROCESSED_KEY: &str = "PROCESSED_EVENTS";

/// Store key of the permanent-failure records.
pub const DEAD_LETTER_KEY: &str = "DEAD_LETTER_EVENTS";

/// Default pending-queue capacity.
pub const DEFAULT_QUEUE_CAPACITY: usize = 100;

/// Default events processed per drain invocation.
pub const DEFAULT_DRAIN_BATCH: usize = 5;

/// Drain attempts before an event is dropped permanently.
pub const MAX_EVENT_ATTEMPTS: u32 = 3;

/// FIFO bound on the processed-ID set.
const PROCESSED_SET_BOUND: usize = 500;

/// FIFO bound on retained dead-letter records.
const DEAD_LETTER_BOUND: usize = 100;

/// Bounded FIFO queue of match events awaiting dispatch.
#[derive(Clone)]
pub struct EventQueue {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    capacity: usize,
    drain_batch: usize,
    max_attempts: u32,
}

impl EventQueue {
    #[must_use]
    pub fn new(store: Arc<dyn Store>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            clock,
            capacity: DEFAULT_QUEUE_CAPACITY,
            drain_batch: DEFAULT_DRAIN_BATCH,
            max_attempts: MAX_EVENT_ATTEMPTS,
        }
    }

    #[must_use]
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity.max(1);
        self
    }

    #[must_use]
    pub fn with_drain_batch(mut self, batch: usize) -> Self {
        self.drain_batch = batch.max(1);
        self
    }

    #[must_use]
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    /// Deterministic event ID.
    ///
    /// Hashes `(match_id, type, minute, player, coarse timestamp)` where the
    /// coarse timestamp is the current hour bucket, so a duplicate submission
    /// of the same real-world event collides within the hour.
    #[must_use]
    pub fn event_id(&self, event: &MatchEvent) -> String {
        let hour_bucket = self.clock.now().timestamp() / 3600;
        let material = format!(
            "{}|{}|{}|{}|{}",
            event.match_id(),
            event.event_type(),
            event.minute().map_or_else(String::new, |m| m.to_string()),
            event.player().unwrap_or(""),
            hour_bucket,
        );
        let digest = Sha256::digest(material.as_bytes());
        hex::encode(&digest[..16])
    }

    /// Queue an event for delivery, deduplicating against both the pending
    /// queue and the processed set.
    pub async fn enqueue(&self, event: &MatchEvent) -> Result<EnqueueOutcome, DeliveryError> {
        let event_id = self.event_id(event);

        let processed = self.load_processed().await?;
        if processed.iter().any(|id| id == &event_id) {
            tracing::debug!(
                target: "event_queue",
                event_id = %event_id,
                event_type = event.event_type(),
                "Duplicate of an already processed event"
            );
            return Ok(EnqueueOutcome::Duplicate { event_id });
        }

        let mut queue = self.load_queue().await?;
        if queue.iter().any(|q| q.id == event_id) {
            tracing::debug!(
                target: "event_queue",
                event_id = %event_id,
                event_type = event.event_type(),
                "Duplicate of a pending event"
            );
            return Ok(EnqueueOutcome::Duplicate { event_id });
        }

        queue.push(QueuedEvent {
            id: event_id.clone(),
            payload: DeliveryPayload::from_event(event, self.clock.as_ref()),
            enqueued_at: self.clock.now(),
            attempts: 0,
        });

        while queue.len() > self.capacity {
            let evicted = queue.remove(0);
            tracing::warn!(
                target: "event_queue",
                evicted_id = %evicted.id,
                evicted_type = %evicted.payload.event_type,
                capacity = self.capacity,
                "Queue at capacity, evicting oldest event"
            );
        }

        self.save_queue(&queue).await?;

        tracing::info!(
            target: "event_queue",
            event_id = %event_id,
            event_type = event.event_type(),
            queue_len = queue.len(),
            "Event queued"
        );
        Ok(EnqueueOutcome::Queued { event_id })
    }

    /// Drain one batch through the dispatcher.
    ///
    /// Safe to invoke concurrently: each drain re-reads queue state, and the
    /// dispatcher's idempotency check suppresses double sends that slip
    /// through the read-modify-write race.
    pub async fn drain(&self, dispatcher: &Dispatcher) -> Result<DrainReport, DeliveryError> {
        let mut queue = self.load_queue().await?;
        if queue.is_empty() {
            return Ok(DrainReport::default());
        }

        let batch_len = self.drain_batch.min(queue.len());
        let batch: Vec<QueuedEvent> = queue.drain(..batch_len).collect();

        let mut report = DrainReport::default();
        let mut retained: Vec<QueuedEvent> = Vec::new();
        let mut processed_ids: Vec<String> = Vec::new();
        let mut dead: Vec<DeadLetterRecord> = Vec::new();

        for mut event in batch {
            let receipt = dispatcher.send(&event.payload, &SendOptions::default()).await;

            if receipt.success {
                report.processed += 1;
                processed_ids.push(event.id);
                continue;
            }

            report.failed += 1;
            event.attempts += 1;

            if event.attempts >= self.max_attempts {
                report.dead_lettered += 1;
                tracing::error!(
                    target: "event_queue",
                    event_id = %event.id,
                    event_type = %event.payload.event_type,
                    attempts = event.attempts,
                    error = receipt.error.as_deref().unwrap_or("unknown"),
                    "Event dropped after exhausting retry budget"
                );
                dead.push(DeadLetterRecord {
                    event_id: event.id,
                    event_type: event.payload.event_type,
                    error: receipt.error.unwrap_or_else(|| "unknown".to_string()),
                    attempts: event.attempts,
                    failed_at: self.clock.now(),
                });
            } else {
                tracing::warn!(
                    target: "event_queue",
                    event_id = %event.id,
                    event_type = %event.payload.event_type,
                    attempts = event.attempts,
                    max_attempts = self.max_attempts,
                    "Event dispatch failed, will retry on a later drain"
                );
                retained.push(event);
            }
        }

        // Failed-but-retryable events keep their place ahead of the
        // untouched remainder.
        retained.extend(queue);
        self.save_queue(&retained).await?;
        report.remaining = retained.len();

        if !processed_ids.is_empty() {
            self.record_processed(processed_ids).await?;
        }
        if !dead.is_empty() {
            self.record_dead_letters(dead).await?;
        }

        tracing::info!(
            target: "event_queue",
            processed = report.processed,
            failed = report.failed,
            dead_lettered = report.dead_lettered,
            remaining = report.remaining,
            "Drain complete"
        );
        Ok(report)
    }

    /// Number of pending events.
    pub async fn len(&self) -> Result<usize, DeliveryError> {
        Ok(self.load_queue().await?.len())
    }

    pub async fn is_empty(&self) -> Result<bool, DeliveryError> {
        Ok(self.load_queue().await?.is_empty())
    }

    /// Dead-letter records currently retained for inspection.
    pub async fn dead_letters(&self) -> Result<Vec<DeadLetterRecord>, DeliveryError> {
        let Some(raw) = self.store.get(DEAD_LETTER_KEY).await? else {
            return Ok(Vec::new());
        };
        Ok(serde_json::from_str(&raw).unwrap_or_default())
    }

    // -- internals ----------------------------------------------------------

    async fn load_queue(&self) -> Result<Vec<QueuedEvent>, DeliveryError> {
        let Some(raw) = self.store.get(QUEUE_KEY).await? else {
            return Ok(Vec::new());
        };
        match serde_json::from_str(&raw) {
            Ok(queue) => Ok(queue),
            Err(e) => {
                // Heal rather than wedge every future enqueue and drain.
                tracing::warn!(
                    target: "event_queue",
                    error = %e,
                    "Corrupt queue state, resetting to empty"
                );
                self.store.delete(QUEUE_KEY).await?;
                Ok(Vec::new())
            }
        }
    }

    async fn save_queue(&self, queue: &[QueuedEvent]) -> Result<(), DeliveryError> {
        let value = serde_json::to_string(queue)
            .map_err(|e| DeliveryError::Storage(format!("queue serialization: {e}")))?;
        self.store.put(QUEUE_KEY, &value).await?;
        Ok(())
    }

    async fn load_processed(&self) -> Result<Vec<String>, DeliveryError> {
        let Some(raw) = self.store.get(PROCESSED_KEY).await? else {
            return Ok(Vec::new());
        };
        match serde_json::from_str(&raw) {
            Ok(ids) => Ok(ids),
            Err(e) => {
                tracing::warn!(
                    target: "event_queue",
                    error = %e,
                    "Corrupt processed set, resetting to empty"
                );
                self.store.delete(PROCESSED_KEY).await?;
                Ok(Vec::new())
            }
        }
    }

    async fn record_processed(&self, new_ids: Vec<String>) -> Result<(), DeliveryError> {
        let mut ids = self.load_processed().await?;
        ids.extend(new_ids);
        while ids.len() > PROCESSED_SET_BOUND {
            ids.remove(0);
        }
        let value = serde_json::to_string(&ids)
            .map_err(|e| DeliveryError::Storage(format!("processed set serialization: {e}")))?;
        self.store.put(PROCESSED_KEY, &value).await?;
        Ok(())
    }

    async fn record_dead_letters(&self, new: Vec<DeadLetterRecord>) -> Result<(), DeliveryError> {
        let mut records = self.dead_letters().await?;
        records.extend(new);
        while records.len() > DEAD_LETTER_BOUND {
            records.remove(0);
        }
        let value = serde_json::to_string(&records)
            .map_err(|e| DeliveryError::Storage(format!("dead letter serialization: {e}")))?;
        self.store.put(DEAD_LETTER_KEY, &value).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::store::{ManualClock, MemoryStore};

    fn fixture() -> (EventQueue, Arc<MemoryStore>, Arc<ManualClock>) {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(Utc::now()));
        (
            EventQueue::new(store.clone(), clock.clone()),
            store,
            clock,
        )
    }

    fn goal(match_id: &str, player: &str, minute: u32) -> MatchEvent {
        MatchEvent::Goal {
            match_id: match_id.to_string(),
            player: player.to_string(),
            minute,
            assist: None,
            home_score: 1,
            away_score: 0,
        }
    }

    #[test]
    fn test_event_id_is_deterministic() {
        let (queue, _, _) = fixture();
        let a = queue.event_id(&goal("M1", "Smith", 23));
        let b = queue.event_id(&goal("M1", "Smith", 23));
        assert_eq!(a, b);
        assert_eq!(a.len(), 32);
    }

    #[test]
    fn test_event_id_differs_across_fields() {
        let (queue, _, _) = fixture();
        let base = queue.event_id(&goal("M1", "Smith", 23));
        assert_ne!(base, queue.event_id(&goal("M1", "Smith", 24)));
        assert_ne!(base, queue.event_id(&goal("M1", "Jones", 23)));
        assert_ne!(base, queue.event_id(&goal("M2", "Smith", 23)));
        assert_ne!(
            base,
            queue.event_id(&MatchEvent::YellowCard {
                match_id: "M1".to_string(),
                player: "Smith".to_string(),
                minute: 23,
            })
        );
    }

    #[test]
    fn test_event_id_changes_across_hour_buckets() {
        let (queue, _, clock) = fixture();
        let before = queue.event_id(&goal("M1", "Smith", 23));
        clock.advance(chrono::Duration::hours(2));
        let after = queue.event_id(&goal("M1", "Smith", 23));
        assert_ne!(before, after);
    }

    #[tokio::test]
    async fn test_back_to_back_goal_is_duplicate() {
        let (queue, _, _) = fixture();
        let event = goal("M1", "Smith", 23);

        let first = queue.enqueue(&event).await.unwrap();
        assert!(matches!(first, EnqueueOutcome::Queued { .. }));

        let second = queue.enqueue(&event).await.unwrap();
        assert!(second.is_duplicate());
        assert_eq!(first.event_id(), second.event_id());
        assert_eq!(queue.len().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_distinct_events_both_queue() {
        let (queue, _, _) = fixture();
        queue.enqueue(&goal("M1", "Smith", 23)).await.unwrap();
        queue.enqueue(&goal("M1", "Jones", 67)).await.unwrap();
        assert_eq!(queue.len().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_capacity_evicts_oldest() {
        let (queue, _, _) = fixture();

        for minute in 0..101 {
            queue.enqueue(&goal("M1", "Smith", minute)).await.unwrap();
        }

        assert_eq!(queue.len().await.unwrap(), 100);

        // The minute-0 event went first.
        let oldest_id = queue.event_id(&goal("M1", "Smith", 0));
        let raw = queue.store.get(QUEUE_KEY).await.unwrap().unwrap();
        let pending: Vec<QueuedEvent> = serde_json::from_str(&raw).unwrap();
        assert!(pending.iter().all(|q| q.id != oldest_id));
        assert_eq!(pending[0].id, queue.event_id(&goal("M1", "Smith", 1)));
    }

    #[tokio::test]
    async fn test_corrupt_queue_state_heals() {
        let (queue, store, _) = fixture();

        store.put(QUEUE_KEY, "{{{ not json").await.unwrap();
        let outcome = queue.enqueue(&goal("M1", "Smith", 23)).await.unwrap();
        assert!(matches!(outcome, EnqueueOutcome::Queued { .. }));
        assert_eq!(queue.len().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_processed_set_is_bounded() {
        let (queue, store, _) = fixture();

        let ids: Vec<String> = (0..PROCESSED_SET_BOUND + 10)
            .map(|i| format!("id-{i}"))
            .collect();
        queue.record_processed(ids).await.unwrap();

        let raw = store.get(PROCESSED_KEY).await.unwrap().unwrap();
        let stored: Vec<String> = serde_json::from_str(&raw).unwrap();
        assert_eq!(stored.len(), PROCESSED_SET_BOUND);
        // Oldest entries were trimmed first.
        assert_eq!(stored[0], "id-10");
    }

    #[tokio::test]
    async fn test_processed_event_blocks_reenqueue() {
        let (queue, _, _) = fixture();
        let event = goal("M1", "Smith", 23);
        let id = queue.event_id(&event);

        queue.record_processed(vec![id]).await.unwrap();

        let outcome = queue.enqueue(&event).await.unwrap();
        assert!(outcome.is_duplicate());
        assert_eq!(queue.len().await.unwrap(), 0);
    }
}
