//! Outbound match-event delivery engine.
//!
//! Reliable, non-duplicated, authenticated delivery of club match-event
//! content to a backend API and/or a webhook router, on top of an unreliable
//! rate-limited storage substrate. Provides event queueing with
//! deduplication, idempotency-key management, retrying dispatch with backoff
//! and fallback routing, sliding-window rate limiting with self-healing and
//! circuit breaking, and HMAC-SHA256 signing/verification with replay
//! protection.
//!
//! Delivery is at-least-once with deduplication, not exactly-once; ordering
//! is best-effort FIFO within a drain batch.

pub mod config;
pub mod dispatcher;
pub mod error;
pub mod idempotency;
pub mod metrics;
pub mod models;
pub mod queue;
pub mod rate_limit;
pub mod signature;
pub mod store;
pub mod validation;

pub use config::{BackendConfig, DeliveryConfig, WebhookConfig};
pub use dispatcher::{BackoffPolicy, Dispatcher, SendOptions};
pub use error::DeliveryError;
pub use idempotency::{FingerprintPolicy, IdempotencyStore};
pub use metrics::MetricsSnapshot;
pub use models::{
    Channel, DeliveryPayload, DeliveryReceipt, DrainReport, EnqueueOutcome, MatchEvent, Priority,
};
pub use queue::EventQueue;
pub use rate_limit::{RateLimitDecision, RateLimiter, WindowLimit};
pub use signature::{VerifyOutcome, VerifyRejection};
pub use store::{Cache, Clock, ManualClock, MemoryCache, MemoryStore, Store, SystemClock};
