//! Event model and delivery result types.
//!
//! Match events are a tagged union validated at the boundary; everything the
//! dispatcher returns is a plain value (`DeliveryReceipt`), never a panic or
//! an escaped error.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::store::Clock;

/// Event types the engine will accept for dispatch.
pub const ALLOWED_EVENT_TYPES: &[&str] = &[
    "goal",
    "yellow_card",
    "red_card",
    "substitution",
    "kickoff",
    "half_time",
    "full_time",
    "man_of_the_match",
    "status_update",
];

/// A club match event as submitted by producers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MatchEvent {
    Goal {
        match_id: String,
        player: String,
        minute: u32,
        #[serde(skip_serializing_if = "Option::is_none")]
        assist: Option<String>,
        home_score: u32,
        away_score: u32,
    },
    YellowCard {
        match_id: String,
        player: String,
        minute: u32,
    },
    RedCard {
        match_id: String,
        player: String,
        minute: u32,
    },
    Substitution {
        match_id: String,
        player_off: String,
        player_on: String,
        minute: u32,
    },
    Kickoff {
        match_id: String,
    },
    HalfTime {
        match_id: String,
        home_score: u32,
        away_score: u32,
    },
    FullTime {
        match_id: String,
        home_score: u32,
        away_score: u32,
    },
    ManOfTheMatch {
        match_id: String,
        player: String,
    },
    StatusUpdate {
        match_id: String,
        status: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        minute: Option<u32>,
    },
}

impl MatchEvent {
    /// Wire name of the event kind.
    #[must_use]
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Goal { .. } => "goal",
            Self::YellowCard { .. } => "yellow_card",
            Self::RedCard { .. } => "red_card",
            Self::Substitution { .. } => "substitution",
            Self::Kickoff { .. } => "kickoff",
            Self::HalfTime { .. } => "half_time",
            Self::FullTime { .. } => "full_time",
            Self::ManOfTheMatch { .. } => "man_of_the_match",
            Self::StatusUpdate { .. } => "status_update",
        }
    }

    #[must_use]
    pub fn match_id(&self) -> &str {
        match self {
            Self::Goal { match_id, .. }
            | Self::YellowCard { match_id, .. }
            | Self::RedCard { match_id, .. }
            | Self::Substitution { match_id, .. }
            | Self::Kickoff { match_id }
            | Self::HalfTime { match_id, .. }
            | Self::FullTime { match_id, .. }
            | Self::ManOfTheMatch { match_id, .. }
            | Self::StatusUpdate { match_id, .. } => match_id,
        }
    }

    /// Match minute, where the event kind carries one.
    #[must_use]
    pub fn minute(&self) -> Option<u32> {
        match self {
            Self::Goal { minute, .. }
            | Self::YellowCard { minute, .. }
            | Self::RedCard { minute, .. }
            | Self::Substitution { minute, .. } => Some(*minute),
            Self::StatusUpdate { minute, .. } => *minute,
            _ => None,
        }
    }

    /// Principal player, where the event kind names one.
    #[must_use]
    pub fn player(&self) -> Option<&str> {
        match self {
            Self::Goal { player, .. }
            | Self::YellowCard { player, .. }
            | Self::RedCard { player, .. }
            | Self::ManOfTheMatch { player, .. } => Some(player),
            Self::Substitution { player_off, .. } => Some(player_off),
            _ => None,
        }
    }
}

/// Delivery priority class, exposed for the dispatcher's ordering and
/// backoff heuristics. Does not change correctness guarantees.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High,
    Medium,
    Low,
}

impl Priority {
    /// Classify an event type string.
    #[must_use]
    pub fn classify(event_type: &str) -> Self {
        match event_type {
            "goal" | "red_card" | "kickoff" | "half_time" | "full_time" => Self::High,
            "yellow_card" | "substitution" | "man_of_the_match" => Self::Medium,
            _ => Self::Low,
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::High => "high",
            Self::Medium => "medium",
            Self::Low => "low",
        }
    }
}

/// Outbound payload shape shared by both delivery channels.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryPayload {
    pub event_type: String,
    pub data: serde_json::Value,
    #[serde(default)]
    pub channels: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub template: Option<String>,
    /// Submission time. Volatile: excluded from the idempotency fingerprint.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
    /// Delivery metadata added by the dispatcher (priority, routing hint).
    /// Volatile: excluded from the idempotency fingerprint.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delivery: Option<serde_json::Value>,
}

impl DeliveryPayload {
    /// Build a payload from a validated match event.
    ///
    /// The serde tag is dropped from `data` since `event_type` carries it.
    #[must_use]
    pub fn from_event(event: &MatchEvent, clock: &dyn Clock) -> Self {
        let mut data = serde_json::to_value(event).unwrap_or_default();
        if let Some(obj) = data.as_object_mut() {
            obj.remove("type");
        }
        Self {
            event_type: event.event_type().to_string(),
            data,
            channels: Vec::new(),
            template: None,
            timestamp: Some(clock.now()),
            delivery: None,
        }
    }
}

/// Outbound channel a dispatch went through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    Backend,
    Webhook,
}

impl Channel {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Backend => "backend",
            Self::Webhook => "webhook",
        }
    }
}

/// One dispatch attempt, kept only inside the returned receipt.
#[derive(Debug, Clone, Serialize)]
pub struct AttemptRecord {
    pub attempt: u32,
    pub channel: Channel,
    pub response_code: Option<u16>,
    pub error: Option<String>,
}

/// Result of a `send` call. Always returned as a value; callers never need
/// exception handling to interpret delivery status.
#[derive(Debug, Clone, Serialize)]
pub struct DeliveryReceipt {
    pub success: bool,
    pub skipped: bool,
    pub duplicate: bool,
    pub response_code: Option<u16>,
    pub channel: Option<Channel>,
    /// Total HTTP attempts made across both channels.
    pub attempts: u32,
    /// Per-attempt trail, including failed primary attempts when the
    /// fallback ends up deciding the outcome.
    pub attempts_log: Vec<AttemptRecord>,
    pub error: Option<String>,
    pub idempotency_key: Option<String>,
}

impl DeliveryReceipt {
    /// Receipt for a duplicate suppressed without a network call.
    #[must_use]
    pub fn duplicate(key: String) -> Self {
        Self {
            success: true,
            skipped: true,
            duplicate: true,
            response_code: None,
            channel: None,
            attempts: 0,
            attempts_log: Vec::new(),
            error: None,
            idempotency_key: Some(key),
        }
    }

    /// Receipt for a failure before any network attempt.
    #[must_use]
    pub fn rejected(error: &crate::error::DeliveryError) -> Self {
        Self {
            success: false,
            skipped: false,
            duplicate: false,
            response_code: None,
            channel: None,
            attempts: 0,
            attempts_log: Vec::new(),
            error: Some(error.to_string()),
            idempotency_key: None,
        }
    }
}

/// Outcome of queueing an event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum EnqueueOutcome {
    Queued { event_id: String },
    Duplicate { event_id: String },
}

impl EnqueueOutcome {
    #[must_use]
    pub fn event_id(&self) -> &str {
        match self {
            Self::Queued { event_id } | Self::Duplicate { event_id } => event_id,
        }
    }

    #[must_use]
    pub fn is_duplicate(&self) -> bool {
        matches!(self, Self::Duplicate { .. })
    }
}

/// Summary of one drain invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DrainReport {
    /// Events dispatched successfully this drain.
    pub processed: u32,
    /// Events that failed processing this drain (includes dead-lettered).
    pub failed: u32,
    /// Events dropped permanently after exhausting their retry budget.
    pub dead_lettered: u32,
    /// Events still pending after the drain.
    pub remaining: usize,
}

/// An event held in the pending queue. Owned by the queue until drained.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedEvent {
    pub id: String,
    pub payload: DeliveryPayload,
    pub enqueued_at: DateTime<Utc>,
    pub attempts: u32,
}

/// Permanent failure record kept for operator inspection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetterRecord {
    pub event_id: String,
    pub event_type: String,
    pub error: String,
    pub attempts: u32,
    pub failed_at: DateTime<Utc>,
}
