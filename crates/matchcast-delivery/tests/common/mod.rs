//! Common fixtures for matchcast-delivery integration tests.
//!
//! Provides wiremock responders and engine fixtures for exercising delivery
//! behavior against mock endpoints, without a real backend or router.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use wiremock::{Request, Respond, ResponseTemplate};

use matchcast_delivery::{
    DeliveryConfig, DeliveryPayload, Dispatcher, EventQueue, ManualClock, MatchEvent, MemoryCache,
    MemoryStore, WindowLimit,
};

/// Tenant used across tests.
pub const TENANT: &str = "club-17";

/// Bearer token used across tests.
pub const TOKEN: &str = "jwt-test-token";

/// Webhook shared secret used across tests.
pub const SECRET: &str = "mk_test_secret_12345";

// ---------------------------------------------------------------------------
// CapturedRequest - for inspecting outbound requests
// ---------------------------------------------------------------------------

/// A captured HTTP request with body and headers.
#[derive(Debug, Clone)]
pub struct CapturedRequest {
    pub body: Vec<u8>,
    pub headers: HashMap<String, String>,
}

impl CapturedRequest {
    /// Parse the body as JSON.
    pub fn body_json(&self) -> serde_json::Value {
        serde_json::from_slice(&self.body).expect("captured body is JSON")
    }

    /// Get a header value by name (case-insensitive).
    pub fn header(&self, name: &str) -> Option<&str> {
        let name_lower = name.to_lowercase();
        self.headers
            .iter()
            .find(|(k, _)| k.to_lowercase() == name_lower)
            .map(|(_, v)| v.as_str())
    }
}

// ---------------------------------------------------------------------------
// CaptureResponder - captures requests and returns a fixed status
// ---------------------------------------------------------------------------

/// A wiremock responder that captures incoming requests.
#[derive(Clone)]
pub struct CaptureResponder {
    requests: Arc<Mutex<Vec<CapturedRequest>>>,
    response_code: u16,
}

impl CaptureResponder {
    /// Capture responder that returns 200 OK.
    pub fn new() -> Self {
        Self::with_status(200)
    }

    /// Capture responder that returns a custom status code.
    pub fn with_status(status: u16) -> Self {
        Self {
            requests: Arc::new(Mutex::new(Vec::new())),
            response_code: status,
        }
    }

    pub fn requests(&self) -> Vec<CapturedRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

impl Default for CaptureResponder {
    fn default() -> Self {
        Self::new()
    }
}

impl Respond for CaptureResponder {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let captured = CapturedRequest {
            body: request.body.clone(),
            headers: request
                .headers
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_str().unwrap_or("").to_string()))
                .collect(),
        };
        self.requests.lock().unwrap().push(captured);
        ResponseTemplate::new(self.response_code)
    }
}

// ---------------------------------------------------------------------------
// CountingResponder - counts requests
// ---------------------------------------------------------------------------

/// A wiremock responder that counts incoming requests.
#[derive(Clone)]
pub struct CountingResponder {
    count: Arc<AtomicU32>,
    response_code: u16,
}

impl CountingResponder {
    pub fn new() -> Self {
        Self::with_status(200)
    }

    pub fn with_status(status: u16) -> Self {
        Self {
            count: Arc::new(AtomicU32::new(0)),
            response_code: status,
        }
    }

    pub fn count(&self) -> u32 {
        self.count.load(Ordering::SeqCst)
    }
}

impl Default for CountingResponder {
    fn default() -> Self {
        Self::new()
    }
}

impl Respond for CountingResponder {
    fn respond(&self, _request: &Request) -> ResponseTemplate {
        self.count.fetch_add(1, Ordering::SeqCst);
        ResponseTemplate::new(self.response_code)
    }
}

// ---------------------------------------------------------------------------
// FailingResponder - fails N times then succeeds
// ---------------------------------------------------------------------------

/// A wiremock responder that fails a specified number of times before
/// succeeding.
#[derive(Clone)]
pub struct FailingResponder {
    attempt_count: Arc<AtomicU32>,
    failures_before_success: u32,
    failure_code: u16,
}

impl FailingResponder {
    /// Fails `n` times with 503, then returns 200.
    pub fn fail_times(n: u32) -> Self {
        Self::fail_with_status(n, 503)
    }

    /// Fails `n` times with a custom status code, then returns 200.
    pub fn fail_with_status(n: u32, failure_code: u16) -> Self {
        Self {
            attempt_count: Arc::new(AtomicU32::new(0)),
            failures_before_success: n,
            failure_code,
        }
    }

    pub fn attempt_count(&self) -> u32 {
        self.attempt_count.load(Ordering::SeqCst)
    }
}

impl Respond for FailingResponder {
    fn respond(&self, _request: &Request) -> ResponseTemplate {
        let n = self.attempt_count.fetch_add(1, Ordering::SeqCst);
        if n < self.failures_before_success {
            ResponseTemplate::new(self.failure_code)
        } else {
            ResponseTemplate::new(200)
        }
    }
}

// ---------------------------------------------------------------------------
// Event and payload fixtures
// ---------------------------------------------------------------------------

pub fn goal(match_id: &str, player: &str, minute: u32) -> MatchEvent {
    MatchEvent::Goal {
        match_id: match_id.to_string(),
        player: player.to_string(),
        minute,
        assist: None,
        home_score: 1,
        away_score: 0,
    }
}

pub fn substitution(match_id: &str, off: &str, on: &str, minute: u32) -> MatchEvent {
    MatchEvent::Substitution {
        match_id: match_id.to_string(),
        player_off: off.to_string(),
        player_on: on.to_string(),
        minute,
    }
}

// ---------------------------------------------------------------------------
// Engine fixture
// ---------------------------------------------------------------------------

/// A dispatcher plus its injected collaborators.
pub struct Engine {
    pub dispatcher: Dispatcher,
    pub store: Arc<MemoryStore>,
    pub clock: Arc<ManualClock>,
}

impl Engine {
    /// Build an engine over fresh in-memory state.
    pub fn new(config: DeliveryConfig) -> Self {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let cache = Arc::new(MemoryCache::new(clock.clone()));
        let dispatcher = Dispatcher::new(config, store.clone(), Some(cache), clock.clone())
            .expect("test configuration is valid");
        Self {
            dispatcher,
            store,
            clock,
        }
    }

    /// An event queue sharing this engine's store and clock.
    pub fn queue(&self) -> EventQueue {
        EventQueue::new(self.store.clone(), self.clock.clone())
    }

    pub fn payload(&self, event: &MatchEvent) -> DeliveryPayload {
        DeliveryPayload::from_event(event, self.clock.as_ref())
    }
}

/// Base test config: fast backoff, generous rate window, insecure URLs
/// allowed so wiremock's loopback listener passes validation.
pub fn base_config() -> DeliveryConfig {
    DeliveryConfig::default()
        .with_allow_insecure(true)
        .with_retry_base_ms(10)
        .with_rate_windows(vec![WindowLimit::per_minute(10_000)])
}

pub fn backend_config(backend_url: &str) -> DeliveryConfig {
    base_config().with_backend(backend_url, TOKEN, TENANT)
}

pub fn webhook_config(webhook_url: &str) -> DeliveryConfig {
    base_config().with_webhook(webhook_url, SECRET)
}

pub fn dual_config(backend_url: &str, webhook_url: &str) -> DeliveryConfig {
    base_config()
        .with_backend(backend_url, TOKEN, TENANT)
        .with_webhook(webhook_url, SECRET)
}
