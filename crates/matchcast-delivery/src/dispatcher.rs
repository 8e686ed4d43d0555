//! Delivery dispatcher.
//!
//! Validates, dedupes, rate-limits, signs, and sends payloads with retry,
//! backoff, and primary-to-fallback routing. Every call returns a
//! [`DeliveryReceipt`] value; network and storage trouble never escapes as
//! a panic or an unhandled error.

use std::sync::Arc;
use std::time::Duration;

use uuid::Uuid;

use crate::config::{BackendConfig, DeliveryConfig, WebhookConfig, DEFAULT_USER_AGENT};
use crate::error::DeliveryError;
use crate::idempotency::{tenant_scoped, IdempotencyStore};
use crate::metrics::{DeliveryMetrics, MetricsSnapshot};
use crate::models::{AttemptRecord, Channel, DeliveryPayload, DeliveryReceipt, Priority};
use crate::rate_limit::RateLimiter;
use crate::signature::{canonical_json, sign_bytes};
use crate::store::{Cache, Clock, Store};
use crate::validation::validate_payload;

/// Per-call dispatch options.
#[derive(Debug, Clone, Default)]
pub struct SendOptions {
    /// Explicit idempotency key; wins over the computed fingerprint.
    pub idempotency_key: Option<String>,
    /// Dedup record lifetime; defaults to the configured TTL.
    pub ttl_secs: Option<i64>,
}

/// Maps an attempt number to a wait before the next try.
///
/// Rate-limit responses back off exponentially (doubling per attempt);
/// server errors back off linearly (base × attempt). Both are capped.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    base: Duration,
    cap: Duration,
}

impl BackoffPolicy {
    #[must_use]
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self { base, cap }
    }

    /// Delay after a 429 on the given attempt (1-based).
    #[must_use]
    pub fn rate_limit_delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base.saturating_mul(factor).min(self.cap)
    }

    /// Delay after a 5xx or transport failure on the given attempt (1-based).
    #[must_use]
    pub fn server_error_delay(&self, attempt: u32) -> Duration {
        self.base.saturating_mul(attempt.max(1)).min(self.cap)
    }
}

/// What a channel dispatch loop concluded.
enum ChannelOutcome {
    /// 2xx response.
    Delivered(u16),
    /// Non-retryable failure; the fallback must not be consulted.
    Permanent(DeliveryError),
    /// Transient failures used up the retry budget; fallback may proceed.
    Exhausted(DeliveryError),
}

/// Outbound delivery dispatcher.
pub struct Dispatcher {
    config: DeliveryConfig,
    http: reqwest::Client,
    idempotency: IdempotencyStore,
    rate_limiter: RateLimiter,
    metrics: Arc<DeliveryMetrics>,
    clock: Arc<dyn Clock>,
    backoff: BackoffPolicy,
}

impl Dispatcher {
    /// Build a dispatcher over the shared store and clock.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::Configuration` when the configuration is
    /// unusable or the HTTP client cannot be built.
    pub fn new(
        config: DeliveryConfig,
        store: Arc<dyn Store>,
        cache: Option<Arc<dyn Cache>>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, DeliveryError> {
        config.validate()?;

        let user_agent = config
            .webhook
            .as_ref()
            .map(|w| w.user_agent.clone())
            .unwrap_or_else(|| DEFAULT_USER_AGENT.to_string());
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .user_agent(user_agent)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| {
                DeliveryError::Configuration(format!("Failed to build HTTP client: {e}"))
            })?;

        let mut idempotency = IdempotencyStore::new(store.clone(), clock.clone());
        if let Some(cache) = cache {
            idempotency = idempotency.with_cache(cache);
        }

        let backoff = BackoffPolicy::new(
            Duration::from_millis(config.retry_base_ms),
            Duration::from_millis(config.retry_cap_ms),
        );

        Ok(Self {
            rate_limiter: RateLimiter::new(store, clock.clone()),
            idempotency,
            metrics: Arc::new(DeliveryMetrics::new()),
            http,
            clock,
            backoff,
            config,
        })
    }

    /// Point-in-time delivery counters.
    #[must_use]
    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// The idempotency store this dispatcher consults.
    #[must_use]
    pub fn idempotency(&self) -> &IdempotencyStore {
        &self.idempotency
    }

    /// The rate limiter guarding the outbound channel.
    #[must_use]
    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.rate_limiter
    }

    /// Dispatch one payload.
    ///
    /// Runs the full pipeline: validation, idempotency check, enhancement,
    /// rate-limit gate, primary dispatch with retries, fallback dispatch.
    pub async fn send(&self, payload: &DeliveryPayload, options: &SendOptions) -> DeliveryReceipt {
        let dispatch_id = Uuid::new_v4();

        if let Err(e) = validate_payload(payload) {
            self.metrics.record_validation_failure();
            tracing::warn!(
                target: "delivery",
                dispatch_id = %dispatch_id,
                event_type = %payload.event_type,
                error = %e,
                "Rejected payload before dispatch"
            );
            return DeliveryReceipt::rejected(&e);
        }

        // Resolve the key before enhancement so delivery metadata cannot
        // create false uniqueness.
        let key = self
            .idempotency
            .resolve_key(payload, options.idempotency_key.as_deref());
        match self.idempotency.is_duplicate(&key).await {
            Ok(true) => {
                self.metrics.record_skipped_duplicate();
                tracing::info!(
                    target: "delivery",
                    dispatch_id = %dispatch_id,
                    event_type = %payload.event_type,
                    idempotency_key = %key,
                    "Duplicate payload, skipping dispatch"
                );
                return DeliveryReceipt::duplicate(key);
            }
            Ok(false) => {}
            Err(e) => {
                // At-least-once: an unreadable dedup record must not block
                // delivery.
                tracing::warn!(
                    target: "delivery",
                    idempotency_key = %key,
                    error = %e,
                    "Idempotency check failed, proceeding with dispatch"
                );
            }
        }

        let priority = Priority::classify(&payload.event_type);
        let mut enhanced = payload.clone();
        enhanced.delivery = Some(serde_json::json!({
            "priority": priority.as_str(),
            "routing": match priority {
                Priority::High => "expedite",
                _ => "standard",
            },
        }));

        let channel_id = if self.config.backend.is_some() {
            "backend_api"
        } else {
            "make_webhook"
        };
        let decision = self
            .rate_limiter
            .check_windows(channel_id, &self.config.rate_windows)
            .await;
        if !decision.allowed {
            self.metrics.record_rate_limited();
            let retry_after_ms = (decision.reset_time - self.clock.now())
                .num_milliseconds()
                .max(0);
            let error = DeliveryError::RateLimited {
                identifier: channel_id.to_string(),
                retry_after_ms,
            };
            tracing::warn!(
                target: "delivery",
                event_type = %payload.event_type,
                identifier = channel_id,
                retry_after_ms,
                "Dispatch denied by rate limiter"
            );
            return DeliveryReceipt::rejected(&error);
        }

        let mut attempts_log: Vec<AttemptRecord> = Vec::new();
        let mut last_error: Option<DeliveryError> = None;

        if let Some(backend) = &self.config.backend {
            match self
                .dispatch_backend(backend, &enhanced, &key, &mut attempts_log)
                .await
            {
                ChannelOutcome::Delivered(code) => {
                    return self
                        .finish_success(&key, code, Channel::Backend, attempts_log, options)
                        .await;
                }
                ChannelOutcome::Permanent(e) => {
                    self.metrics.record_failed();
                    tracing::warn!(
                        target: "delivery",
                        event_type = %enhanced.event_type,
                        error = %e,
                        "Backend rejected payload, not retrying"
                    );
                    return failure_receipt(&key, attempts_log, &e);
                }
                ChannelOutcome::Exhausted(e) => {
                    tracing::warn!(
                        target: "delivery",
                        event_type = %enhanced.event_type,
                        error = %e,
                        "Backend retries exhausted, falling back to webhook"
                    );
                    last_error = Some(e);
                }
            }
        }

        if let Some(webhook) = &self.config.webhook {
            match self
                .dispatch_webhook(webhook, &enhanced, &mut attempts_log)
                .await
            {
                ChannelOutcome::Delivered(code) => {
                    return self
                        .finish_success(&key, code, Channel::Webhook, attempts_log, options)
                        .await;
                }
                ChannelOutcome::Permanent(e) | ChannelOutcome::Exhausted(e) => {
                    last_error = Some(e);
                }
            }
        }

        self.metrics.record_failed();
        let error = last_error.unwrap_or_else(|| {
            DeliveryError::Configuration("No delivery channel configured".to_string())
        });
        tracing::error!(
            target: "delivery",
            dispatch_id = %dispatch_id,
            event_type = %payload.event_type,
            idempotency_key = %key,
            attempts = attempts_log.len(),
            error = %error,
            "Delivery failed on all channels"
        );
        failure_receipt(&key, attempts_log, &error)
    }

    /// Primary channel: authenticated POST to the backend API.
    async fn dispatch_backend(
        &self,
        backend: &BackendConfig,
        payload: &DeliveryPayload,
        key: &str,
        attempts_log: &mut Vec<AttemptRecord>,
    ) -> ChannelOutcome {
        let url = format!("{}/api/v1/post", backend.url.trim_end_matches('/'));
        let body = serde_json::json!({
            "event_type": payload.event_type,
            "data": payload.data,
            "channels": payload.channels,
            "template": payload.template,
        });
        let scoped_key = tenant_scoped(&backend.tenant_id, key);

        self.run_attempts(Channel::Backend, attempts_log, |_attempt| {
            self.http
                .post(&url)
                .bearer_auth(&backend.token)
                .header("X-Tenant-Id", &backend.tenant_id)
                .header("Idempotency-Key", &scoped_key)
                .json(&body)
        })
        .await
    }

    /// Fallback channel: HMAC-signed POST to the webhook router.
    async fn dispatch_webhook(
        &self,
        webhook: &WebhookConfig,
        payload: &DeliveryPayload,
        attempts_log: &mut Vec<AttemptRecord>,
    ) -> ChannelOutcome {
        let body_value = match serde_json::to_value(payload) {
            Ok(v) => v,
            Err(e) => {
                return ChannelOutcome::Permanent(DeliveryError::Validation(format!(
                    "Payload is not serializable: {e}"
                )));
            }
        };
        // The signature covers these exact bytes, so the body must be the
        // canonical serialization.
        let body = canonical_json(&body_value);
        let signature = sign_bytes(body.as_bytes(), &webhook.secret);
        let event_type = payload.event_type.clone();
        let clock = self.clock.clone();
        let prior_attempts = attempts_log.len() as u32;

        self.run_attempts(Channel::Webhook, attempts_log, |attempt| {
            self.http
                .post(&webhook.url)
                .header("Content-Type", "application/json")
                .header("User-Agent", &webhook.user_agent)
                .header("X-Attempt", (prior_attempts + attempt).to_string())
                .header("X-Event-Type", &event_type)
                .header("X-Make-Timestamp", clock.now().timestamp().to_string())
                .header("X-Make-Signature", &signature)
                .body(body.clone())
        })
        .await
    }

    /// Shared retry loop: 429 backs off exponentially, 5xx and transport
    /// errors linearly, anything else non-2xx fails permanently.
    async fn run_attempts<F>(
        &self,
        channel: Channel,
        attempts_log: &mut Vec<AttemptRecord>,
        build_request: F,
    ) -> ChannelOutcome
    where
        F: Fn(u32) -> reqwest::RequestBuilder,
    {
        let max_retries = self.config.max_retries;
        let mut last_error = DeliveryError::Network("no attempt made".to_string());

        for attempt in 1..=max_retries {
            let result = build_request(attempt).send().await;

            match result {
                Ok(response) => {
                    let status = response.status().as_u16();
                    let response_body: String = response
                        .text()
                        .await
                        .unwrap_or_default()
                        .chars()
                        .take(1024)
                        .collect();

                    if (200..300).contains(&status) {
                        attempts_log.push(AttemptRecord {
                            attempt,
                            channel,
                            response_code: Some(status),
                            error: None,
                        });
                        return ChannelOutcome::Delivered(status);
                    }

                    attempts_log.push(AttemptRecord {
                        attempt,
                        channel,
                        response_code: Some(status),
                        error: Some(format!("HTTP {status}")),
                    });

                    if status == 429 {
                        let delay = self.backoff.rate_limit_delay(attempt);
                        last_error = DeliveryError::RateLimited {
                            identifier: channel.as_str().to_string(),
                            retry_after_ms: delay.as_millis() as i64,
                        };
                        if attempt < max_retries {
                            tracing::debug!(
                                target: "delivery",
                                channel = channel.as_str(),
                                attempt,
                                delay_ms = delay.as_millis() as u64,
                                "Throttled upstream, backing off"
                            );
                            tokio::time::sleep(delay).await;
                        }
                    } else if (500..600).contains(&status) {
                        last_error = DeliveryError::Server {
                            status,
                            body: response_body,
                        };
                        if attempt < max_retries {
                            let delay = self.backoff.server_error_delay(attempt);
                            tracing::debug!(
                                target: "delivery",
                                channel = channel.as_str(),
                                attempt,
                                status,
                                delay_ms = delay.as_millis() as u64,
                                "Upstream server error, backing off"
                            );
                            tokio::time::sleep(delay).await;
                        }
                    } else {
                        return ChannelOutcome::Permanent(DeliveryError::Client {
                            status,
                            body: response_body,
                        });
                    }
                }
                Err(e) => {
                    let error: DeliveryError = e.into();
                    attempts_log.push(AttemptRecord {
                        attempt,
                        channel,
                        response_code: None,
                        error: Some(error.to_string()),
                    });
                    last_error = error;
                    if attempt < max_retries {
                        let delay = self.backoff.server_error_delay(attempt);
                        tracing::debug!(
                            target: "delivery",
                            channel = channel.as_str(),
                            attempt,
                            delay_ms = delay.as_millis() as u64,
                            "Transport failure, backing off"
                        );
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }

        ChannelOutcome::Exhausted(last_error)
    }

    /// Record success: mark the key processed and assemble the receipt.
    async fn finish_success(
        &self,
        key: &str,
        response_code: u16,
        channel: Channel,
        attempts_log: Vec<AttemptRecord>,
        options: &SendOptions,
    ) -> DeliveryReceipt {
        // Post-send duplicate check: a concurrent invocation may have
        // delivered and marked this fingerprint while our request was in
        // flight. The send cannot be undone, only observed.
        if let Ok(true) = self.idempotency.is_duplicate(key).await {
            tracing::warn!(
                target: "delivery",
                idempotency_key = %key,
                "Concurrent duplicate dispatch detected after send"
            );
        }

        let ttl = options.ttl_secs.unwrap_or(self.config.idempotency_ttl_secs);
        if let Err(e) = self.idempotency.mark_processed(key, ttl).await {
            tracing::error!(
                target: "delivery",
                idempotency_key = %key,
                error = %e,
                "Delivered but failed to mark processed"
            );
        }

        self.metrics.record_delivered();
        tracing::info!(
            target: "delivery",
            idempotency_key = %key,
            channel = channel.as_str(),
            response_code,
            attempts = attempts_log.len(),
            "Delivery succeeded"
        );

        DeliveryReceipt {
            success: true,
            skipped: false,
            duplicate: false,
            response_code: Some(response_code),
            channel: Some(channel),
            attempts: attempts_log.len() as u32,
            attempts_log,
            error: None,
            idempotency_key: Some(key.to_string()),
        }
    }
}

fn failure_receipt(
    key: &str,
    attempts_log: Vec<AttemptRecord>,
    error: &DeliveryError,
) -> DeliveryReceipt {
    let response_code = attempts_log.iter().rev().find_map(|a| a.response_code);
    let channel = attempts_log.last().map(|a| a.channel);
    DeliveryReceipt {
        success: false,
        skipped: false,
        duplicate: false,
        response_code,
        channel,
        attempts: attempts_log.len() as u32,
        attempts_log,
        error: Some(error.to_string()),
        idempotency_key: Some(key.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rate_limit_backoff_doubles() {
        let policy = BackoffPolicy::new(Duration::from_millis(100), Duration::from_secs(30));
        assert_eq!(policy.rate_limit_delay(1), Duration::from_millis(100));
        assert_eq!(policy.rate_limit_delay(2), Duration::from_millis(200));
        assert_eq!(policy.rate_limit_delay(3), Duration::from_millis(400));
        assert_eq!(policy.rate_limit_delay(4), Duration::from_millis(800));
    }

    #[test]
    fn test_server_error_backoff_is_linear() {
        let policy = BackoffPolicy::new(Duration::from_millis(100), Duration::from_secs(30));
        assert_eq!(policy.server_error_delay(1), Duration::from_millis(100));
        assert_eq!(policy.server_error_delay(2), Duration::from_millis(200));
        assert_eq!(policy.server_error_delay(3), Duration::from_millis(300));
    }

    #[test]
    fn test_backoff_respects_cap() {
        let policy = BackoffPolicy::new(Duration::from_secs(10), Duration::from_secs(15));
        assert_eq!(policy.rate_limit_delay(10), Duration::from_secs(15));
        assert_eq!(policy.server_error_delay(10), Duration::from_secs(15));
    }

    #[test]
    fn test_failure_receipt_carries_last_code_and_trail() {
        let log = vec![
            AttemptRecord {
                attempt: 1,
                channel: Channel::Backend,
                response_code: Some(503),
                error: Some("HTTP 503".to_string()),
            },
            AttemptRecord {
                attempt: 1,
                channel: Channel::Webhook,
                response_code: None,
                error: Some("Network error: reset".to_string()),
            },
        ];
        let error = DeliveryError::Network("reset".to_string());
        let receipt = failure_receipt("goal_abc", log, &error);

        assert!(!receipt.success);
        assert_eq!(receipt.attempts, 2);
        // The primary's failure detail survives in the trail even though the
        // fallback had the last word.
        assert_eq!(receipt.attempts_log[0].response_code, Some(503));
        assert_eq!(receipt.response_code, Some(503));
        assert_eq!(receipt.channel, Some(Channel::Webhook));
    }
}
