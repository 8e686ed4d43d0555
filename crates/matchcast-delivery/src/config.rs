//! Delivery engine configuration.
//!
//! At least one outbound channel (backend or webhook) must be configured.
//! URLs are validated up front so misconfiguration fails fast at
//! construction rather than at send time.

use serde::Deserialize;

use crate::error::DeliveryError;
use crate::rate_limit::WindowLimit;
use crate::validation::validate_endpoint_url;

/// Default User-Agent for outbound requests.
pub const DEFAULT_USER_AGENT: &str = "matchcast-delivery/0.1";

/// Primary backend channel.
#[derive(Debug, Clone, Deserialize)]
pub struct BackendConfig {
    /// Base URL; the dispatcher posts to `{url}/api/v1/post`.
    pub url: String,
    /// Bearer token (JWT) for the `Authorization` header.
    pub token: String,
    /// Tenant for the `X-Tenant-Id` header and idempotency-key scoping.
    pub tenant_id: String,
}

/// Secondary webhook channel.
#[derive(Debug, Clone, Deserialize)]
pub struct WebhookConfig {
    pub url: String,
    /// Shared secret for the `X-Make-Signature` HMAC.
    pub secret: String,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

fn default_user_agent() -> String {
    DEFAULT_USER_AGENT.to_string()
}

/// Engine configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DeliveryConfig {
    pub backend: Option<BackendConfig>,
    pub webhook: Option<WebhookConfig>,
    /// HTTP attempts per channel (initial attempt included).
    pub max_retries: u32,
    /// Base backoff delay between retries.
    pub retry_base_ms: u64,
    /// Backoff ceiling.
    pub retry_cap_ms: u64,
    pub request_timeout_secs: u64,
    pub idempotency_ttl_secs: i64,
    /// Sliding windows enforced on the outbound channel identifier.
    pub rate_windows: Vec<WindowLimit>,
    /// Permit plain HTTP and private-network destinations (dev/test only).
    pub allow_insecure: bool,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            backend: None,
            webhook: None,
            max_retries: 3,
            retry_base_ms: 1_000,
            retry_cap_ms: 30_000,
            request_timeout_secs: 10,
            idempotency_ttl_secs: crate::idempotency::DEFAULT_TTL_SECS,
            rate_windows: vec![WindowLimit::per_minute(30)],
            allow_insecure: false,
        }
    }
}

impl DeliveryConfig {
    #[must_use]
    pub fn with_backend(
        mut self,
        url: impl Into<String>,
        token: impl Into<String>,
        tenant_id: impl Into<String>,
    ) -> Self {
        self.backend = Some(BackendConfig {
            url: url.into(),
            token: token.into(),
            tenant_id: tenant_id.into(),
        });
        self
    }

    #[must_use]
    pub fn with_webhook(mut self, url: impl Into<String>, secret: impl Into<String>) -> Self {
        self.webhook = Some(WebhookConfig {
            url: url.into(),
            secret: secret.into(),
            user_agent: default_user_agent(),
        });
        self
    }

    #[must_use]
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    #[must_use]
    pub fn with_retry_base_ms(mut self, base_ms: u64) -> Self {
        self.retry_base_ms = base_ms;
        self
    }

    #[must_use]
    pub fn with_rate_windows(mut self, windows: Vec<WindowLimit>) -> Self {
        self.rate_windows = windows;
        self
    }

    #[must_use]
    pub fn with_allow_insecure(mut self, allow: bool) -> Self {
        self.allow_insecure = allow;
        self
    }

    /// Load from environment variables (`MATCHCAST_*`).
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::Configuration` when a channel is half-set
    /// (URL without credential or vice versa) or no channel is set at all.
    pub fn from_env() -> Result<Self, DeliveryError> {
        let mut config = Self::default();

        let backend_url = std::env::var("MATCHCAST_BACKEND_URL").ok();
        let backend_token = std::env::var("MATCHCAST_BACKEND_TOKEN").ok();
        let tenant_id = std::env::var("MATCHCAST_TENANT_ID").ok();
        match (backend_url, backend_token, tenant_id) {
            (Some(url), Some(token), Some(tenant_id)) => {
                config.backend = Some(BackendConfig {
                    url,
                    token,
                    tenant_id,
                });
            }
            (None, None, None) => {}
            _ => {
                return Err(DeliveryError::Configuration(
                    "Backend channel requires MATCHCAST_BACKEND_URL, \
                     MATCHCAST_BACKEND_TOKEN and MATCHCAST_TENANT_ID together"
                        .to_string(),
                ));
            }
        }

        let webhook_url = std::env::var("MATCHCAST_WEBHOOK_URL").ok();
        let webhook_secret = std::env::var("MATCHCAST_WEBHOOK_SECRET").ok();
        match (webhook_url, webhook_secret) {
            (Some(url), Some(secret)) => {
                config.webhook = Some(WebhookConfig {
                    url,
                    secret,
                    user_agent: default_user_agent(),
                });
            }
            (None, None) => {}
            _ => {
                return Err(DeliveryError::Configuration(
                    "Webhook channel requires MATCHCAST_WEBHOOK_URL and \
                     MATCHCAST_WEBHOOK_SECRET together"
                        .to_string(),
                ));
            }
        }

        if let Ok(raw) = std::env::var("MATCHCAST_MAX_RETRIES") {
            config.max_retries = raw.parse().map_err(|_| {
                DeliveryError::Configuration(format!("MATCHCAST_MAX_RETRIES is not a number: {raw}"))
            })?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Fail fast on unusable configuration.
    pub fn validate(&self) -> Result<(), DeliveryError> {
        if self.backend.is_none() && self.webhook.is_none() {
            return Err(DeliveryError::Configuration(
                "No delivery channel configured".to_string(),
            ));
        }

        if let Some(backend) = &self.backend {
            validate_endpoint_url(&backend.url, self.allow_insecure)?;
            if backend.token.trim().is_empty() {
                return Err(DeliveryError::Configuration(
                    "Backend token is empty".to_string(),
                ));
            }
            if backend.tenant_id.trim().is_empty() {
                return Err(DeliveryError::Configuration(
                    "Backend tenant id is empty".to_string(),
                ));
            }
        }

        if let Some(webhook) = &self.webhook {
            validate_endpoint_url(&webhook.url, self.allow_insecure)?;
            if webhook.secret.trim().is_empty() {
                return Err(DeliveryError::Configuration(
                    "Webhook secret is empty".to_string(),
                ));
            }
        }

        if self.max_retries == 0 {
            return Err(DeliveryError::Configuration(
                "max_retries must be at least 1".to_string(),
            ));
        }

        Ok(())
    }
}
