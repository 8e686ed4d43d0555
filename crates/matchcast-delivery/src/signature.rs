//! HMAC-SHA256 request signing and verification.
//!
//! Outbound webhook bodies are signed over their exact serialized bytes with
//! the `sha256=<hex>` header form. Inbound callbacks from the webhook router
//! are verified with constant-time comparison plus a timestamp replay window.

use std::collections::BTreeMap;

use hmac::{Hmac, Mac};
use serde::Serialize;
use sha2::Sha256;

use crate::store::Clock;

type HmacSha256 = Hmac<Sha256>;

/// Header value prefix for all signatures.
pub const SIGNATURE_PREFIX: &str = "sha256=";

/// Default replay-protection window.
pub const DEFAULT_TIMESTAMP_TOLERANCE_SECS: i64 = 300;

/// Typed rejection reasons for inbound verification.
///
/// The wire names are normative for callers that surface them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum VerifyRejection {
    MissingSignature,
    InvalidSignatureFormat,
    SignatureMismatch,
    MissingTimestamp,
    InvalidTimestampFormat,
    TimestampTooOld,
}

impl VerifyRejection {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MissingSignature => "missing_signature",
            Self::InvalidSignatureFormat => "invalid_signature_format",
            Self::SignatureMismatch => "signature_mismatch",
            Self::MissingTimestamp => "missing_timestamp",
            Self::InvalidTimestampFormat => "invalid_timestamp_format",
            Self::TimestampTooOld => "timestamp_too_old",
        }
    }
}

/// Result of a verification check. Never panics, never throws.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VerifyOutcome {
    pub valid: bool,
    pub reason: Option<VerifyRejection>,
}

impl VerifyOutcome {
    #[must_use]
    pub fn ok() -> Self {
        Self {
            valid: true,
            reason: None,
        }
    }

    #[must_use]
    pub fn rejected(reason: VerifyRejection) -> Self {
        Self {
            valid: false,
            reason: Some(reason),
        }
    }
}

/// Headers of an inbound callback relevant to verification.
#[derive(Debug, Clone, Copy, Default)]
pub struct InboundHeaders<'a> {
    pub signature: Option<&'a str>,
    pub timestamp: Option<&'a str>,
    pub user_agent: Option<&'a str>,
}

/// Serialize a JSON value with all object keys sorted, recursively.
///
/// Signing and fingerprinting both go through this so the byte stream is
/// stable regardless of how the value was assembled.
#[must_use]
pub fn canonical_json(value: &serde_json::Value) -> String {
    fn sort(value: &serde_json::Value) -> serde_json::Value {
        match value {
            serde_json::Value::Object(map) => {
                let sorted: BTreeMap<&String, serde_json::Value> =
                    map.iter().map(|(k, v)| (k, sort(v))).collect();
                serde_json::to_value(sorted).unwrap_or_default()
            }
            serde_json::Value::Array(items) => {
                serde_json::Value::Array(items.iter().map(sort).collect())
            }
            other => other.clone(),
        }
    }
    serde_json::to_string(&sort(value)).unwrap_or_default()
}

/// Compute the `sha256=<hex>` signature over raw body bytes.
#[must_use]
pub fn sign_bytes(body: &[u8], secret: &str) -> String {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(secret.as_bytes())
        .expect("HMAC can take key of any size");
    mac.update(body);
    format!("{SIGNATURE_PREFIX}{}", hex::encode(mac.finalize().into_bytes()))
}

/// Sign a JSON payload after canonicalizing its key order.
#[must_use]
pub fn sign(payload: &serde_json::Value, secret: &str) -> String {
    sign_bytes(canonical_json(payload).as_bytes(), secret)
}

/// Verify a `sha256=<hex>` signature header against raw body bytes.
///
/// Malformed headers yield a typed rejection, never an error.
#[must_use]
pub fn verify(raw_body: &[u8], signature_header: Option<&str>, secret: &str) -> VerifyOutcome {
    let Some(header) = signature_header else {
        return VerifyOutcome::rejected(VerifyRejection::MissingSignature);
    };
    if header.is_empty() {
        return VerifyOutcome::rejected(VerifyRejection::MissingSignature);
    }

    let Some(hex_part) = header.strip_prefix(SIGNATURE_PREFIX) else {
        return VerifyOutcome::rejected(VerifyRejection::InvalidSignatureFormat);
    };
    // SHA-256 digests are 32 bytes, 64 hex characters.
    if hex_part.len() != 64 || !hex_part.chars().all(|c| c.is_ascii_hexdigit()) {
        return VerifyOutcome::rejected(VerifyRejection::InvalidSignatureFormat);
    }

    let expected = sign_bytes(raw_body, secret);
    if constant_time_eq(header.as_bytes(), expected.as_bytes()) {
        VerifyOutcome::ok()
    } else {
        VerifyOutcome::rejected(VerifyRejection::SignatureMismatch)
    }
}

/// Check a timestamp header against the replay-protection window.
#[must_use]
pub fn verify_timestamp(
    header: Option<&str>,
    tolerance_secs: i64,
    clock: &dyn Clock,
) -> VerifyOutcome {
    let Some(raw) = header else {
        return VerifyOutcome::rejected(VerifyRejection::MissingTimestamp);
    };
    let Ok(timestamp) = raw.trim().parse::<i64>() else {
        return VerifyOutcome::rejected(VerifyRejection::InvalidTimestampFormat);
    };

    let skew = (clock.now().timestamp() - timestamp).abs();
    if skew > tolerance_secs {
        VerifyOutcome::rejected(VerifyRejection::TimestampTooOld)
    } else {
        VerifyOutcome::ok()
    }
}

/// Combined inbound-request validator: signature AND timestamp must hold
/// before a callback is trusted. The sender identifier (`User-Agent`) is
/// advisory only. Every failed dimension is logged as a security-relevant
/// event.
#[must_use]
pub fn verify_request(
    raw_body: &[u8],
    headers: InboundHeaders<'_>,
    secret: &str,
    tolerance_secs: i64,
    clock: &dyn Clock,
) -> VerifyOutcome {
    let signature_check = verify(raw_body, headers.signature, secret);
    if let Some(reason) = signature_check.reason {
        tracing::warn!(
            target: "signature",
            reason = reason.as_str(),
            "Rejected inbound request: signature check failed"
        );
        return signature_check;
    }

    let timestamp_check = verify_timestamp(headers.timestamp, tolerance_secs, clock);
    if let Some(reason) = timestamp_check.reason {
        tracing::warn!(
            target: "signature",
            reason = reason.as_str(),
            "Rejected inbound request: timestamp check failed"
        );
        return timestamp_check;
    }

    match headers.user_agent {
        Some(agent) if !agent.trim().is_empty() => {}
        _ => {
            tracing::warn!(
                target: "signature",
                "Inbound request carries no recognizable sender identifier"
            );
        }
    }

    VerifyOutcome::ok()
}

/// Constant-time byte comparison: length-checked, then XOR-accumulated via
/// the `subtle` crate.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    use subtle::ConstantTimeEq;
    if a.len() != b.len() {
        return false;
    }
    a.ct_eq(b).into()
}
