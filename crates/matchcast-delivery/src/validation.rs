//! Payload and endpoint validation.
//!
//! Payloads are checked for shape, size, and an event-type allow-list before
//! any network work. Configured delivery URLs are validated against:
//! - Protocol requirements (HTTPS unless explicitly allowed for dev)
//! - SSRF protections (private/internal IP ranges, metadata endpoints)

use std::net::IpAddr;

use crate::error::DeliveryError;
use crate::models::{DeliveryPayload, ALLOWED_EVENT_TYPES};

/// Hard cap on the serialized payload size.
pub const MAX_PAYLOAD_BYTES: usize = 100 * 1024;

// ---------------------------------------------------------------------------
// Payload validation
// ---------------------------------------------------------------------------

/// Validate an outbound payload.
///
/// Checks:
/// 1. Event type is present and allow-listed
/// 2. `data` is a JSON object carrying a non-empty `match_id`
/// 3. Serialized size is under the hard cap
pub fn validate_payload(payload: &DeliveryPayload) -> Result<(), DeliveryError> {
    if payload.event_type.trim().is_empty() {
        return Err(DeliveryError::Validation(
            "Missing event type".to_string(),
        ));
    }
    if !ALLOWED_EVENT_TYPES.contains(&payload.event_type.as_str()) {
        return Err(DeliveryError::Validation(format!(
            "Unknown event type: {}",
            payload.event_type
        )));
    }

    let Some(data) = payload.data.as_object() else {
        return Err(DeliveryError::Validation(
            "Payload data must be a JSON object".to_string(),
        ));
    };
    match data.get("match_id").and_then(|v| v.as_str()) {
        Some(id) if !id.trim().is_empty() => {}
        _ => {
            return Err(DeliveryError::Validation(
                "Payload data must carry a non-empty match_id".to_string(),
            ));
        }
    }

    let serialized = serde_json::to_vec(payload).map_err(|e| {
        DeliveryError::Validation(format!("Payload is not serializable: {e}"))
    })?;
    if serialized.len() > MAX_PAYLOAD_BYTES {
        return Err(DeliveryError::Validation(format!(
            "Payload size {} exceeds {} byte cap",
            serialized.len(),
            MAX_PAYLOAD_BYTES
        )));
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// Endpoint URL validation
// ---------------------------------------------------------------------------

/// Validate a configured delivery URL.
///
/// Raised at configuration time so misconfiguration fails fast rather than
/// at send time. `allow_insecure` permits plain HTTP and private-network
/// destinations for dev and test setups.
pub fn validate_endpoint_url(raw: &str, allow_insecure: bool) -> Result<(), DeliveryError> {
    let parsed = url::Url::parse(raw)
        .map_err(|e| DeliveryError::Configuration(format!("Invalid URL format: {e}")))?;

    match parsed.scheme() {
        "https" => {}
        "http" if allow_insecure => {}
        "http" => {
            return Err(DeliveryError::Configuration(
                "Delivery URLs must use HTTPS".to_string(),
            ));
        }
        scheme => {
            return Err(DeliveryError::Configuration(format!(
                "Unsupported URL scheme: {scheme}"
            )));
        }
    }

    let host = parsed
        .host_str()
        .ok_or_else(|| DeliveryError::Configuration("URL must have a host".to_string()))?;

    if allow_insecure {
        return Ok(());
    }
    validate_host_not_internal(host)
}

/// Reject private/internal delivery destinations.
///
/// Blocks loopback, RFC1918 ranges, link-local (cloud metadata), CGNAT,
/// IPv6 loopback/unspecified, and common internal hostnames.
pub fn validate_host_not_internal(host: &str) -> Result<(), DeliveryError> {
    if let Ok(ip) = host.parse::<IpAddr>() {
        if is_internal_ip(&ip) {
            return Err(DeliveryError::Configuration(format!(
                "Destination host {host} is a private/internal address"
            )));
        }
    }

    let lower = host.to_ascii_lowercase();
    if lower == "localhost"
        || lower == "metadata.google.internal"
        || lower.ends_with(".internal")
        || lower.ends_with(".local")
    {
        return Err(DeliveryError::Configuration(format!(
            "Destination host {host} is a restricted internal hostname"
        )));
    }

    Ok(())
}

fn is_internal_ip(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_loopback()
                || v4.is_private()
                || v4.is_link_local()
                || v4.is_broadcast()
                || v4.is_unspecified()
                || (v4.octets()[0] == 100 && (v4.octets()[1] & 0xC0) == 64) // 100.64.0.0/10
        }
        IpAddr::V6(v6) => v6.is_loopback() || v6.is_unspecified(),
    }
}
