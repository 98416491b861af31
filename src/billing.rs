//! Billing webhook verification and subscription event mapping.
//!
//! The payment provider signs each delivery with a header of the form
//! `t=<unix seconds>,v1=<hex hmac-sha256>` over `"<t>.<raw body>"`. Only
//! the subscription lifecycle events that move a profile between tiers are
//! acted on; everything else is acknowledged and ignored.

use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;

use crate::error::{LedgerError, Result};
use crate::models::{SubscriptionStatus, Tier};

type HmacSha256 = Hmac<Sha256>;

/// Verify a signature header against the raw request body.
///
/// Any `v1` entry may match (the provider sends several while rotating
/// secrets). Timestamps further than `tolerance_secs` from `now_secs` are
/// rejected to stop replays.
pub fn verify_signature(
    payload: &[u8],
    header: &str,
    secret: &str,
    now_secs: i64,
    tolerance_secs: i64,
) -> Result<()> {
    let mut timestamp: Option<&str> = None;
    let mut signatures: Vec<&str> = Vec::new();
    for part in header.split(',') {
        match part.trim().split_once('=') {
            Some(("t", v)) => timestamp = Some(v),
            Some(("v1", v)) => signatures.push(v),
            _ => {}
        }
    }

    let ts_str =
        timestamp.ok_or_else(|| LedgerError::Forbidden("signature header has no timestamp".into()))?;
    let ts: i64 = ts_str
        .parse()
        .map_err(|_| LedgerError::Forbidden(format!("bad signature timestamp: {}", ts_str)))?;
    if now_secs.abs_diff(ts) > tolerance_secs.unsigned_abs() {
        return Err(LedgerError::Forbidden(
            "signature timestamp outside tolerance".into(),
        ));
    }

    for sig in signatures {
        let Ok(expected) = hex::decode(sig) else {
            continue;
        };
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
            .map_err(|e| LedgerError::InvalidInput(format!("webhook secret: {}", e)))?;
        mac.update(ts_str.as_bytes());
        mac.update(b".");
        mac.update(payload);
        if mac.verify_slice(&expected).is_ok() {
            return Ok(());
        }
    }

    Err(LedgerError::Forbidden("no matching webhook signature".into()))
}

/// Compute the `v1` signature for a payload. Used by tests and tooling
/// that replays deliveries.
pub fn sign(payload: &[u8], secret: &str, timestamp: i64) -> Result<String> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| LedgerError::InvalidInput(format!("webhook secret: {}", e)))?;
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(payload);
    Ok(hex::encode(mac.finalize().into_bytes()))
}

#[derive(Debug, Deserialize)]
struct WebhookEvent {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    data: WebhookData,
}

#[derive(Debug, Default, Deserialize)]
struct WebhookData {
    #[serde(default)]
    object: SubscriptionObject,
}

#[derive(Debug, Default, Deserialize)]
struct SubscriptionObject {
    #[serde(default)]
    customer: Option<String>,
    #[serde(default)]
    status: Option<String>,
}

/// Profile change requested by a subscription event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionChange {
    pub customer_id: String,
    /// `None` leaves the tier as it is.
    pub tier: Option<Tier>,
    pub status: SubscriptionStatus,
}

/// Map a webhook body to a profile change. `Ok(None)` for events that do
/// not affect tiers.
pub fn parse_event(payload: &[u8]) -> Result<Option<SubscriptionChange>> {
    let event: WebhookEvent = serde_json::from_slice(payload)
        .map_err(|e| LedgerError::InvalidInput(format!("webhook payload: {}", e)))?;
    if !event.kind.starts_with("customer.subscription.") {
        return Ok(None);
    }
    let customer_id = event.data.object.customer.ok_or_else(|| {
        LedgerError::InvalidInput(format!("{} event without a customer", event.kind))
    })?;

    let change = match event.kind.as_str() {
        "customer.subscription.created" => Some(SubscriptionChange {
            customer_id,
            tier: Some(Tier::Pro),
            status: SubscriptionStatus::Active,
        }),
        "customer.subscription.deleted" => Some(SubscriptionChange {
            customer_id,
            tier: Some(Tier::Free),
            status: SubscriptionStatus::Cancelled,
        }),
        "customer.subscription.updated" => match event.data.object.status.as_deref() {
            Some("past_due") | Some("unpaid") => Some(SubscriptionChange {
                customer_id,
                tier: None,
                status: SubscriptionStatus::PastDue,
            }),
            Some("active") => Some(SubscriptionChange {
                customer_id,
                tier: Some(Tier::Pro),
                status: SubscriptionStatus::Active,
            }),
            Some("canceled") | Some("incomplete_expired") => Some(SubscriptionChange {
                customer_id,
                tier: Some(Tier::Free),
                status: SubscriptionStatus::Cancelled,
            }),
            Some("paused") => Some(SubscriptionChange {
                customer_id,
                tier: Some(Tier::Free),
                status: SubscriptionStatus::Inactive,
            }),
            _ => None,
        },
        _ => None,
    };
    Ok(change)
}
