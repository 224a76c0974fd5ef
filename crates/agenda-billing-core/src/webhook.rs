//! MercadoPago webhook verification and parsing

use chrono::{DateTime, Duration, Utc};
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;
use tracing::{debug, error, instrument, warn};

use crate::error::BillingError;
use crate::mercadopago::MpId;

const MILLIS_THRESHOLD: i64 = 1_000_000_000_000;

/// Notification topics we act on
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebhookTopic {
    /// A preapproval changed status
    Preapproval,
    /// A recurring charge was processed
    AuthorizedPayment,
    /// Anything else; acknowledged and ignored
    Other(String),
}

impl From<&str> for WebhookTopic {
    fn from(s: &str) -> Self {
        match s {
            "subscription_preapproval" | "preapproval" => Self::Preapproval,
            "subscription_authorized_payment" | "authorized_payment" => Self::AuthorizedPayment,
            other => Self::Other(other.to_string()),
        }
    }
}

/// Parsed webhook notification
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebhookNotification {
    pub topic: WebhookTopic,
    /// Id of the resource that changed
    pub data_id: String,
    pub action: Option<String>,
}

/// What processing a webhook did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WebhookOutcome {
    Applied,
    /// Already processed earlier
    Duplicate,
    /// Topic or resource we do not track
    Ignored,
}

impl WebhookOutcome {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Applied => "applied",
            Self::Duplicate => "duplicate",
            Self::Ignored => "ignored",
        }
    }
}

/// Verifies `x-signature` headers against the shared secret
#[derive(Clone)]
pub struct WebhookVerifier {
    secret: String,
    tolerance: Duration,
}

impl WebhookVerifier {
    /// Create a new verifier with a five minute timestamp tolerance
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
            tolerance: Duration::minutes(5),
        }
    }

    /// Verify a notification signature.
    ///
    /// The header has the form `ts=<timestamp>,v1=<hex hmac>`; the signed
    /// manifest is `id:<data id>;request-id:<x-request-id>;ts:<ts>;`.
    #[instrument(skip(self, signature))]
    pub fn verify(
        &self,
        signature: &str,
        request_id: Option<&str>,
        data_id: &str,
        now: DateTime<Utc>,
    ) -> Result<(), BillingError> {
        let mut timestamp: Option<&str> = None;
        let mut sig_v1: Option<&str> = None;

        for part in signature.split(',') {
            if let Some((key, value)) = part.trim().split_once('=') {
                match key.trim() {
                    "ts" => timestamp = Some(value.trim()),
                    "v1" => sig_v1 = Some(value.trim()),
                    _ => {}
                }
            }
        }

        let timestamp = timestamp.ok_or_else(|| {
            warn!("Missing timestamp in webhook signature");
            BillingError::Webhook("Missing timestamp".to_string())
        })?;

        let sig_v1 = sig_v1.ok_or_else(|| {
            warn!("Missing v1 signature in webhook signature");
            BillingError::Webhook("Missing signature".to_string())
        })?;

        let expected = self.sign(&manifest(data_id, request_id, timestamp))?;

        if !constant_time_eq(sig_v1.to_ascii_lowercase().as_bytes(), expected.as_bytes()) {
            error!("Webhook signature verification failed");
            return Err(BillingError::Webhook(
                "Signature verification failed".to_string(),
            ));
        }

        let ts: i64 = timestamp
            .parse()
            .map_err(|_| BillingError::Webhook("Invalid timestamp format".to_string()))?;
        let ts_seconds = if ts > MILLIS_THRESHOLD { ts / 1000 } else { ts };
        let age = (now.timestamp() - ts_seconds).abs();
        if age > self.tolerance.num_seconds() {
            warn!(timestamp = ts_seconds, now = now.timestamp(), "Webhook timestamp outside tolerance");
            return Err(BillingError::Webhook("Timestamp too old".to_string()));
        }

        Ok(())
    }

    /// Hex HMAC-SHA256 of `manifest` with the shared secret
    pub fn sign(&self, manifest: &str) -> Result<String, BillingError> {
        let mut mac = Hmac::<Sha256>::new_from_slice(self.secret.as_bytes())
            .map_err(|_| BillingError::Internal("HMAC error".to_string()))?;
        mac.update(manifest.as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }
}

/// Signed manifest; parts whose value is absent are left out
pub fn manifest(data_id: &str, request_id: Option<&str>, timestamp: &str) -> String {
    let mut out = String::new();
    if !data_id.is_empty() {
        let id = if data_id.chars().all(|c| c.is_ascii_alphanumeric()) {
            data_id.to_ascii_lowercase()
        } else {
            data_id.to_string()
        };
        out.push_str(&format!("id:{id};"));
    }
    if let Some(request_id) = request_id.filter(|r| !r.is_empty()) {
        out.push_str(&format!("request-id:{request_id};"));
    }
    out.push_str(&format!("ts:{timestamp};"));
    out
}

/// Parse a notification body
pub fn parse_notification(payload: &[u8]) -> Result<WebhookNotification, BillingError> {
    let raw: RawNotification =
        serde_json::from_slice(payload).map_err(|e| BillingError::Webhook(e.to_string()))?;

    let topic = raw
        .kind
        .or(raw.topic)
        .ok_or_else(|| BillingError::Webhook("Missing notification type".to_string()))?;
    let data_id = raw
        .data
        .and_then(|d| d.id)
        .map(MpId::into_string)
        .ok_or_else(|| BillingError::Webhook("Missing data.id".to_string()))?;

    debug!(topic = %topic, data_id = %data_id, "Parsed webhook notification");

    Ok(WebhookNotification {
        topic: WebhookTopic::from(topic.as_str()),
        data_id,
        action: raw.action,
    })
}

/// Constant-time comparison
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b.iter()).fold(0, |acc, (x, y)| acc | (x ^ y)) == 0
}

// Raw MercadoPago notification for parsing
#[derive(Debug, Deserialize)]
struct RawNotification {
    #[serde(rename = "type")]
    kind: Option<String>,
    topic: Option<String>,
    action: Option<String>,
    data: Option<RawData>,
}

#[derive(Debug, Deserialize)]
struct RawData {
    id: Option<MpId>,
}
