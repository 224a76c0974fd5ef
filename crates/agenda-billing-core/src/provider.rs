//! Payment gateway abstraction
//!
//! Abstracts the recurring-billing provider so the lifecycle engine only deals
//! with preapprovals and authorized payments.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use agenda_types::BillingCycle;

use crate::error::GatewayError;

/// Request to create a recurring-billing authorization
#[derive(Debug, Clone, PartialEq)]
pub struct PreapprovalRequest {
    /// Sent as the provider's idempotency key; retries with the same key return
    /// the same preapproval
    pub idempotency_key: String,
    /// Our subscription id, echoed back by the provider
    pub external_reference: String,
    /// Text shown to the payer
    pub reason: String,
    pub payer_email: String,
    pub back_url: String,
    pub billing_cycle: BillingCycle,
    pub amount_cents: i64,
    pub currency: String,
}

/// A preapproval created at the gateway
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Preapproval {
    pub id: String,
    /// Hosted checkout URL the tenant completes
    pub init_point: String,
}

/// Preapproval status as reported by the gateway
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GatewayStatus {
    /// Created, waiting for the payer
    Pending,
    /// Payment method authorized; charges will be collected
    Authorized,
    /// Charges stopped by the provider after failures
    Paused,
    Cancelled,
    /// A status this engine does not act on
    Other(String),
}

impl GatewayStatus {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Pending => "pending",
            Self::Authorized => "authorized",
            Self::Paused => "paused",
            Self::Cancelled => "cancelled",
            Self::Other(other) => other,
        }
    }

    /// Map a provider status string
    pub fn parse(s: &str) -> Self {
        match s {
            "pending" => Self::Pending,
            "authorized" => Self::Authorized,
            "paused" => Self::Paused,
            "cancelled" | "canceled" => Self::Cancelled,
            other => Self::Other(other.to_string()),
        }
    }
}

impl std::fmt::Display for GatewayStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of one recurring charge
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaymentOutcome {
    Approved,
    Rejected,
    /// Still being processed; nothing to apply yet
    Pending,
}

impl PaymentOutcome {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::Pending => "pending",
        }
    }
}

/// A charge collected under a preapproval
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthorizedPayment {
    pub id: String,
    pub preapproval_id: String,
    pub outcome: PaymentOutcome,
    pub charged_at: DateTime<Utc>,
}

/// Payment gateway trait
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    /// Create a preapproval
    async fn create_preapproval(
        &self,
        request: &PreapprovalRequest,
    ) -> Result<Preapproval, GatewayError>;

    /// Cancel a preapproval
    async fn cancel_preapproval(&self, preapproval_id: &str) -> Result<(), GatewayError>;

    /// Current status of a preapproval
    async fn get_preapproval(&self, preapproval_id: &str) -> Result<GatewayStatus, GatewayError>;

    /// Fetch a single charge
    async fn get_authorized_payment(&self, payment_id: &str)
        -> Result<AuthorizedPayment, GatewayError>;
}
