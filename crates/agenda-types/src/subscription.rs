//! Subscription types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{BillingCycle, ParseEnumError, PlanId, TenantId};

/// Unique subscription identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubscriptionId(pub Uuid);

impl SubscriptionId {
    /// Create a new random subscription ID
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Parse a subscription ID from a string
    pub fn parse(s: &str) -> Result<Self, uuid::Error> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

impl Default for SubscriptionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for SubscriptionId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

/// Lifecycle status of a subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    /// Waiting for a payment method before access starts
    Pending,
    /// In the trial window
    Trial,
    /// Paid up (or on a free plan)
    Active,
    /// Payment failed too many times; access kept until the window closes
    OnGracePeriod,
    /// Paid-plan trial ended without a payment method
    TrialExpired,
    /// Suspended after the grace period ran out
    Paused,
    /// Cancelled by the tenant or by grace-period expiry
    Cancelled,
}

impl SubscriptionStatus {
    pub const ALL: [Self; 7] = [
        Self::Pending,
        Self::Trial,
        Self::Active,
        Self::OnGracePeriod,
        Self::TrialExpired,
        Self::Paused,
        Self::Cancelled,
    ];

    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Trial => "trial",
            Self::Active => "active",
            Self::OnGracePeriod => "on_grace_period",
            Self::TrialExpired => "trial_expired",
            Self::Paused => "paused",
            Self::Cancelled => "cancelled",
        }
    }

    /// Paused and cancelled subscriptions only move again through reactivation.
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Paused | Self::Cancelled)
    }

    /// Whether the tenant currently has access to the product
    pub const fn grants_access(&self) -> bool {
        matches!(self, Self::Trial | Self::Active | Self::OnGracePeriod)
    }
}

impl std::fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for SubscriptionStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| ParseEnumError::new("subscription status", s))
    }
}

/// The payment gateway's view of a subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Pending,
    /// A preapproval must be created or completed by the tenant
    PendingPaymentMethod,
    Active,
    PastDue,
    Expired,
    Suspended,
}

impl PaymentStatus {
    pub const ALL: [Self; 6] = [
        Self::Pending,
        Self::PendingPaymentMethod,
        Self::Active,
        Self::PastDue,
        Self::Expired,
        Self::Suspended,
    ];

    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::PendingPaymentMethod => "pending_payment_method",
            Self::Active => "active",
            Self::PastDue => "past_due",
            Self::Expired => "expired",
            Self::Suspended => "suspended",
        }
    }
}

impl std::fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for PaymentStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| ParseEnumError::new("payment status", s))
    }
}

/// Lifecycle emails, one per `*_sent_at` marker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    /// Paid trial is about to end and no payment method is set up
    TrialExpiring,
    /// A charge was rejected but the retry budget is not exhausted
    PaymentFailed,
    /// Retries exhausted; the grace window is running
    GracePeriod,
}

impl NotificationKind {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::TrialExpiring => "trial_expiring",
            Self::PaymentFailed => "payment_failed",
            Self::GracePeriod => "grace_period",
        }
    }
}

impl std::fmt::Display for NotificationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Tenant subscription
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subscription {
    pub id: SubscriptionId,
    pub tenant_id: TenantId,
    pub plan_id: PlanId,
    pub billing_cycle: BillingCycle,
    pub status: SubscriptionStatus,
    pub payment_status: PaymentStatus,
    pub trial_ends_at: Option<DateTime<Utc>>,
    pub grace_period_ends_at: Option<DateTime<Utc>>,
    /// When access ended (cancellation or suspension)
    pub ends_at: Option<DateTime<Utc>>,
    pub next_billing_date: Option<DateTime<Utc>>,
    pub last_payment_date: Option<DateTime<Utc>>,
    /// Rejected charges in the current billing cycle
    pub failed_payment_attempts: u32,
    pub payment_setup_reminder_sent_at: Option<DateTime<Utc>>,
    pub payment_due_reminder_sent_at: Option<DateTime<Utc>>,
    pub grace_period_reminder_sent_at: Option<DateTime<Utc>>,
    /// MercadoPago preapproval ID
    pub mp_preapproval_id: Option<String>,
    /// Checkout link for the current preapproval
    pub mp_init_point: Option<String>,
    /// Last status string seen from the gateway (advisory)
    pub mp_status: Option<String>,
    /// A gateway cancellation failed and must be retried out of band
    pub gateway_cleanup_required: bool,
    /// Set when the engine could not process the row and a human should look
    pub review_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Subscription {
    /// Marker guarding a notification kind
    pub fn marker(&self, kind: NotificationKind) -> Option<DateTime<Utc>> {
        match kind {
            NotificationKind::TrialExpiring => self.payment_setup_reminder_sent_at,
            NotificationKind::PaymentFailed => self.payment_due_reminder_sent_at,
            NotificationKind::GracePeriod => self.grace_period_reminder_sent_at,
        }
    }

    pub fn set_marker(&mut self, kind: NotificationKind, at: Option<DateTime<Utc>>) {
        match kind {
            NotificationKind::TrialExpiring => self.payment_setup_reminder_sent_at = at,
            NotificationKind::PaymentFailed => self.payment_due_reminder_sent_at = at,
            NotificationKind::GracePeriod => self.grace_period_reminder_sent_at = at,
        }
    }

    /// Clear every reminder marker (a new lifecycle occurrence starts)
    pub fn clear_markers(&mut self) {
        self.payment_setup_reminder_sent_at = None;
        self.payment_due_reminder_sent_at = None;
        self.grace_period_reminder_sent_at = None;
    }

    /// Whether a payment method has been authorized at the gateway
    pub fn has_authorized_payment_method(&self) -> bool {
        self.mp_preapproval_id.is_some() && self.payment_status == PaymentStatus::Active
    }
}
