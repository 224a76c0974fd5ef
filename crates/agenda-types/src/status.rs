//! Read-only status view consumed by the UI layer

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{PaymentStatus, SubscriptionStatus};

/// Something the tenant should be told about their subscription
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Alert {
    /// Trial ends soon
    TrialEndingSoon { days_left: i64 },
    /// Trial ended without a payment method
    TrialExpired,
    /// A preapproval must be created or completed
    PaymentMethodRequired,
    /// At least one charge was rejected this cycle
    PaymentFailed { attempts: u32 },
    /// Access ends when the grace window closes
    GracePeriod { ends_at: DateTime<Utc> },
    /// Suspended after the grace period
    Suspended,
    /// Cancelled; reactivation is possible
    Cancelled,
}

/// Status summary returned by `get_status`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusSummary {
    pub status: SubscriptionStatus,
    pub payment_status: PaymentStatus,
    /// Whole days until the current period (trial, grace, billing) ends
    pub days_until_expiry: Option<i64>,
    pub alerts: Vec<Alert>,
}

/// Outcome of a tenant-admin action
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum ActionOutcome {
    /// The change is already in effect
    Completed { status: SubscriptionStatus },
    /// The tenant must finish checkout at the gateway
    PaymentRequired { payment_url: String },
}
