//! Billing configuration

use std::time::Duration;

use agenda_types::SubscriptionStatus;

const MERCADOPAGO_API_BASE: &str = "https://api.mercadopago.com";

/// What happens to a subscription whose grace period runs out
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GraceExpiryAction {
    /// Move to `cancelled`
    Cancel,
    /// Move to `paused`
    Pause,
}

impl GraceExpiryAction {
    /// Status a subscription lands in when its grace period expires
    pub const fn target_status(&self) -> SubscriptionStatus {
        match self {
            Self::Cancel => SubscriptionStatus::Cancelled,
            Self::Pause => SubscriptionStatus::Paused,
        }
    }
}

impl std::str::FromStr for GraceExpiryAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "cancel" | "cancelled" => Ok(Self::Cancel),
            "pause" | "paused" | "suspend" => Ok(Self::Pause),
            other => Err(format!("unknown grace expiry action: {other}")),
        }
    }
}

/// Billing engine configuration
#[derive(Debug, Clone)]
pub struct BillingConfig {
    /// MercadoPago access token
    pub mercadopago_access_token: String,
    /// Secret used to sign MercadoPago webhook notifications
    pub mercadopago_webhook_secret: String,
    /// MercadoPago API base URL
    pub mercadopago_base_url: String,
    /// Upper bound for a single gateway call
    pub gateway_timeout: Duration,
    /// Upper bound for a single mail transport call
    pub mail_timeout: Duration,
    /// How early the trial-expiring reminder goes out
    pub reminder_days_before_trial_end: u32,
    /// Length of the grace window after retries are exhausted
    pub grace_period_days: u32,
    /// Rejected charges tolerated before the grace period starts
    pub max_failed_attempts: u32,
    pub grace_expiry_action: GraceExpiryAction,
    /// Age after which an unfinished signup is purged
    pub orphan_retention_days: u32,
    /// Path on the tenant domain the gateway sends the payer back to
    pub payment_return_path: String,
}

impl BillingConfig {
    /// Create a new billing config with default lifecycle settings
    pub fn new(
        mercadopago_access_token: impl Into<String>,
        mercadopago_webhook_secret: impl Into<String>,
    ) -> Self {
        Self {
            mercadopago_access_token: mercadopago_access_token.into(),
            mercadopago_webhook_secret: mercadopago_webhook_secret.into(),
            mercadopago_base_url: MERCADOPAGO_API_BASE.to_string(),
            gateway_timeout: Duration::from_secs(10),
            mail_timeout: Duration::from_secs(10),
            reminder_days_before_trial_end: 3,
            grace_period_days: 7,
            max_failed_attempts: 3,
            grace_expiry_action: GraceExpiryAction::Cancel,
            orphan_retention_days: 7,
            payment_return_path: "/subscription/payment-return".to_string(),
        }
    }

    /// Point the gateway client at another base URL (sandbox, mock server)
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.mercadopago_base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    /// Set the per-call timeouts
    pub fn with_timeouts(mut self, gateway: Duration, mail: Duration) -> Self {
        self.gateway_timeout = gateway;
        self.mail_timeout = mail;
        self
    }

    /// Set the lifecycle windows
    pub fn with_lifecycle(
        mut self,
        reminder_days_before_trial_end: u32,
        grace_period_days: u32,
        max_failed_attempts: u32,
    ) -> Self {
        self.reminder_days_before_trial_end = reminder_days_before_trial_end;
        self.grace_period_days = grace_period_days;
        self.max_failed_attempts = max_failed_attempts.max(1);
        self
    }

    pub fn with_grace_expiry_action(mut self, action: GraceExpiryAction) -> Self {
        self.grace_expiry_action = action;
        self
    }

    pub fn with_orphan_retention_days(mut self, days: u32) -> Self {
        self.orphan_retention_days = days;
        self
    }

    pub fn with_payment_return_path(mut self, path: impl Into<String>) -> Self {
        self.payment_return_path = path.into();
        self
    }

    /// URL the payer returns to after checkout
    pub fn payment_return_url(&self, tenant_domain: &str) -> String {
        let path = self.payment_return_path.trim_start_matches('/');
        format!("https://{tenant_domain}/{path}")
    }

    pub fn grace_period(&self) -> chrono::Duration {
        chrono::Duration::days(i64::from(self.grace_period_days))
    }

    pub fn reminder_window(&self) -> chrono::Duration {
        chrono::Duration::days(i64::from(self.reminder_days_before_trial_end))
    }

    pub fn orphan_retention(&self) -> chrono::Duration {
        chrono::Duration::days(i64::from(self.orphan_retention_days))
    }
}
