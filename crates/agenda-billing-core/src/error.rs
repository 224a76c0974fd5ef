//! Billing errors

use agenda_db::{DbError, InvalidRow};
use agenda_types::SubscriptionStatus;
use thiserror::Error;

/// Errors at the payment gateway boundary
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GatewayError {
    /// Network failure or timeout; retried on the next sweep
    #[error("gateway unreachable: {0}")]
    Network(String),

    /// Credentials rejected; needs an operator
    #[error("gateway rejected credentials: {0}")]
    Auth(String),

    /// The gateway object no longer exists
    #[error("gateway object not found")]
    NotFound,

    /// Any other rejection from the provider
    #[error("gateway error {status}: {message}")]
    Api {
        /// HTTP status returned by the provider
        status: u16,
        /// Provider message
        message: String,
    },
}

impl GatewayError {
    /// Whether the call may succeed if retried later
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Network(_))
    }

    /// Short label for metrics
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Network(_) => "network",
            Self::Auth(_) => "auth",
            Self::NotFound => "not_found",
            Self::Api { .. } => "api",
        }
    }
}

/// Billing errors
#[derive(Error, Debug)]
pub enum BillingError {
    /// Subscription not found
    #[error("subscription not found")]
    SubscriptionNotFound,

    /// Plan not found
    #[error("plan not found")]
    PlanNotFound,

    /// Tenant not found
    #[error("tenant not found")]
    TenantNotFound,

    /// Subscription belongs to another tenant
    #[error("subscription does not belong to this tenant")]
    NotOwner,

    /// The action is not allowed from the current status
    #[error("cannot {action} a subscription that is {status}")]
    InvalidTransition {
        /// Current status
        status: SubscriptionStatus,
        /// Attempted action
        action: &'static str,
    },

    /// The tenant already has a live subscription
    #[error("tenant already has a subscription")]
    AlreadySubscribed,

    /// Row changed underneath us
    #[error("subscription was modified concurrently, retry the request")]
    Conflict,

    /// Gateway unreachable or timed out
    #[error("payment provider unavailable: {0}")]
    TransientGateway(String),

    /// Gateway refused the call (credentials, configuration, rejected request)
    #[error("payment provider error: {0}")]
    FatalGateway(String),

    /// Stored data cannot be processed
    #[error("data inconsistency: {0}")]
    DataInconsistency(String),

    /// Mail transport failed
    #[error("mail delivery failed: {0}")]
    MailDelivery(String),

    /// Webhook verification or processing error
    #[error("webhook error: {0}")]
    Webhook(String),

    /// Database error
    #[error("database error: {0}")]
    Database(#[from] DbError),

    /// Internal error
    #[error("internal error: {0}")]
    Internal(String),
}

impl BillingError {
    /// Check if this is a not found error
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::SubscriptionNotFound | Self::PlanNotFound | Self::TenantNotFound
        )
    }

    /// Check if this is a gateway error
    pub fn is_gateway_error(&self) -> bool {
        matches!(self, Self::TransientGateway(_) | Self::FatalGateway(_))
    }

    /// Errors that abort a whole sweep instead of a single item
    pub fn is_catastrophic(&self) -> bool {
        matches!(self, Self::Database(_))
    }
}

impl From<GatewayError> for BillingError {
    fn from(err: GatewayError) -> Self {
        if err.is_transient() {
            Self::TransientGateway(err.to_string())
        } else {
            Self::FatalGateway(err.to_string())
        }
    }
}

impl From<InvalidRow> for BillingError {
    fn from(err: InvalidRow) -> Self {
        Self::DataInconsistency(err.to_string())
    }
}
