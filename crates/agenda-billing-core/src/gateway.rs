//! Gateway adapter
//!
//! Bounds every provider call with a timeout and translates between the
//! subscription model and preapproval operations.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use agenda_types::{Plan, Subscription, Tenant};

use crate::config::BillingConfig;
use crate::error::GatewayError;
use crate::provider::{AuthorizedPayment, GatewayStatus, PaymentGateway, Preapproval, PreapprovalRequest};

/// Timeout-bounded front for a [`PaymentGateway`]
#[derive(Clone)]
pub struct GatewayAdapter {
    inner: Arc<dyn PaymentGateway>,
    timeout: Duration,
}

impl GatewayAdapter {
    pub fn new(inner: Arc<dyn PaymentGateway>, timeout: Duration) -> Self {
        Self { inner, timeout }
    }

    async fn bounded<T>(
        &self,
        operation: &'static str,
        call: impl Future<Output = Result<T, GatewayError>>,
    ) -> Result<T, GatewayError> {
        let result = match tokio::time::timeout(self.timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(GatewayError::Network(format!(
                "{operation} timed out after {}s",
                self.timeout.as_secs()
            ))),
        };

        if let Err(e) = &result {
            if !matches!(e, GatewayError::NotFound) {
                metrics::counter!("billing_gateway_errors_total", "operation" => operation, "kind" => e.kind())
                    .increment(1);
            }
        }
        result
    }

    /// Build the preapproval request for `sub` on `plan`.
    ///
    /// The idempotency key is derived from the subscription version so a retried
    /// request before the id was stored maps onto the same gateway object.
    pub fn preapproval_request(
        sub: &Subscription,
        plan: &Plan,
        tenant: &Tenant,
        config: &BillingConfig,
        purpose: &str,
    ) -> PreapprovalRequest {
        PreapprovalRequest {
            idempotency_key: format!(
                "{}:{purpose}:{}:{}:{}",
                sub.id,
                plan.id,
                sub.billing_cycle,
                sub.updated_at.timestamp_micros()
            ),
            external_reference: sub.id.to_string(),
            reason: format!("{} ({})", plan.name, sub.billing_cycle),
            payer_email: tenant.email.clone(),
            back_url: config.payment_return_url(&tenant.domain),
            billing_cycle: sub.billing_cycle,
            amount_cents: plan.price_for(sub.billing_cycle),
            currency: plan.currency.clone(),
        }
    }

    pub async fn create_preapproval(
        &self,
        request: &PreapprovalRequest,
    ) -> Result<Preapproval, GatewayError> {
        self.bounded("create_preapproval", self.inner.create_preapproval(request))
            .await
    }

    /// Best-effort cancellation.
    ///
    /// `Ok(true)` when the preapproval is gone (cancelled now, already missing at
    /// the gateway, or never created). Errors are returned for the caller to log
    /// and flag; they never block a local transition.
    pub async fn cancel_preapproval(&self, preapproval_id: Option<&str>) -> Result<bool, GatewayError> {
        let Some(id) = preapproval_id else {
            return Ok(true);
        };

        match self.bounded("cancel_preapproval", self.inner.cancel_preapproval(id)).await {
            Ok(()) => {
                info!(preapproval_id = %id, "Preapproval cancelled");
                Ok(true)
            }
            Err(GatewayError::NotFound) => {
                info!(preapproval_id = %id, "Preapproval already gone at gateway");
                Ok(true)
            }
            Err(e) => {
                warn!(preapproval_id = %id, error = %e, "Preapproval cancellation failed");
                Err(e)
            }
        }
    }

    /// Current gateway status; a missing preapproval reads as cancelled
    pub async fn poll_status(&self, preapproval_id: &str) -> Result<GatewayStatus, GatewayError> {
        match self
            .bounded("get_preapproval", self.inner.get_preapproval(preapproval_id))
            .await
        {
            Err(GatewayError::NotFound) => Ok(GatewayStatus::Cancelled),
            other => other,
        }
    }

    pub async fn authorized_payment(&self, payment_id: &str) -> Result<AuthorizedPayment, GatewayError> {
        self.bounded(
            "get_authorized_payment",
            self.inner.get_authorized_payment(payment_id),
        )
        .await
    }
}
