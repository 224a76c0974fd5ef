//! Notification dispatcher
//!
//! At most one email per marker occurrence: the marker is claimed before the
//! message reaches the transport and is kept when delivery fails.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::json;
use tracing::{debug, info, warn};

use agenda_types::{NotificationKind, Subscription, Tenant};

use crate::error::BillingError;
use crate::mail::{MailMessage, MailTransport};
use crate::stores::Stores;

/// Whether a notification went out
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Sent,
    /// The marker was already set by an earlier run
    AlreadySent,
}

/// Sends lifecycle emails guarded by the `*_sent_at` markers
#[derive(Clone)]
pub struct NotificationDispatcher {
    stores: Stores,
    mail: Arc<dyn MailTransport>,
    timeout: Duration,
}

impl NotificationDispatcher {
    pub fn new(stores: Stores, mail: Arc<dyn MailTransport>, timeout: Duration) -> Self {
        Self {
            stores,
            mail,
            timeout,
        }
    }

    /// Claim the marker for `kind` and send if this call claimed it
    pub async fn notify(
        &self,
        sub: &Subscription,
        kind: NotificationKind,
        now: DateTime<Utc>,
    ) -> Result<Delivery, BillingError> {
        let tenant = self.stores.tenant_of(sub).await?;

        let claimed = self
            .stores
            .subscriptions
            .claim_marker(sub.id.0, kind, now)
            .await?;
        if !claimed {
            debug!(subscription_id = %sub.id, kind = %kind, "Notification already sent");
            return Ok(Delivery::AlreadySent);
        }

        self.send(&tenant, sub, kind).await?;
        Ok(Delivery::Sent)
    }

    /// Send a notification whose marker was set by the committed transition
    pub async fn deliver_claimed(
        &self,
        sub: &Subscription,
        kind: NotificationKind,
    ) -> Result<(), BillingError> {
        let tenant = self.stores.tenant_of(sub).await?;
        self.send(&tenant, sub, kind).await
    }

    async fn send(
        &self,
        tenant: &Tenant,
        sub: &Subscription,
        kind: NotificationKind,
    ) -> Result<(), BillingError> {
        let message = MailMessage {
            to: tenant.email.clone(),
            template: kind,
            data: template_data(tenant, sub),
        };

        let result = match tokio::time::timeout(self.timeout, self.mail.send(&message)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(BillingError::MailDelivery(e.to_string())),
            Err(_) => Err(BillingError::MailDelivery(format!(
                "mail transport timed out after {}s",
                self.timeout.as_secs()
            ))),
        };

        match &result {
            Ok(()) => {
                info!(subscription_id = %sub.id, tenant_id = %tenant.id, kind = %kind, "Notification sent");
                metrics::counter!("billing_notifications_total", "kind" => kind.as_str(), "result" => "sent")
                    .increment(1);
            }
            Err(e) => {
                warn!(subscription_id = %sub.id, kind = %kind, error = %e, "Notification not delivered, marker kept");
                metrics::counter!("billing_notifications_total", "kind" => kind.as_str(), "result" => "failed")
                    .increment(1);
            }
        }
        result
    }
}

fn template_data(tenant: &Tenant, sub: &Subscription) -> serde_json::Value {
    json!({
        "tenant_name": tenant.name,
        "tenant_domain": tenant.domain,
        "subscription_id": sub.id,
        "status": sub.status,
        "trial_ends_at": sub.trial_ends_at,
        "grace_period_ends_at": sub.grace_period_ends_at,
        "failed_payment_attempts": sub.failed_payment_attempts,
        "payment_url": sub.mp_init_point,
    })
}
