//! Billing service
//!
//! Tenant-admin actions, webhook processing and the commit path shared with
//! the sweeper. Tenant ids are always explicit parameters.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tracing::{error, info, instrument, warn};

use agenda_db::{CreateSubscription, DbError};
use agenda_types::{
    ActionOutcome, BillingCycle, PaymentStatus, Plan, PlanId, StatusSummary, Subscription,
    SubscriptionId, SubscriptionStatus, TenantId,
};

use crate::clock::{Clock, SystemClock};
use crate::config::BillingConfig;
use crate::error::BillingError;
use crate::gateway::GatewayAdapter;
use crate::lifecycle::{self, Change, Effect, LifecyclePolicy};
use crate::mail::MailTransport;
use crate::notify::NotificationDispatcher;
use crate::provider::{GatewayStatus, PaymentGateway, PaymentOutcome};
use crate::status;
use crate::stores::Stores;
use crate::webhook::{parse_notification, WebhookOutcome, WebhookTopic, WebhookVerifier};

const PROVIDER: &str = "mercadopago";
const CANCEL_ATTEMPTS: usize = 3;

/// A committed mutation
#[derive(Debug, Clone)]
pub struct Committed {
    pub subscription: Subscription,
    pub change: Option<Change>,
    /// A notification was handed to the mail transport
    pub notified: bool,
}

/// Billing service
#[derive(Clone)]
pub struct BillingService {
    pub(crate) stores: Stores,
    pub(crate) gateway: GatewayAdapter,
    pub(crate) dispatcher: NotificationDispatcher,
    pub(crate) config: BillingConfig,
    pub(crate) policy: LifecyclePolicy,
    clock: Arc<dyn Clock>,
    verifier: WebhookVerifier,
}

impl BillingService {
    /// Create a new billing service
    pub fn new(
        stores: Stores,
        gateway: Arc<dyn PaymentGateway>,
        mail: Arc<dyn MailTransport>,
        config: BillingConfig,
    ) -> Self {
        Self {
            gateway: GatewayAdapter::new(gateway, config.gateway_timeout),
            dispatcher: NotificationDispatcher::new(stores.clone(), mail, config.mail_timeout),
            policy: LifecyclePolicy::from(&config),
            verifier: WebhookVerifier::new(config.mercadopago_webhook_secret.clone()),
            clock: Arc::new(SystemClock),
            stores,
            config,
        }
    }

    /// Replace the time source
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn config(&self) -> &BillingConfig {
        &self.config
    }

    pub fn stores(&self) -> &Stores {
        &self.stores
    }

    pub(crate) fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    async fn owned_subscription(
        &self,
        tenant_id: TenantId,
        subscription_id: SubscriptionId,
    ) -> Result<Subscription, BillingError> {
        let sub = self.stores.subscription(subscription_id).await?;
        if sub.tenant_id != tenant_id {
            warn!(subscription_id = %subscription_id, tenant_id = %tenant_id, "Subscription accessed by another tenant");
            return Err(BillingError::NotOwner);
        }
        Ok(sub)
    }

    /// Persist a mutation, then send the notification it claimed
    pub(crate) async fn commit(
        &self,
        updated: &Subscription,
        effect: Effect,
        now: DateTime<Utc>,
    ) -> Result<Committed, BillingError> {
        let subscription = self.stores.save(updated, effect.change, now).await?;

        let mut notified = false;
        if let Some(kind) = effect.notify {
            // The marker is committed; a failed send is not retried
            notified = self
                .dispatcher
                .deliver_claimed(&subscription, kind)
                .await
                .is_ok();
        }

        Ok(Committed {
            subscription,
            change: effect.change,
            notified,
        })
    }

    /// Apply a gateway status to a subscription. `None` if nothing changed.
    pub(crate) async fn apply_gateway_update(
        &self,
        sub: &Subscription,
        gateway_status: &GatewayStatus,
        now: DateTime<Utc>,
    ) -> Result<Option<Committed>, BillingError> {
        let mut updated = sub.clone();
        match lifecycle::apply_gateway_status(&mut updated, gateway_status, now, &self.policy) {
            Some(effect) => Ok(Some(self.commit(&updated, effect, now).await?)),
            None => Ok(None),
        }
    }

    /// Start a subscription for a tenant (signup or a fresh plan selection)
    #[instrument(skip(self))]
    pub async fn create_subscription(
        &self,
        tenant_id: TenantId,
        plan_id: PlanId,
        billing_cycle: BillingCycle,
    ) -> Result<Subscription, BillingError> {
        self.stores
            .tenant(tenant_id)
            .await?
            .ok_or(BillingError::TenantNotFound)?;
        let plan = self
            .stores
            .plan(plan_id)
            .await?
            .ok_or(BillingError::PlanNotFound)?;

        if self
            .stores
            .subscriptions
            .find_current_for_tenant(tenant_id.0)
            .await?
            .is_some()
        {
            return Err(BillingError::AlreadySubscribed);
        }

        let now = self.now();
        let (status, payment_status, trial_ends_at, next_billing_date) = if plan.has_trial() {
            let ends = now + Duration::days(i64::from(plan.trial_days));
            (SubscriptionStatus::Trial, PaymentStatus::Pending, Some(ends), None)
        } else if plan.is_free {
            (SubscriptionStatus::Active, PaymentStatus::Active, None, None)
        } else {
            (
                SubscriptionStatus::Pending,
                PaymentStatus::PendingPaymentMethod,
                None,
                None,
            )
        };

        let row = self
            .stores
            .subscriptions
            .create(CreateSubscription {
                id: SubscriptionId::new().0,
                tenant_id: tenant_id.0,
                plan_id: plan.id.0,
                billing_cycle: billing_cycle.as_str().to_string(),
                status: status.as_str().to_string(),
                payment_status: payment_status.as_str().to_string(),
                trial_ends_at,
                next_billing_date,
            })
            .await
            .map_err(|e| match e {
                DbError::Conflict => BillingError::AlreadySubscribed,
                other => BillingError::Database(other),
            })?;

        let sub = Subscription::try_from(row)?;
        info!(subscription_id = %sub.id, tenant_id = %tenant_id, status = %sub.status, plan = %plan.name, "Subscription created");
        Ok(sub)
    }

    /// Payment link for a paid subscription, creating the preapproval if needed
    #[instrument(skip(self))]
    pub async fn setup_payment_method(
        &self,
        tenant_id: TenantId,
        subscription_id: SubscriptionId,
    ) -> Result<ActionOutcome, BillingError> {
        let sub = self.owned_subscription(tenant_id, subscription_id).await?;
        if sub.status.is_terminal() {
            return Err(BillingError::InvalidTransition {
                status: sub.status,
                action: "set up payment for",
            });
        }

        let plan = self.stores.plan_of(&sub).await?;
        if plan.is_free || sub.has_authorized_payment_method() {
            return Ok(ActionOutcome::Completed { status: sub.status });
        }

        let (_, payment_url) = self.create_preapproval(&sub, &plan).await?;
        Ok(ActionOutcome::PaymentRequired { payment_url })
    }

    /// Create and store a preapproval for `sub`.
    ///
    /// No-op returning the cached checkout URL when one is already stored. A
    /// concurrent retry that stored the same gateway object is treated as
    /// success; any other conflicting write cancels the object just created.
    pub async fn create_preapproval(
        &self,
        sub: &Subscription,
        plan: &Plan,
    ) -> Result<(Subscription, String), BillingError> {
        if let (Some(_), Some(url)) = (&sub.mp_preapproval_id, &sub.mp_init_point) {
            return Ok((sub.clone(), url.clone()));
        }

        let tenant = self.stores.tenant_of(sub).await?;
        let request =
            GatewayAdapter::preapproval_request(sub, plan, &tenant, &self.config, "setup");
        let preapproval = self.gateway.create_preapproval(&request).await?;

        let mut updated = sub.clone();
        updated.mp_preapproval_id = Some(preapproval.id.clone());
        updated.mp_init_point = Some(preapproval.init_point.clone());
        updated.mp_status = Some(GatewayStatus::Pending.as_str().to_string());
        if updated.payment_status != PaymentStatus::PastDue {
            updated.payment_status = PaymentStatus::PendingPaymentMethod;
        }

        let now = self.now();
        match self.stores.save(&updated, None, now).await {
            Ok(saved) => {
                info!(subscription_id = %sub.id, preapproval_id = %preapproval.id, "Preapproval created");
                Ok((saved, preapproval.init_point))
            }
            Err(BillingError::Conflict) => {
                let current = self.stores.subscription(sub.id).await?;
                if current.mp_preapproval_id.as_deref() == Some(preapproval.id.as_str()) {
                    return Ok((current, preapproval.init_point));
                }
                self.compensate(&preapproval.id).await;
                Err(BillingError::Conflict)
            }
            Err(e) => {
                self.compensate(&preapproval.id).await;
                Err(e)
            }
        }
    }

    /// Cancel a preapproval whose local commit failed
    async fn compensate(&self, preapproval_id: &str) {
        if let Err(e) = self.gateway.cancel_preapproval(Some(preapproval_id)).await {
            error!(preapproval_id, error = %e, "Orphaned preapproval could not be cancelled");
        }
    }

    /// Cancel a subscription.
    ///
    /// The local cancellation commits first with `gateway_cleanup_required` set
    /// while a preapproval is stored. The preapproval is then revoked and the flag
    /// cleared in a follow-up write; a failed revocation leaves the flag for the
    /// daily retry.
    #[instrument(skip(self))]
    pub async fn cancel(
        &self,
        tenant_id: TenantId,
        subscription_id: SubscriptionId,
    ) -> Result<ActionOutcome, BillingError> {
        let mut sub = self.owned_subscription(tenant_id, subscription_id).await?;
        if sub.status.is_terminal() {
            return Err(BillingError::InvalidTransition {
                status: sub.status,
                action: "cancel",
            });
        }

        for _ in 0..CANCEL_ATTEMPTS {
            let now = self.now();
            let from = sub.status;
            let mut updated = sub.clone();
            updated.status = SubscriptionStatus::Cancelled;
            updated.payment_status = PaymentStatus::Expired;
            updated.ends_at = Some(now);
            updated.next_billing_date = None;
            updated.gateway_cleanup_required |= updated.mp_preapproval_id.is_some();

            let change = Change {
                from,
                to: SubscriptionStatus::Cancelled,
                reason: "cancelled_by_tenant",
            };
            match self.stores.save(&updated, Some(change), now).await {
                Ok(saved) => {
                    let saved = self.revoke_committed(saved).await;
                    return Ok(ActionOutcome::Completed { status: saved.status });
                }
                Err(BillingError::Conflict) => {
                    sub = self.stores.subscription(subscription_id).await?;
                    if sub.status == SubscriptionStatus::Cancelled {
                        return Ok(ActionOutcome::Completed { status: sub.status });
                    }
                }
                Err(e) => return Err(e),
            }
        }

        Err(BillingError::Conflict)
    }

    /// Revoke the preapproval of a subscription already committed as terminal.
    ///
    /// Clears `gateway_cleanup_required` in a guarded follow-up write once the
    /// gateway confirms. Any failure leaves the committed flag for the daily retry.
    pub(crate) async fn revoke_committed(&self, committed: Subscription) -> Subscription {
        if !committed.gateway_cleanup_required {
            return committed;
        }

        if let Err(e) = self
            .gateway
            .cancel_preapproval(committed.mp_preapproval_id.as_deref())
            .await
        {
            if e.is_transient() {
                warn!(subscription_id = %committed.id, error = %e, "Gateway cancellation deferred to cleanup");
            } else {
                error!(subscription_id = %committed.id, error = %e, alert = "operator", "Preapproval cancellation rejected");
            }
            return committed;
        }

        let mut cleared = committed.clone();
        cleared.gateway_cleanup_required = false;
        if cleared.mp_preapproval_id.is_some() {
            cleared.mp_status = Some(GatewayStatus::Cancelled.as_str().to_string());
        }
        match self.stores.save(&cleared, None, self.now()).await {
            Ok(saved) => saved,
            Err(e) => {
                warn!(subscription_id = %committed.id, error = %e, "Revocation not recorded, cleanup will retry");
                committed
            }
        }
    }

    /// Reactivate a cancelled or paused subscription.
    ///
    /// Free plans reactivate immediately. Paid plans get a new preapproval first;
    /// the subscription waits in `pending` (or resumes an unfinished trial) until
    /// the gateway authorizes it. A gateway error leaves the subscription as it was.
    #[instrument(skip(self))]
    pub async fn reactivate(
        &self,
        tenant_id: TenantId,
        subscription_id: SubscriptionId,
        plan_id: PlanId,
        billing_cycle: BillingCycle,
    ) -> Result<ActionOutcome, BillingError> {
        let sub = self.owned_subscription(tenant_id, subscription_id).await?;
        if !sub.status.is_terminal() {
            return Err(BillingError::InvalidTransition {
                status: sub.status,
                action: "reactivate",
            });
        }

        if let Some(current) = self
            .stores
            .subscriptions
            .find_current_for_tenant(tenant_id.0)
            .await?
        {
            if current.id != sub.id.0 {
                return Err(BillingError::AlreadySubscribed);
            }
        }

        let plan = self
            .stores
            .plan(plan_id)
            .await?
            .ok_or(BillingError::PlanNotFound)?;
        let now = self.now();

        let mut updated = sub.clone();
        start_new_period(&mut updated, &plan, billing_cycle);
        updated.ends_at = None;

        // A preapproval still awaiting cleanup must be gone before the row moves on
        let previous = sub
            .gateway_cleanup_required
            .then_some(sub.mp_preapproval_id.as_deref())
            .flatten();

        if plan.is_free {
            self.release_preapproval(&mut updated, previous).await?;
            updated.status = SubscriptionStatus::Active;
            updated.payment_status = PaymentStatus::Active;

            let change = Change {
                from: sub.status,
                to: SubscriptionStatus::Active,
                reason: "reactivated",
            };
            let saved = self.stores.save(&updated, Some(change), now).await?;
            return Ok(ActionOutcome::Completed { status: saved.status });
        }

        let to = match updated.trial_ends_at {
            Some(ends) if ends > now => SubscriptionStatus::Trial,
            _ => SubscriptionStatus::Pending,
        };
        updated.status = to;
        updated.payment_status = PaymentStatus::PendingPaymentMethod;

        let payment_url = self
            .replace_preapproval(updated, &plan, "reactivate", previous, Change {
                from: sub.status,
                to,
                reason: "reactivated",
            })
            .await?;

        Ok(ActionOutcome::PaymentRequired { payment_url })
    }

    /// Move a live subscription to another plan and/or billing cycle.
    ///
    /// All or nothing: when the gateway fails the subscription is left as it was
    /// and at most the previous preapproval stays live.
    #[instrument(skip(self))]
    pub async fn change_plan(
        &self,
        tenant_id: TenantId,
        subscription_id: SubscriptionId,
        plan_id: PlanId,
        billing_cycle: Option<BillingCycle>,
    ) -> Result<ActionOutcome, BillingError> {
        let sub = self.owned_subscription(tenant_id, subscription_id).await?;
        if sub.status.is_terminal() {
            return Err(BillingError::InvalidTransition {
                status: sub.status,
                action: "change the plan of",
            });
        }

        let billing_cycle = billing_cycle.unwrap_or(sub.billing_cycle);
        if sub.plan_id == plan_id && sub.billing_cycle == billing_cycle {
            return Ok(ActionOutcome::Completed { status: sub.status });
        }

        let plan = self
            .stores
            .plan(plan_id)
            .await?
            .ok_or(BillingError::PlanNotFound)?;
        let now = self.now();

        let mut updated = sub.clone();
        start_new_period(&mut updated, &plan, billing_cycle);
        let previous = sub.mp_preapproval_id.as_deref();

        if plan.is_free {
            self.release_preapproval(&mut updated, previous).await?;
            updated.status = SubscriptionStatus::Active;
            updated.payment_status = PaymentStatus::Active;

            let change = Change {
                from: sub.status,
                to: SubscriptionStatus::Active,
                reason: "plan_changed",
            };
            let saved = self.stores.save(&updated, Some(change), now).await?;
            return Ok(ActionOutcome::Completed { status: saved.status });
        }

        let to = match sub.status {
            SubscriptionStatus::Trial => SubscriptionStatus::Trial,
            _ => SubscriptionStatus::Pending,
        };
        updated.status = to;
        updated.payment_status = PaymentStatus::PendingPaymentMethod;

        let payment_url = self
            .replace_preapproval(updated, &plan, "change-plan", previous, Change {
                from: sub.status,
                to,
                reason: "plan_changed",
            })
            .await?;

        Ok(ActionOutcome::PaymentRequired { payment_url })
    }

    /// Swap the preapproval of `updated` for a new one and commit with `change`.
    ///
    /// Order is create new, cancel `previous`, save. Nothing is written unless
    /// both gateway calls succeed; the new preapproval is cancelled again when a
    /// later step fails.
    async fn replace_preapproval(
        &self,
        mut updated: Subscription,
        plan: &Plan,
        purpose: &str,
        previous: Option<&str>,
        change: Change,
    ) -> Result<String, BillingError> {
        let tenant = self.stores.tenant_of(&updated).await?;
        let request =
            GatewayAdapter::preapproval_request(&updated, plan, &tenant, &self.config, purpose);
        let preapproval = self.gateway.create_preapproval(&request).await?;

        let previous = previous.filter(|old| *old != preapproval.id);
        if let Err(e) = self.gateway.cancel_preapproval(previous).await {
            warn!(subscription_id = %updated.id, error = %e, "Previous preapproval still live, abandoning replacement");
            self.compensate(&preapproval.id).await;
            return Err(e.into());
        }

        updated.mp_preapproval_id = Some(preapproval.id.clone());
        updated.mp_init_point = Some(preapproval.init_point.clone());
        updated.mp_status = Some(GatewayStatus::Pending.as_str().to_string());
        updated.gateway_cleanup_required = false;

        let change = (change.from != change.to).then_some(change);
        if let Err(e) = self.stores.save(&updated, change, self.now()).await {
            if let Some(old) = previous {
                error!(subscription_id = %updated.id, preapproval_id = old, error = %e, "Previous preapproval cancelled but replacement not saved");
            }
            self.compensate(&preapproval.id).await;
            return Err(e);
        }

        Ok(preapproval.init_point)
    }

    /// Cancel `previous` at the gateway and drop the preapproval fields.
    ///
    /// Nothing is cleared when the gateway fails, so the caller writes nothing.
    async fn release_preapproval(
        &self,
        updated: &mut Subscription,
        previous: Option<&str>,
    ) -> Result<(), BillingError> {
        self.gateway.cancel_preapproval(previous).await?;

        updated.mp_preapproval_id = None;
        updated.mp_init_point = None;
        updated.mp_status = None;
        updated.gateway_cleanup_required = false;
        Ok(())
    }

    /// Read-only status view
    pub async fn get_status(
        &self,
        tenant_id: TenantId,
        subscription_id: SubscriptionId,
    ) -> Result<StatusSummary, BillingError> {
        let sub = self.owned_subscription(tenant_id, subscription_id).await?;
        let plan = self.stores.plan_of(&sub).await?;

        Ok(status::summarize(
            &sub,
            &plan,
            self.now(),
            self.config.reminder_days_before_trial_end,
        ))
    }

    /// Verify and apply a gateway notification
    #[instrument(skip(self, payload, signature))]
    pub async fn process_webhook(
        &self,
        payload: &[u8],
        signature: Option<&str>,
        request_id: Option<&str>,
    ) -> Result<WebhookOutcome, BillingError> {
        let notification = parse_notification(payload)?;
        let signature =
            signature.ok_or_else(|| BillingError::Webhook("Missing signature".to_string()))?;
        self.verifier
            .verify(signature, request_id, &notification.data_id, self.now())?;

        let outcome = match notification.topic {
            WebhookTopic::Preapproval => self.preapproval_notified(&notification.data_id).await?,
            WebhookTopic::AuthorizedPayment => self.payment_notified(&notification.data_id).await?,
            WebhookTopic::Other(topic) => {
                info!(topic = %topic, "Ignoring webhook topic");
                WebhookOutcome::Ignored
            }
        };

        metrics::counter!("billing_webhooks_total", "outcome" => outcome.as_str()).increment(1);
        Ok(outcome)
    }

    async fn preapproval_notified(&self, preapproval_id: &str) -> Result<WebhookOutcome, BillingError> {
        let Some(row) = self
            .stores
            .subscriptions
            .find_by_preapproval_id(preapproval_id)
            .await?
        else {
            info!(preapproval_id, "Webhook for unknown preapproval");
            return Ok(WebhookOutcome::Ignored);
        };
        let sub = Subscription::try_from(row)?;
        if sub.status.is_terminal() {
            return Ok(WebhookOutcome::Ignored);
        }

        let gateway_status = self.gateway.poll_status(preapproval_id).await?;
        match self.apply_gateway_update(&sub, &gateway_status, self.now()).await? {
            Some(_) => Ok(WebhookOutcome::Applied),
            None => Ok(WebhookOutcome::Duplicate),
        }
    }

    async fn payment_notified(&self, payment_id: &str) -> Result<WebhookOutcome, BillingError> {
        let payment = self.gateway.authorized_payment(payment_id).await?;
        if payment.outcome == PaymentOutcome::Pending {
            return Ok(WebhookOutcome::Ignored);
        }

        let key = format!("{}:{}", payment.id, payment.outcome.as_str());
        if !self.stores.processed_events.mark_processed(PROVIDER, &key).await? {
            return Ok(WebhookOutcome::Duplicate);
        }

        let result = self.apply_payment(&payment.preapproval_id, payment.outcome, payment.charged_at).await;
        match result {
            Ok(WebhookOutcome::Applied) => Ok(WebhookOutcome::Applied),
            Ok(other) => {
                self.stores.processed_events.release(PROVIDER, &key).await?;
                Ok(other)
            }
            Err(e) => {
                self.stores.processed_events.release(PROVIDER, &key).await?;
                Err(e)
            }
        }
    }

    async fn apply_payment(
        &self,
        preapproval_id: &str,
        outcome: PaymentOutcome,
        charged_at: DateTime<Utc>,
    ) -> Result<WebhookOutcome, BillingError> {
        let Some(row) = self
            .stores
            .subscriptions
            .find_by_preapproval_id(preapproval_id)
            .await?
        else {
            info!(preapproval_id, "Payment for unknown preapproval");
            return Ok(WebhookOutcome::Ignored);
        };
        let sub = Subscription::try_from(row)?;
        if sub.status.is_terminal() {
            return Ok(WebhookOutcome::Ignored);
        }

        let now = self.now();
        let mut updated = sub.clone();
        let effect = match outcome {
            PaymentOutcome::Approved => lifecycle::record_payment_success(&mut updated, charged_at),
            _ => lifecycle::record_payment_failure(&mut updated, now, &self.policy, false),
        };
        self.commit(&updated, effect, now).await?;

        Ok(WebhookOutcome::Applied)
    }
}

/// Reset the per-period state for a new plan selection
fn start_new_period(sub: &mut Subscription, plan: &Plan, billing_cycle: BillingCycle) {
    sub.plan_id = plan.id;
    sub.billing_cycle = billing_cycle;
    sub.failed_payment_attempts = 0;
    sub.grace_period_ends_at = None;
    sub.next_billing_date = None;
    sub.review_reason = None;
    sub.clear_markers();
}
