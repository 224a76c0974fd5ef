//! Reconciliation sweeper
//!
//! One pass per scheduled job. Every subscription is processed behind its own
//! error boundary: a failing item is logged and counted and the pass moves on,
//! except for database failures which abort the pass.

use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use agenda_db::SubscriptionRow;
use agenda_types::{NotificationKind, PaymentStatus, Subscription};

use crate::error::BillingError;
use crate::lifecycle::{self, Effect, Transition};
use crate::notify::Delivery;
use crate::provider::GatewayStatus;
use crate::scheduler::Job;
use crate::service::BillingService;

/// Payment statuses whose preapproval is polled
const POLLED_PAYMENT_STATUSES: [PaymentStatus; 3] = [
    PaymentStatus::PendingPaymentMethod,
    PaymentStatus::Active,
    PaymentStatus::PastDue,
];

/// Counters for one sweep
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub examined: usize,
    pub transitioned: usize,
    pub notified: usize,
    pub gateway_updates: usize,
    pub purged: usize,
    /// Rows skipped because they changed underneath the sweep
    pub conflicts: usize,
    pub failed: usize,
}

impl SweepReport {
    fn add(&mut self, other: SweepReport) {
        self.examined += other.examined;
        self.transitioned += other.transitioned;
        self.notified += other.notified;
        self.gateway_updates += other.gateway_updates;
        self.purged += other.purged;
        self.conflicts += other.conflicts;
        self.failed += other.failed;
    }
}

/// Runs the scheduled lifecycle passes
#[derive(Clone)]
pub struct Sweeper {
    service: BillingService,
}

impl Sweeper {
    pub fn new(service: BillingService) -> Self {
        Self { service }
    }

    pub(crate) fn service(&self) -> &BillingService {
        &self.service
    }

    /// Run one job to completion
    #[instrument(skip(self), fields(job = job.name()))]
    pub async fn run(&self, job: Job) -> Result<SweepReport, BillingError> {
        let started = Instant::now();

        let result = match job {
            Job::Process => self.process().await,
            Job::CheckPreapprovals => self.check_preapprovals().await,
            Job::ProcessDaily => self.process_daily().await,
            Job::Cleanup => self.cleanup().await,
        };

        metrics::histogram!("billing_sweep_duration_seconds", "job" => job.name())
            .record(started.elapsed().as_secs_f64());

        match &result {
            Ok(report) => info!(?report, "Sweep finished"),
            Err(e) => error!(error = %e, "Sweep aborted"),
        }
        result
    }

    /// Hourly lifecycle pass: expiries first, then reminders
    pub async fn process(&self) -> Result<SweepReport, BillingError> {
        let now = self.service.now();
        let subs = &self.service.stores.subscriptions;
        let mut report = SweepReport::default();

        for row in subs.find_ended_trials(now).await? {
            let id = row.id;
            let result = self.end_trial(row, now).await;
            self.absorb(&mut report, id, result).await?;
        }

        for row in subs.find_ended_grace_periods(now).await? {
            let id = row.id;
            let result = self.end_grace_period(row, now).await;
            self.absorb(&mut report, id, result).await?;
        }

        let window_end = now + self.service.config.reminder_window();
        for row in subs.find_trials_ending_unreminded(now, window_end).await? {
            let id = row.id;
            let result = self.remind_trial_ending(row, now).await;
            self.absorb(&mut report, id, result).await?;
        }

        for row in subs.find_grace_periods_unnotified().await? {
            let id = row.id;
            let result = self.notify_row(row, NotificationKind::GracePeriod, now).await;
            self.absorb(&mut report, id, result).await?;
        }

        Ok(report)
    }

    /// Poll the gateway for every live preapproval
    pub async fn check_preapprovals(&self) -> Result<SweepReport, BillingError> {
        let statuses = POLLED_PAYMENT_STATUSES.map(|s| s.as_str());
        let rows = self
            .service
            .stores
            .subscriptions
            .find_with_preapproval(&statuses)
            .await?;

        let mut report = SweepReport::default();
        for row in rows {
            let id = row.id;
            let result = self.reconcile(row).await;
            self.absorb(&mut report, id, result).await?;
        }
        Ok(report)
    }

    /// Daily maintenance: retry gateway cleanups, then the hourly pass again
    pub async fn process_daily(&self) -> Result<SweepReport, BillingError> {
        let mut report = SweepReport::default();

        for row in self
            .service
            .stores
            .subscriptions
            .find_gateway_cleanup_required()
            .await?
        {
            let id = row.id;
            let result = self.retry_gateway_cleanup(row).await;
            self.absorb(&mut report, id, result).await?;
        }

        report.add(self.process().await?);
        Ok(report)
    }

    /// Purge tenants that never finished signing up
    pub async fn cleanup(&self) -> Result<SweepReport, BillingError> {
        let now = self.service.now();
        let cutoff = now - self.service.config.orphan_retention();
        let rows = self.service.stores.subscriptions.find_stale_pending(cutoff).await?;

        let mut report = SweepReport::default();
        for row in rows {
            let id = row.id;
            let result = self.purge_orphan(row).await;
            self.absorb(&mut report, id, result).await?;
        }
        Ok(report)
    }

    /// Per-item error boundary
    async fn absorb(
        &self,
        report: &mut SweepReport,
        subscription_id: Uuid,
        result: Result<SweepReport, BillingError>,
    ) -> Result<(), BillingError> {
        report.examined += 1;

        let err = match result {
            Ok(item) => {
                report.add(item);
                return Ok(());
            }
            Err(e) if e.is_catastrophic() => return Err(e),
            Err(e) => e,
        };

        match &err {
            BillingError::Conflict => {
                debug!(%subscription_id, "Subscription changed during sweep, retrying next run");
                report.conflicts += 1;
                return Ok(());
            }
            BillingError::DataInconsistency(reason) => {
                error!(%subscription_id, %reason, "Subscription skipped and flagged for review");
                self.service.stores.flag_for_review(subscription_id, reason).await?;
            }
            BillingError::FatalGateway(reason) => {
                error!(%subscription_id, %reason, alert = "operator", "Gateway call failed permanently");
            }
            other => {
                warn!(%subscription_id, error = %other, "Subscription processing failed, retrying next run");
            }
        }
        report.failed += 1;
        Ok(())
    }

    async fn end_trial(&self, row: SubscriptionRow, now: DateTime<Utc>) -> Result<SweepReport, BillingError> {
        let sub = Subscription::try_from(row)?;
        let plan = self.service.stores.plan_of(&sub).await?;

        let Some(transition) = lifecycle::next_transition(&sub, &plan, now) else {
            return Ok(SweepReport::default());
        };

        let mut updated = sub.clone();
        let change = lifecycle::apply_transition(&mut updated, transition, now, &self.service.policy);
        let effect = Effect {
            change: Some(change),
            notify: None,
        };
        let committed = self.service.commit(&updated, effect, now).await?;

        Ok(SweepReport {
            transitioned: 1,
            notified: usize::from(committed.notified),
            ..SweepReport::default()
        })
    }

    /// Grace expiry commits before the gateway is touched.
    ///
    /// The terminal row carries `gateway_cleanup_required` until the preapproval
    /// is confirmed cancelled, so a failed cancellation is retried daily.
    async fn end_grace_period(
        &self,
        row: SubscriptionRow,
        now: DateTime<Utc>,
    ) -> Result<SweepReport, BillingError> {
        let sub = Subscription::try_from(row)?;
        let plan = self.service.stores.plan_of(&sub).await?;

        if lifecycle::next_transition(&sub, &plan, now) != Some(Transition::EndGracePeriod) {
            return Ok(SweepReport::default());
        }

        let mut updated = sub.clone();
        let change = lifecycle::apply_transition(
            &mut updated,
            Transition::EndGracePeriod,
            now,
            &self.service.policy,
        );
        updated.gateway_cleanup_required |= updated.mp_preapproval_id.is_some();

        let effect = Effect {
            change: Some(change),
            notify: None,
        };
        let committed = self.service.commit(&updated, effect, now).await?;
        self.service.revoke_committed(committed.subscription).await;

        Ok(SweepReport {
            transitioned: 1,
            ..SweepReport::default()
        })
    }

    async fn remind_trial_ending(
        &self,
        row: SubscriptionRow,
        now: DateTime<Utc>,
    ) -> Result<SweepReport, BillingError> {
        let sub = Subscription::try_from(row)?;
        let plan = self.service.stores.plan_of(&sub).await?;

        if plan.is_free || sub.has_authorized_payment_method() {
            return Ok(SweepReport::default());
        }
        self.notify(&sub, NotificationKind::TrialExpiring, now).await
    }

    async fn notify_row(
        &self,
        row: SubscriptionRow,
        kind: NotificationKind,
        now: DateTime<Utc>,
    ) -> Result<SweepReport, BillingError> {
        let sub = Subscription::try_from(row)?;
        self.notify(&sub, kind, now).await
    }

    async fn notify(
        &self,
        sub: &Subscription,
        kind: NotificationKind,
        now: DateTime<Utc>,
    ) -> Result<SweepReport, BillingError> {
        let delivery = self.service.dispatcher.notify(sub, kind, now).await?;
        Ok(SweepReport {
            notified: usize::from(delivery == Delivery::Sent),
            ..SweepReport::default()
        })
    }

    async fn reconcile(&self, row: SubscriptionRow) -> Result<SweepReport, BillingError> {
        let sub = Subscription::try_from(row)?;
        let Some(preapproval_id) = sub.mp_preapproval_id.as_deref() else {
            return Ok(SweepReport::default());
        };

        let gateway_status = self.service.gateway.poll_status(preapproval_id).await?;
        let now = self.service.now();

        match self.service.apply_gateway_update(&sub, &gateway_status, now).await? {
            Some(committed) => {
                debug!(subscription_id = %sub.id, status = %gateway_status, "Gateway status changed");
                Ok(SweepReport {
                    gateway_updates: 1,
                    transitioned: usize::from(committed.change.is_some()),
                    notified: usize::from(committed.notified),
                    ..SweepReport::default()
                })
            }
            None => Ok(SweepReport::default()),
        }
    }

    async fn retry_gateway_cleanup(&self, row: SubscriptionRow) -> Result<SweepReport, BillingError> {
        let sub = Subscription::try_from(row)?;
        self.service
            .gateway
            .cancel_preapproval(sub.mp_preapproval_id.as_deref())
            .await?;

        let mut updated = sub.clone();
        updated.gateway_cleanup_required = false;
        if updated.status.is_terminal() {
            if updated.mp_preapproval_id.is_some() {
                updated.mp_status = Some(GatewayStatus::Cancelled.as_str().to_string());
            }
        } else {
            updated.mp_preapproval_id = None;
            updated.mp_init_point = None;
            updated.mp_status = None;
        }

        self.service
            .commit(&updated, Effect::default(), self.service.now())
            .await?;
        info!(subscription_id = %sub.id, "Gateway cleanup completed");

        Ok(SweepReport {
            gateway_updates: 1,
            ..SweepReport::default()
        })
    }

    async fn purge_orphan(&self, row: SubscriptionRow) -> Result<SweepReport, BillingError> {
        let sub = Subscription::try_from(row)?;
        let Some(tenant) = self.service.stores.tenant(sub.tenant_id).await? else {
            return Ok(SweepReport::default());
        };
        if tenant.setup_completed {
            return Ok(SweepReport::default());
        }

        self.service
            .gateway
            .cancel_preapproval(sub.mp_preapproval_id.as_deref())
            .await?;

        let purged = self.service.stores.tenants.purge(tenant.id.0).await?;
        if purged {
            info!(tenant_id = %tenant.id, subscription_id = %sub.id, "Purged tenant that never completed setup");
        }

        Ok(SweepReport {
            purged: usize::from(purged),
            ..SweepReport::default()
        })
    }
}
