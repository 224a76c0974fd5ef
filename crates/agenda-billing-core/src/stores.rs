//! Repository handles used by the engine

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::info;
use uuid::Uuid;

use agenda_db::{
    DbError, JobLockRepository, NewSubscriptionEvent, PlanRepository, ProcessedEventRepository,
    Repositories, SubscriptionRepository, SubscriptionRow, TenantRepository,
};
use agenda_types::{Plan, PlanId, Subscription, SubscriptionId, Tenant, TenantId};

use crate::error::BillingError;
use crate::lifecycle::Change;

/// Trait-object repositories, so tests can swap in in-memory stores
#[derive(Clone)]
pub struct Stores {
    pub subscriptions: Arc<dyn SubscriptionRepository>,
    pub plans: Arc<dyn PlanRepository>,
    pub tenants: Arc<dyn TenantRepository>,
    pub processed_events: Arc<dyn ProcessedEventRepository>,
    pub job_locks: Arc<dyn JobLockRepository>,
}

impl From<Repositories> for Stores {
    fn from(repos: Repositories) -> Self {
        Self {
            subscriptions: Arc::new(repos.subscriptions),
            plans: Arc::new(repos.plans),
            tenants: Arc::new(repos.tenants),
            processed_events: Arc::new(repos.processed_events),
            job_locks: Arc::new(repos.job_locks),
        }
    }
}

impl Stores {
    pub async fn subscription(&self, id: SubscriptionId) -> Result<Subscription, BillingError> {
        let row = self
            .subscriptions
            .find_by_id(id.0)
            .await?
            .ok_or(BillingError::SubscriptionNotFound)?;

        Ok(Subscription::try_from(row)?)
    }

    pub async fn plan(&self, id: PlanId) -> Result<Option<Plan>, BillingError> {
        match self.plans.find_by_id(id.0).await? {
            Some(row) => Ok(Some(Plan::try_from(row)?)),
            None => Ok(None),
        }
    }

    /// Plan a stored subscription points at; missing means the row is broken
    pub async fn plan_of(&self, sub: &Subscription) -> Result<Plan, BillingError> {
        self.plan(sub.plan_id).await?.ok_or_else(|| {
            BillingError::DataInconsistency(format!(
                "subscription {} references missing plan {}",
                sub.id, sub.plan_id
            ))
        })
    }

    pub async fn tenant(&self, id: TenantId) -> Result<Option<Tenant>, BillingError> {
        Ok(self.tenants.find_by_id(id.0).await?.map(Tenant::from))
    }

    /// Tenant owning a stored subscription; missing means the row is broken
    pub async fn tenant_of(&self, sub: &Subscription) -> Result<Tenant, BillingError> {
        self.tenant(sub.tenant_id).await?.ok_or_else(|| {
            BillingError::DataInconsistency(format!(
                "subscription {} references missing tenant {}",
                sub.id, sub.tenant_id
            ))
        })
    }

    /// Write `updated` if the stored row is still at the version it was read at.
    ///
    /// `updated` must carry the `updated_at` of the read; a concurrent write makes
    /// this return [`BillingError::Conflict`] without touching the row.
    pub async fn save(
        &self,
        updated: &Subscription,
        change: Option<Change>,
        now: DateTime<Utc>,
    ) -> Result<Subscription, BillingError> {
        let row = SubscriptionRow::from(updated);
        let event = change.map(|c| NewSubscriptionEvent {
            from_status: c.from.as_str().to_string(),
            to_status: c.to.as_str().to_string(),
            reason: c.reason.to_string(),
            occurred_at: now,
        });

        let saved = self
            .subscriptions
            .update_guarded(&row, event)
            .await
            .map_err(|e| match e {
                DbError::Conflict => BillingError::Conflict,
                other => BillingError::Database(other),
            })?
            .ok_or(BillingError::Conflict)?;

        if let Some(change) = change {
            info!(
                subscription_id = %updated.id,
                tenant_id = %updated.tenant_id,
                from = %change.from,
                to = %change.to,
                reason = change.reason,
                "Subscription transitioned"
            );
            metrics::counter!(
                "billing_transitions_total",
                "from" => change.from.as_str(),
                "to" => change.to.as_str(),
                "reason" => change.reason
            )
            .increment(1);
        }

        Ok(Subscription::try_from(saved)?)
    }

    pub async fn flag_for_review(&self, id: Uuid, reason: &str) -> Result<(), BillingError> {
        self.subscriptions.flag_for_review(id, reason).await?;
        Ok(())
    }
}
