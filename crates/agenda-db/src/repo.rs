//! Repository traits
//!
//! Define async repository interfaces for database operations.

use agenda_types::NotificationKind;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::DbResult;
use crate::models::*;

/// Subscription repository trait
#[async_trait]
pub trait SubscriptionRepository: Send + Sync {
    /// Find a subscription by ID
    async fn find_by_id(&self, id: Uuid) -> DbResult<Option<SubscriptionRow>>;

    /// Find the subscription owning a gateway preapproval
    async fn find_by_preapproval_id(&self, preapproval_id: &str)
        -> DbResult<Option<SubscriptionRow>>;

    /// Most recent subscription for a tenant that is not cancelled
    async fn find_current_for_tenant(&self, tenant_id: Uuid) -> DbResult<Option<SubscriptionRow>>;

    /// Create a new subscription; [`crate::DbError::Conflict`] if the tenant already
    /// has a non-cancelled one
    async fn create(&self, sub: CreateSubscription) -> DbResult<SubscriptionRow>;

    /// Trials whose `trial_ends_at` is before `now`
    async fn find_ended_trials(&self, now: DateTime<Utc>) -> DbResult<Vec<SubscriptionRow>>;

    /// Grace periods whose `grace_period_ends_at` is before `now`
    async fn find_ended_grace_periods(&self, now: DateTime<Utc>) -> DbResult<Vec<SubscriptionRow>>;

    /// Trials ending in `[from, until]` with no payment-setup reminder sent yet
    async fn find_trials_ending_unreminded(
        &self,
        from: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> DbResult<Vec<SubscriptionRow>>;

    /// Grace periods whose grace-period notice has not been sent
    async fn find_grace_periods_unnotified(&self) -> DbResult<Vec<SubscriptionRow>>;

    /// Live subscriptions with a preapproval in one of `payment_statuses`,
    /// excluding those waiting on a gateway cleanup
    async fn find_with_preapproval(
        &self,
        payment_statuses: &[&str],
    ) -> DbResult<Vec<SubscriptionRow>>;

    /// Subscriptions whose gateway cancellation must be retried
    async fn find_gateway_cleanup_required(&self) -> DbResult<Vec<SubscriptionRow>>;

    /// `pending` subscriptions created before `created_before`
    async fn find_stale_pending(
        &self,
        created_before: DateTime<Utc>,
    ) -> DbResult<Vec<SubscriptionRow>>;

    /// Write back a modified row.
    ///
    /// Runs in a single transaction holding the row lock. The write only happens
    /// if the stored `updated_at` still equals `row.updated_at` (the version the
    /// caller read); otherwise nothing changes and `None` is returned. The
    /// optional event is appended in the same transaction.
    async fn update_guarded(
        &self,
        row: &SubscriptionRow,
        event: Option<NewSubscriptionEvent>,
    ) -> DbResult<Option<SubscriptionRow>>;

    /// Atomically set the marker for `kind` if it is unset.
    ///
    /// Returns `true` when this call set the marker.
    async fn claim_marker(
        &self,
        id: Uuid,
        kind: NotificationKind,
        at: DateTime<Utc>,
    ) -> DbResult<bool>;

    /// Flag a subscription for manual review
    async fn flag_for_review(&self, id: Uuid, reason: &str) -> DbResult<()>;

    /// Transition history, oldest first
    async fn events_for(&self, id: Uuid) -> DbResult<Vec<SubscriptionEventRow>>;
}

/// Create subscription input
#[derive(Debug, Clone)]
pub struct CreateSubscription {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub plan_id: Uuid,
    pub billing_cycle: String,
    pub status: String,
    pub payment_status: String,
    pub trial_ends_at: Option<DateTime<Utc>>,
    pub next_billing_date: Option<DateTime<Utc>>,
}

/// Transition to append to the history table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewSubscriptionEvent {
    pub from_status: String,
    pub to_status: String,
    pub reason: String,
    pub occurred_at: DateTime<Utc>,
}

/// Plan repository trait
#[async_trait]
pub trait PlanRepository: Send + Sync {
    /// Find a plan by ID
    async fn find_by_id(&self, id: Uuid) -> DbResult<Option<PlanRow>>;
}

/// Tenant directory
#[async_trait]
pub trait TenantRepository: Send + Sync {
    /// Find a tenant by ID
    async fn find_by_id(&self, id: Uuid) -> DbResult<Option<TenantRow>>;

    /// Delete a tenant; subscriptions cascade. Returns whether a row was removed.
    async fn purge(&self, id: Uuid) -> DbResult<bool>;
}

/// Ledger of gateway notifications already applied
#[async_trait]
pub trait ProcessedEventRepository: Send + Sync {
    /// Record an event key; `false` if it was already recorded
    async fn mark_processed(&self, provider: &str, event_key: &str) -> DbResult<bool>;

    /// Forget an event key so a redelivery is processed again
    async fn release(&self, provider: &str, event_key: &str) -> DbResult<()>;
}

/// A job lock held by this runner
#[async_trait]
pub trait JobLease: Send {
    /// Give the lock back
    async fn release(self: Box<Self>) -> DbResult<()>;
}

/// Mutual exclusion for scheduled jobs across processes
#[async_trait]
pub trait JobLockRepository: Send + Sync {
    /// Take the lock for `job`; `None` while another runner holds it
    async fn try_lock(&self, job: &str) -> DbResult<Option<Box<dyn JobLease>>>;
}

/// Column holding the marker for a notification kind
pub const fn marker_column(kind: NotificationKind) -> &'static str {
    match kind {
        NotificationKind::TrialExpiring => "payment_setup_reminder_sent_at",
        NotificationKind::PaymentFailed => "payment_due_reminder_sent_at",
        NotificationKind::GracePeriod => "grace_period_reminder_sent_at",
    }
}
