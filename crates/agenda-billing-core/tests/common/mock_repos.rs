//! In-memory repositories for testing

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::Arc;

use agenda_db::{
    CreateSubscription, DbError, DbResult, JobLease, JobLockRepository, NewSubscriptionEvent,
    PlanRepository, PlanRow,
    ProcessedEventRepository, SubscriptionEventRow, SubscriptionRepository, SubscriptionRow,
    TenantRepository, TenantRow,
};
use agenda_types::NotificationKind;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use uuid::Uuid;

/// In-memory subscription repository
#[derive(Default, Clone)]
pub struct MockSubscriptionRepository {
    rows: Arc<DashMap<Uuid, SubscriptionRow>>,
    events: Arc<DashMap<Uuid, Vec<SubscriptionEventRow>>>,
    next_event_id: Arc<AtomicI64>,
    unavailable: Arc<AtomicBool>,
    lost_updates: Arc<AtomicUsize>,
}

impl MockSubscriptionRepository {
    pub fn insert(&self, row: SubscriptionRow) {
        self.rows.insert(row.id, row);
    }

    pub fn get(&self, id: Uuid) -> Option<SubscriptionRow> {
        self.rows.get(&id).map(|r| r.value().clone())
    }

    pub fn events(&self, id: Uuid) -> Vec<SubscriptionEventRow> {
        self.events.get(&id).map(|e| e.value().clone()).unwrap_or_default()
    }

    /// Simulate a lost database connection
    #[allow(dead_code)]
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Make the next `n` guarded updates lose to a concurrent writer
    #[allow(dead_code)]
    pub fn lose_next_updates(&self, n: usize) {
        self.lost_updates.store(n, Ordering::SeqCst);
    }

    /// Bump `updated_at` as a concurrent writer would
    #[allow(dead_code)]
    pub fn touch(&self, id: Uuid) {
        if let Some(mut row) = self.rows.get_mut(&id) {
            row.updated_at = bump(row.updated_at);
        }
    }

    fn check(&self) -> DbResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(DbError::NotFound);
        }
        Ok(())
    }

    fn select(&self, predicate: impl Fn(&SubscriptionRow) -> bool) -> DbResult<Vec<SubscriptionRow>> {
        self.check()?;
        let mut rows: Vec<SubscriptionRow> = self
            .rows
            .iter()
            .filter(|r| predicate(r.value()))
            .map(|r| r.value().clone())
            .collect();
        rows.sort_by_key(|r| r.created_at);
        Ok(rows)
    }

    pub fn remove_for_tenant(&self, tenant_id: Uuid) {
        self.rows.retain(|_, row| row.tenant_id != tenant_id);
    }
}

fn bump(previous: DateTime<Utc>) -> DateTime<Utc> {
    Utc::now().max(previous + Duration::microseconds(1))
}

fn marker_of(row: &mut SubscriptionRow, kind: NotificationKind) -> &mut Option<DateTime<Utc>> {
    match kind {
        NotificationKind::TrialExpiring => &mut row.payment_setup_reminder_sent_at,
        NotificationKind::PaymentFailed => &mut row.payment_due_reminder_sent_at,
        NotificationKind::GracePeriod => &mut row.grace_period_reminder_sent_at,
    }
}

#[async_trait]
impl SubscriptionRepository for MockSubscriptionRepository {
    async fn find_by_id(&self, id: Uuid) -> DbResult<Option<SubscriptionRow>> {
        self.check()?;
        Ok(self.get(id))
    }

    async fn find_by_preapproval_id(&self, preapproval_id: &str) -> DbResult<Option<SubscriptionRow>> {
        Ok(self
            .select(|r| r.mp_preapproval_id.as_deref() == Some(preapproval_id))?
            .into_iter()
            .next())
    }

    async fn find_current_for_tenant(&self, tenant_id: Uuid) -> DbResult<Option<SubscriptionRow>> {
        Ok(self
            .select(|r| r.tenant_id == tenant_id && r.status != "cancelled")?
            .into_iter()
            .last())
    }

    async fn create(&self, sub: CreateSubscription) -> DbResult<SubscriptionRow> {
        self.check()?;
        if self
            .rows
            .iter()
            .any(|r| r.tenant_id == sub.tenant_id && r.status != "cancelled")
        {
            return Err(DbError::Conflict);
        }

        let now = Utc::now();
        let row = SubscriptionRow {
            id: sub.id,
            tenant_id: sub.tenant_id,
            plan_id: sub.plan_id,
            billing_cycle: sub.billing_cycle,
            status: sub.status,
            payment_status: sub.payment_status,
            trial_ends_at: sub.trial_ends_at,
            grace_period_ends_at: None,
            ends_at: None,
            next_billing_date: sub.next_billing_date,
            last_payment_date: None,
            failed_payment_attempts: 0,
            payment_setup_reminder_sent_at: None,
            payment_due_reminder_sent_at: None,
            grace_period_reminder_sent_at: None,
            mp_preapproval_id: None,
            mp_init_point: None,
            mp_status: None,
            gateway_cleanup_required: false,
            review_reason: None,
            created_at: now,
            updated_at: now,
        };
        self.insert(row.clone());
        Ok(row)
    }

    async fn find_ended_trials(&self, now: DateTime<Utc>) -> DbResult<Vec<SubscriptionRow>> {
        self.select(|r| r.status == "trial" && r.trial_ends_at.is_some_and(|t| t < now))
    }

    async fn find_ended_grace_periods(&self, now: DateTime<Utc>) -> DbResult<Vec<SubscriptionRow>> {
        self.select(|r| {
            r.status == "on_grace_period" && r.grace_period_ends_at.is_some_and(|t| t < now)
        })
    }

    async fn find_trials_ending_unreminded(
        &self,
        from: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> DbResult<Vec<SubscriptionRow>> {
        self.select(|r| {
            r.status == "trial"
                && r.payment_setup_reminder_sent_at.is_none()
                && r.trial_ends_at.is_some_and(|t| t >= from && t <= until)
        })
    }

    async fn find_grace_periods_unnotified(&self) -> DbResult<Vec<SubscriptionRow>> {
        self.select(|r| r.status == "on_grace_period" && r.grace_period_reminder_sent_at.is_none())
    }

    async fn find_with_preapproval(&self, payment_statuses: &[&str]) -> DbResult<Vec<SubscriptionRow>> {
        self.select(|r| {
            r.mp_preapproval_id.is_some()
                && payment_statuses.contains(&r.payment_status.as_str())
                && r.status != "cancelled"
                && r.status != "paused"
                && !r.gateway_cleanup_required
        })
    }

    async fn find_gateway_cleanup_required(&self) -> DbResult<Vec<SubscriptionRow>> {
        self.select(|r| r.gateway_cleanup_required)
    }

    async fn find_stale_pending(&self, created_before: DateTime<Utc>) -> DbResult<Vec<SubscriptionRow>> {
        self.select(|r| r.status == "pending" && r.created_at < created_before)
    }

    async fn update_guarded(
        &self,
        row: &SubscriptionRow,
        event: Option<NewSubscriptionEvent>,
    ) -> DbResult<Option<SubscriptionRow>> {
        self.check()?;
        let lost = self
            .lost_updates
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if lost {
            self.touch(row.id);
            return Ok(None);
        }
        let Some(mut stored) = self.rows.get_mut(&row.id) else {
            return Ok(None);
        };
        if stored.updated_at != row.updated_at {
            return Ok(None);
        }

        let mut updated = row.clone();
        updated.updated_at = bump(stored.updated_at);
        *stored = updated.clone();
        drop(stored);

        if let Some(event) = event {
            let id = self.next_event_id.fetch_add(1, Ordering::SeqCst);
            self.events.entry(row.id).or_default().push(SubscriptionEventRow {
                id,
                subscription_id: row.id,
                from_status: event.from_status,
                to_status: event.to_status,
                reason: event.reason,
                occurred_at: event.occurred_at,
            });
        }

        Ok(Some(updated))
    }

    async fn claim_marker(&self, id: Uuid, kind: NotificationKind, at: DateTime<Utc>) -> DbResult<bool> {
        self.check()?;
        let Some(mut row) = self.rows.get_mut(&id) else {
            return Ok(false);
        };
        let marker = marker_of(&mut row, kind);
        if marker.is_some() {
            return Ok(false);
        }
        *marker = Some(at);
        row.updated_at = bump(row.updated_at);
        Ok(true)
    }

    async fn flag_for_review(&self, id: Uuid, reason: &str) -> DbResult<()> {
        self.check()?;
        if let Some(mut row) = self.rows.get_mut(&id) {
            row.review_reason = Some(reason.to_string());
            row.updated_at = bump(row.updated_at);
        }
        Ok(())
    }

    async fn events_for(&self, id: Uuid) -> DbResult<Vec<SubscriptionEventRow>> {
        Ok(self.events(id))
    }
}

/// In-memory plan repository
#[derive(Default, Clone)]
pub struct MockPlanRepository {
    plans: Arc<DashMap<Uuid, PlanRow>>,
}

impl MockPlanRepository {
    pub fn insert(&self, plan: PlanRow) {
        self.plans.insert(plan.id, plan);
    }
}

#[async_trait]
impl PlanRepository for MockPlanRepository {
    async fn find_by_id(&self, id: Uuid) -> DbResult<Option<PlanRow>> {
        Ok(self.plans.get(&id).map(|r| r.value().clone()))
    }
}

/// In-memory tenant directory; purging cascades to subscriptions
#[derive(Clone)]
pub struct MockTenantRepository {
    tenants: Arc<DashMap<Uuid, TenantRow>>,
    subscriptions: MockSubscriptionRepository,
}

impl MockTenantRepository {
    pub fn new(subscriptions: MockSubscriptionRepository) -> Self {
        Self {
            tenants: Arc::new(DashMap::new()),
            subscriptions,
        }
    }

    pub fn insert(&self, tenant: TenantRow) {
        self.tenants.insert(tenant.id, tenant);
    }

    pub fn contains(&self, id: Uuid) -> bool {
        self.tenants.contains_key(&id)
    }
}

#[async_trait]
impl TenantRepository for MockTenantRepository {
    async fn find_by_id(&self, id: Uuid) -> DbResult<Option<TenantRow>> {
        Ok(self.tenants.get(&id).map(|r| r.value().clone()))
    }

    async fn purge(&self, id: Uuid) -> DbResult<bool> {
        let removed = self.tenants.remove(&id).is_some();
        if removed {
            self.subscriptions.remove_for_tenant(id);
        }
        Ok(removed)
    }
}

/// In-memory processed-event ledger
#[derive(Default, Clone)]
pub struct MockProcessedEventRepository {
    keys: Arc<DashMap<(String, String), ()>>,
}

#[async_trait]
impl ProcessedEventRepository for MockProcessedEventRepository {
    async fn mark_processed(&self, provider: &str, event_key: &str) -> DbResult<bool> {
        Ok(self
            .keys
            .insert((provider.to_string(), event_key.to_string()), ())
            .is_none())
    }

    async fn release(&self, provider: &str, event_key: &str) -> DbResult<()> {
        self.keys.remove(&(provider.to_string(), event_key.to_string()));
        Ok(())
    }
}

/// Job locks shared by every scheduler built on the same harness
#[derive(Default, Clone)]
pub struct MockJobLockRepository {
    held: Arc<DashMap<String, ()>>,
}

impl MockJobLockRepository {
    #[allow(dead_code)]
    pub fn is_held(&self, job: &str) -> bool {
        self.held.contains_key(job)
    }
}

#[async_trait]
impl JobLockRepository for MockJobLockRepository {
    async fn try_lock(&self, job: &str) -> DbResult<Option<Box<dyn JobLease>>> {
        match self.held.entry(job.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(_) => Ok(None),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(());
                Ok(Some(Box::new(MockJobLease {
                    held: Arc::clone(&self.held),
                    job: job.to_string(),
                })))
            }
        }
    }
}

struct MockJobLease {
    held: Arc<DashMap<String, ()>>,
    job: String,
}

#[async_trait]
impl JobLease for MockJobLease {
    async fn release(self: Box<Self>) -> DbResult<()> {
        Ok(())
    }
}

impl Drop for MockJobLease {
    fn drop(&mut self) {
        self.held.remove(&self.job);
    }
}
