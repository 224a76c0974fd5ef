//! Common test utilities for agenda-billing-core integration tests

#![allow(dead_code)]

pub mod mock_gateway;
pub mod mock_mail;
pub mod mock_repos;

use std::sync::{Arc, Mutex};
use std::time::Duration as StdDuration;

use agenda_billing_core::{BillingConfig, BillingService, Clock, Scheduler, Stores, Sweeper};
use agenda_db::{PlanRow, SubscriptionRow, TenantRow};
use agenda_types::{PaymentStatus, Subscription, SubscriptionStatus};
use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

pub use mock_gateway::MockGateway;
pub use mock_mail::RecordingMailer;
pub use mock_repos::{
    MockJobLockRepository, MockPlanRepository, MockProcessedEventRepository,
    MockSubscriptionRepository, MockTenantRepository,
};

/// Clock that only moves when told to
pub struct FixedClock(Mutex<DateTime<Utc>>);

impl FixedClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self(Mutex::new(now))
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.0.lock().unwrap();
        *now += by;
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        *self.0.lock().unwrap()
    }
}

pub const WEBHOOK_SECRET: &str = "test-webhook-secret";

/// Engine wired to in-memory collaborators
pub struct Harness {
    pub subscriptions: MockSubscriptionRepository,
    pub plans: MockPlanRepository,
    pub tenants: MockTenantRepository,
    pub processed: MockProcessedEventRepository,
    pub job_locks: MockJobLockRepository,
    pub gateway: MockGateway,
    pub mail: RecordingMailer,
    pub clock: Arc<FixedClock>,
    pub service: BillingService,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(test_config())
    }

    pub fn with_config(config: BillingConfig) -> Self {
        let subscriptions = MockSubscriptionRepository::default();
        let plans = MockPlanRepository::default();
        let tenants = MockTenantRepository::new(subscriptions.clone());
        let processed = MockProcessedEventRepository::default();
        let job_locks = MockJobLockRepository::default();
        let gateway = MockGateway::new();
        let mail = RecordingMailer::default();
        let clock = Arc::new(FixedClock::new(Utc::now()));

        let stores = Stores {
            subscriptions: Arc::new(subscriptions.clone()),
            plans: Arc::new(plans.clone()),
            tenants: Arc::new(tenants.clone()),
            processed_events: Arc::new(processed.clone()),
            job_locks: Arc::new(job_locks.clone()),
        };
        let service = BillingService::new(
            stores,
            Arc::new(gateway.clone()),
            Arc::new(mail.clone()),
            config,
        )
        .with_clock(clock.clone());

        Self {
            subscriptions,
            plans,
            tenants,
            processed,
            job_locks,
            gateway,
            mail,
            clock,
            service,
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub fn sweeper(&self) -> Sweeper {
        Sweeper::new(self.service.clone())
    }

    pub fn scheduler(&self) -> Scheduler {
        Scheduler::new(self.sweeper())
    }

    pub fn add_tenant(&self) -> Uuid {
        let id = Uuid::new_v4();
        self.tenants.insert(TenantRow {
            id,
            name: "Barberia Centro".to_string(),
            email: format!("owner-{id}@example.com"),
            domain: format!("t{}.agenda.test", id.simple()),
            setup_completed: true,
            created_at: self.now() - Duration::days(60),
        });
        id
    }

    pub fn add_plan(&self, is_free: bool, trial_days: i32) -> Uuid {
        let id = Uuid::new_v4();
        let (monthly, annual) = if is_free { (0, 0) } else { (1_500_000, 15_000_000) };
        self.plans.insert(PlanRow {
            id,
            name: if is_free { "Gratis" } else { "Profesional" }.to_string(),
            monthly_price_cents: monthly,
            annual_price_cents: annual,
            currency: "ARS".to_string(),
            trial_days,
            is_free,
            is_popular: !is_free,
            features: vec!["online_booking".to_string()],
            created_at: self.now() - Duration::days(365),
        });
        id
    }

    /// Insert a subscription in `status`, then let `edit` adjust it
    pub fn add_subscription(
        &self,
        tenant_id: Uuid,
        plan_id: Uuid,
        status: SubscriptionStatus,
        edit: impl FnOnce(&mut SubscriptionRow),
    ) -> Uuid {
        let created = self.now() - Duration::days(20);
        let mut row = SubscriptionRow {
            id: Uuid::new_v4(),
            tenant_id,
            plan_id,
            billing_cycle: "monthly".to_string(),
            status: status.as_str().to_string(),
            payment_status: PaymentStatus::Pending.as_str().to_string(),
            trial_ends_at: None,
            grace_period_ends_at: None,
            ends_at: None,
            next_billing_date: None,
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
            created_at: created,
            updated_at: created,
        };
        edit(&mut row);
        let id = row.id;
        self.subscriptions.insert(row);
        id
    }

    pub fn subscription(&self, id: Uuid) -> Subscription {
        Subscription::try_from(self.subscriptions.get(id).expect("subscription exists"))
            .expect("valid row")
    }
}

pub fn test_config() -> BillingConfig {
    BillingConfig::new("TEST-access-token", WEBHOOK_SECRET)
        .with_timeouts(StdDuration::from_secs(10), StdDuration::from_secs(5))
}
