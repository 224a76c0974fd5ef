//! PostgreSQL repository implementations

mod job_lock;
mod plan;
mod processed_event;
mod subscription;
mod tenant;

pub use job_lock::PgJobLockRepository;
pub use plan::PgPlanRepository;
pub use processed_event::PgProcessedEventRepository;
pub use subscription::PgSubscriptionRepository;
pub use tenant::PgTenantRepository;

use crate::DbPool;

/// All repositories bundled together
#[derive(Clone)]
pub struct Repositories {
    pub subscriptions: PgSubscriptionRepository,
    pub plans: PgPlanRepository,
    pub tenants: PgTenantRepository,
    pub processed_events: PgProcessedEventRepository,
    pub job_locks: PgJobLockRepository,
}

impl Repositories {
    /// Create all repositories from a database pool
    pub fn new(pool: DbPool) -> Self {
        Self {
            subscriptions: PgSubscriptionRepository::new(pool.clone()),
            plans: PgPlanRepository::new(pool.clone()),
            tenants: PgTenantRepository::new(pool.clone()),
            processed_events: PgProcessedEventRepository::new(pool.clone()),
            job_locks: PgJobLockRepository::new(pool),
        }
    }
}
