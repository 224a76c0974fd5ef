//! PostgreSQL plan repository implementation

use async_trait::async_trait;
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::DbResult;
use crate::models::PlanRow;
use crate::repo::PlanRepository;

/// PostgreSQL plan repository
#[derive(Clone)]
pub struct PgPlanRepository {
    pool: PgPool,
}

impl PgPlanRepository {
    /// Create a new plan repository
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl PlanRepository for PgPlanRepository {
    async fn find_by_id(&self, id: Uuid) -> DbResult<Option<PlanRow>> {
        let plan = sqlx::query_as::<_, PlanRow>(
            r#"
            SELECT id, name, monthly_price_cents, annual_price_cents, currency, trial_days,
                   is_free, is_popular, features, created_at
            FROM plans
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(plan)
    }
}
