//! PostgreSQL ledger of applied gateway notifications

use async_trait::async_trait;
use sqlx::PgPool;

use crate::error::DbResult;
use crate::repo::ProcessedEventRepository;

/// PostgreSQL processed-event repository
#[derive(Clone)]
pub struct PgProcessedEventRepository {
    pool: PgPool,
}

impl PgProcessedEventRepository {
    /// Create a new processed-event repository
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ProcessedEventRepository for PgProcessedEventRepository {
    async fn mark_processed(&self, provider: &str, event_key: &str) -> DbResult<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO processed_gateway_events (provider, event_key)
            VALUES ($1, $2)
            ON CONFLICT (provider, event_key) DO NOTHING
            "#,
        )
        .bind(provider)
        .bind(event_key)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn release(&self, provider: &str, event_key: &str) -> DbResult<()> {
        sqlx::query("DELETE FROM processed_gateway_events WHERE provider = $1 AND event_key = $2")
            .bind(provider)
            .bind(event_key)
            .execute(&self.pool)
            .await?;

        Ok(())
    }
}
