//! PostgreSQL subscription repository implementation

use agenda_types::NotificationKind;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::{DbError, DbResult};
use crate::models::{SubscriptionEventRow, SubscriptionRow};
use crate::repo::{marker_column, CreateSubscription, NewSubscriptionEvent, SubscriptionRepository};

const COLUMNS: &str = "id, tenant_id, plan_id, billing_cycle, status, payment_status, \
    trial_ends_at, grace_period_ends_at, ends_at, next_billing_date, last_payment_date, \
    failed_payment_attempts, payment_setup_reminder_sent_at, payment_due_reminder_sent_at, \
    grace_period_reminder_sent_at, mp_preapproval_id, mp_init_point, mp_status, \
    gateway_cleanup_required, review_reason, created_at, updated_at";

/// PostgreSQL subscription repository
#[derive(Clone)]
pub struct PgSubscriptionRepository {
    pool: PgPool,
}

impl PgSubscriptionRepository {
    /// Create a new subscription repository
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn fetch_where(&self, predicate: &str) -> DbResult<Vec<SubscriptionRow>> {
        let sql = format!("SELECT {COLUMNS} FROM subscriptions WHERE {predicate} ORDER BY created_at");
        let rows = sqlx::query_as::<_, SubscriptionRow>(&sql)
            .fetch_all(&self.pool)
            .await?;

        Ok(rows)
    }
}

#[async_trait]
impl SubscriptionRepository for PgSubscriptionRepository {
    async fn find_by_id(&self, id: Uuid) -> DbResult<Option<SubscriptionRow>> {
        let sql = format!("SELECT {COLUMNS} FROM subscriptions WHERE id = $1");
        let sub = sqlx::query_as::<_, SubscriptionRow>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(sub)
    }

    async fn find_by_preapproval_id(
        &self,
        preapproval_id: &str,
    ) -> DbResult<Option<SubscriptionRow>> {
        let sql = format!("SELECT {COLUMNS} FROM subscriptions WHERE mp_preapproval_id = $1");
        let sub = sqlx::query_as::<_, SubscriptionRow>(&sql)
            .bind(preapproval_id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(sub)
    }

    async fn find_current_for_tenant(&self, tenant_id: Uuid) -> DbResult<Option<SubscriptionRow>> {
        let sql = format!(
            r#"
            SELECT {COLUMNS}
            FROM subscriptions
            WHERE tenant_id = $1 AND status <> 'cancelled'
            ORDER BY created_at DESC
            LIMIT 1
            "#
        );
        let sub = sqlx::query_as::<_, SubscriptionRow>(&sql)
            .bind(tenant_id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(sub)
    }

    async fn create(&self, sub: CreateSubscription) -> DbResult<SubscriptionRow> {
        let sql = format!(
            r#"
            INSERT INTO subscriptions (id, tenant_id, plan_id, billing_cycle, status,
                                       payment_status, trial_ends_at, next_billing_date)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            RETURNING {COLUMNS}
            "#
        );
        let row = sqlx::query_as::<_, SubscriptionRow>(&sql)
            .bind(sub.id)
            .bind(sub.tenant_id)
            .bind(sub.plan_id)
            .bind(&sub.billing_cycle)
            .bind(&sub.status)
            .bind(&sub.payment_status)
            .bind(sub.trial_ends_at)
            .bind(sub.next_billing_date)
            .fetch_one(&self.pool)
            .await
            .map_err(DbError::from_write)?;

        Ok(row)
    }

    async fn find_ended_trials(&self, now: DateTime<Utc>) -> DbResult<Vec<SubscriptionRow>> {
        let sql = format!(
            "SELECT {COLUMNS} FROM subscriptions \
             WHERE status = 'trial' AND trial_ends_at < $1 ORDER BY trial_ends_at"
        );
        let rows = sqlx::query_as::<_, SubscriptionRow>(&sql)
            .bind(now)
            .fetch_all(&self.pool)
            .await?;

        Ok(rows)
    }

    async fn find_ended_grace_periods(&self, now: DateTime<Utc>) -> DbResult<Vec<SubscriptionRow>> {
        let sql = format!(
            "SELECT {COLUMNS} FROM subscriptions \
             WHERE status = 'on_grace_period' AND grace_period_ends_at < $1 \
             ORDER BY grace_period_ends_at"
        );
        let rows = sqlx::query_as::<_, SubscriptionRow>(&sql)
            .bind(now)
            .fetch_all(&self.pool)
            .await?;

        Ok(rows)
    }

    async fn find_trials_ending_unreminded(
        &self,
        from: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> DbResult<Vec<SubscriptionRow>> {
        let sql = format!(
            "SELECT {COLUMNS} FROM subscriptions \
             WHERE status = 'trial' AND trial_ends_at BETWEEN $1 AND $2 \
               AND payment_setup_reminder_sent_at IS NULL \
             ORDER BY trial_ends_at"
        );
        let rows = sqlx::query_as::<_, SubscriptionRow>(&sql)
            .bind(from)
            .bind(until)
            .fetch_all(&self.pool)
            .await?;

        Ok(rows)
    }

    async fn find_grace_periods_unnotified(&self) -> DbResult<Vec<SubscriptionRow>> {
        self.fetch_where("status = 'on_grace_period' AND grace_period_reminder_sent_at IS NULL")
            .await
    }

    async fn find_with_preapproval(
        &self,
        payment_statuses: &[&str],
    ) -> DbResult<Vec<SubscriptionRow>> {
        let statuses: Vec<String> = payment_statuses.iter().map(|s| (*s).to_string()).collect();
        let sql = format!(
            "SELECT {COLUMNS} FROM subscriptions \
             WHERE mp_preapproval_id IS NOT NULL AND payment_status = ANY($1) \
               AND status NOT IN ('cancelled', 'paused') AND NOT gateway_cleanup_required \
             ORDER BY created_at"
        );
        let rows = sqlx::query_as::<_, SubscriptionRow>(&sql)
            .bind(&statuses)
            .fetch_all(&self.pool)
            .await?;

        Ok(rows)
    }

    async fn find_gateway_cleanup_required(&self) -> DbResult<Vec<SubscriptionRow>> {
        self.fetch_where("gateway_cleanup_required").await
    }

    async fn find_stale_pending(
        &self,
        created_before: DateTime<Utc>,
    ) -> DbResult<Vec<SubscriptionRow>> {
        let sql = format!(
            "SELECT {COLUMNS} FROM subscriptions \
             WHERE status = 'pending' AND created_at < $1 ORDER BY created_at"
        );
        let rows = sqlx::query_as::<_, SubscriptionRow>(&sql)
            .bind(created_before)
            .fetch_all(&self.pool)
            .await?;

        Ok(rows)
    }

    async fn update_guarded(
        &self,
        row: &SubscriptionRow,
        event: Option<NewSubscriptionEvent>,
    ) -> DbResult<Option<SubscriptionRow>> {
        let mut tx = self.pool.begin().await?;

        let current: Option<DateTime<Utc>> =
            sqlx::query_scalar("SELECT updated_at FROM subscriptions WHERE id = $1 FOR UPDATE")
                .bind(row.id)
                .fetch_optional(&mut *tx)
                .await?;

        if current != Some(row.updated_at) {
            tx.rollback().await?;
            tracing::debug!(subscription_id = %row.id, "Subscription changed concurrently, skipping write");
            return Ok(None);
        }

        let sql = format!(
            r#"
            UPDATE subscriptions SET
                plan_id = $2, billing_cycle = $3, status = $4, payment_status = $5,
                trial_ends_at = $6, grace_period_ends_at = $7, ends_at = $8,
                next_billing_date = $9, last_payment_date = $10, failed_payment_attempts = $11,
                payment_setup_reminder_sent_at = $12, payment_due_reminder_sent_at = $13,
                grace_period_reminder_sent_at = $14, mp_preapproval_id = $15, mp_init_point = $16,
                mp_status = $17, gateway_cleanup_required = $18, review_reason = $19,
                updated_at = clock_timestamp()
            WHERE id = $1
            RETURNING {COLUMNS}
            "#
        );
        let updated = sqlx::query_as::<_, SubscriptionRow>(&sql)
            .bind(row.id)
            .bind(row.plan_id)
            .bind(&row.billing_cycle)
            .bind(&row.status)
            .bind(&row.payment_status)
            .bind(row.trial_ends_at)
            .bind(row.grace_period_ends_at)
            .bind(row.ends_at)
            .bind(row.next_billing_date)
            .bind(row.last_payment_date)
            .bind(row.failed_payment_attempts)
            .bind(row.payment_setup_reminder_sent_at)
            .bind(row.payment_due_reminder_sent_at)
            .bind(row.grace_period_reminder_sent_at)
            .bind(&row.mp_preapproval_id)
            .bind(&row.mp_init_point)
            .bind(&row.mp_status)
            .bind(row.gateway_cleanup_required)
            .bind(&row.review_reason)
            .fetch_one(&mut *tx)
            .await
            .map_err(DbError::from_write)?;

        if let Some(event) = event {
            sqlx::query(
                r#"
                INSERT INTO subscription_events (subscription_id, from_status, to_status, reason, occurred_at)
                VALUES ($1, $2, $3, $4, $5)
                "#,
            )
            .bind(row.id)
            .bind(&event.from_status)
            .bind(&event.to_status)
            .bind(&event.reason)
            .bind(event.occurred_at)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;

        Ok(Some(updated))
    }

    async fn claim_marker(
        &self,
        id: Uuid,
        kind: NotificationKind,
        at: DateTime<Utc>,
    ) -> DbResult<bool> {
        let column = marker_column(kind);
        let sql = format!(
            "UPDATE subscriptions SET {column} = $2, updated_at = clock_timestamp() \
             WHERE id = $1 AND {column} IS NULL"
        );
        let result = sqlx::query(&sql).bind(id).bind(at).execute(&self.pool).await?;

        Ok(result.rows_affected() == 1)
    }

    async fn flag_for_review(&self, id: Uuid, reason: &str) -> DbResult<()> {
        sqlx::query(
            "UPDATE subscriptions SET review_reason = $2, updated_at = clock_timestamp() WHERE id = $1",
        )
        .bind(id)
        .bind(reason)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn events_for(&self, id: Uuid) -> DbResult<Vec<SubscriptionEventRow>> {
        let events = sqlx::query_as::<_, SubscriptionEventRow>(
            r#"
            SELECT id, subscription_id, from_status, to_status, reason, occurred_at
            FROM subscription_events
            WHERE subscription_id = $1
            ORDER BY occurred_at, id
            "#,
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await?;

        Ok(events)
    }
}
