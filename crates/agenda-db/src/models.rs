//! Database row models
//!
//! These types map directly to database rows using SQLx's FromRow derive.
//! Enum columns are stored as text and validated when converting to domain types.

use agenda_types::{Plan, PlanId, Subscription, SubscriptionId, Tenant, TenantId};
use chrono::{DateTime, Utc};
use sqlx::FromRow;
use uuid::Uuid;

use crate::error::InvalidRow;

/// Subscription row from the database
#[derive(Debug, Clone, PartialEq, FromRow)]
pub struct SubscriptionRow {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub plan_id: Uuid,
    pub billing_cycle: String,
    pub status: String,
    pub payment_status: String,
    pub trial_ends_at: Option<DateTime<Utc>>,
    pub grace_period_ends_at: Option<DateTime<Utc>>,
    pub ends_at: Option<DateTime<Utc>>,
    pub next_billing_date: Option<DateTime<Utc>>,
    pub last_payment_date: Option<DateTime<Utc>>,
    pub failed_payment_attempts: i32,
    pub payment_setup_reminder_sent_at: Option<DateTime<Utc>>,
    pub payment_due_reminder_sent_at: Option<DateTime<Utc>>,
    pub grace_period_reminder_sent_at: Option<DateTime<Utc>>,
    pub mp_preapproval_id: Option<String>,
    pub mp_init_point: Option<String>,
    pub mp_status: Option<String>,
    pub gateway_cleanup_required: bool,
    pub review_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Plan row from the database
#[derive(Debug, Clone, FromRow)]
pub struct PlanRow {
    pub id: Uuid,
    pub name: String,
    pub monthly_price_cents: i64,
    pub annual_price_cents: i64,
    pub currency: String,
    pub trial_days: i32,
    pub is_free: bool,
    pub is_popular: bool,
    pub features: Vec<String>,
    pub created_at: DateTime<Utc>,
}

/// Tenant row from the database
#[derive(Debug, Clone, FromRow)]
pub struct TenantRow {
    pub id: Uuid,
    pub name: String,
    pub email: String,
    pub domain: String,
    pub setup_completed: bool,
    pub created_at: DateTime<Utc>,
}

/// Subscription transition history row
#[derive(Debug, Clone, FromRow)]
pub struct SubscriptionEventRow {
    pub id: i64,
    pub subscription_id: Uuid,
    pub from_status: String,
    pub to_status: String,
    pub reason: String,
    pub occurred_at: DateTime<Utc>,
}

// Conversions between rows and agenda-types domain types

impl TryFrom<SubscriptionRow> for Subscription {
    type Error = InvalidRow;

    fn try_from(row: SubscriptionRow) -> Result<Self, Self::Error> {
        let invalid = |reason: String| InvalidRow {
            table: "subscriptions",
            id: row.id.to_string(),
            reason,
        };

        let billing_cycle = row.billing_cycle.parse().map_err(|e| invalid(format!("{e}")))?;
        let status = row.status.parse().map_err(|e| invalid(format!("{e}")))?;
        let payment_status = row
            .payment_status
            .parse()
            .map_err(|e| invalid(format!("{e}")))?;
        let failed_payment_attempts = u32::try_from(row.failed_payment_attempts)
            .map_err(|_| invalid("negative failed_payment_attempts".to_string()))?;

        Ok(Self {
            id: SubscriptionId(row.id),
            tenant_id: TenantId(row.tenant_id),
            plan_id: PlanId(row.plan_id),
            billing_cycle,
            status,
            payment_status,
            trial_ends_at: row.trial_ends_at,
            grace_period_ends_at: row.grace_period_ends_at,
            ends_at: row.ends_at,
            next_billing_date: row.next_billing_date,
            last_payment_date: row.last_payment_date,
            failed_payment_attempts,
            payment_setup_reminder_sent_at: row.payment_setup_reminder_sent_at,
            payment_due_reminder_sent_at: row.payment_due_reminder_sent_at,
            grace_period_reminder_sent_at: row.grace_period_reminder_sent_at,
            mp_preapproval_id: row.mp_preapproval_id,
            mp_init_point: row.mp_init_point,
            mp_status: row.mp_status,
            gateway_cleanup_required: row.gateway_cleanup_required,
            review_reason: row.review_reason,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

impl From<&Subscription> for SubscriptionRow {
    fn from(sub: &Subscription) -> Self {
        Self {
            id: sub.id.0,
            tenant_id: sub.tenant_id.0,
            plan_id: sub.plan_id.0,
            billing_cycle: sub.billing_cycle.as_str().to_string(),
            status: sub.status.as_str().to_string(),
            payment_status: sub.payment_status.as_str().to_string(),
            trial_ends_at: sub.trial_ends_at,
            grace_period_ends_at: sub.grace_period_ends_at,
            ends_at: sub.ends_at,
            next_billing_date: sub.next_billing_date,
            last_payment_date: sub.last_payment_date,
            failed_payment_attempts: i32::try_from(sub.failed_payment_attempts).unwrap_or(i32::MAX),
            payment_setup_reminder_sent_at: sub.payment_setup_reminder_sent_at,
            payment_due_reminder_sent_at: sub.payment_due_reminder_sent_at,
            grace_period_reminder_sent_at: sub.grace_period_reminder_sent_at,
            mp_preapproval_id: sub.mp_preapproval_id.clone(),
            mp_init_point: sub.mp_init_point.clone(),
            mp_status: sub.mp_status.clone(),
            gateway_cleanup_required: sub.gateway_cleanup_required,
            review_reason: sub.review_reason.clone(),
            created_at: sub.created_at,
            updated_at: sub.updated_at,
        }
    }
}

impl TryFrom<PlanRow> for Plan {
    type Error = InvalidRow;

    fn try_from(row: PlanRow) -> Result<Self, Self::Error> {
        let trial_days = u32::try_from(row.trial_days).map_err(|_| InvalidRow {
            table: "plans",
            id: row.id.to_string(),
            reason: "negative trial_days".to_string(),
        })?;

        Ok(Self {
            id: PlanId(row.id),
            name: row.name,
            monthly_price_cents: row.monthly_price_cents,
            annual_price_cents: row.annual_price_cents,
            currency: row.currency,
            trial_days,
            is_free: row.is_free,
            is_popular: row.is_popular,
            features: row.features,
        })
    }
}

impl From<TenantRow> for Tenant {
    fn from(row: TenantRow) -> Self {
        Self {
            id: TenantId(row.id),
            name: row.name,
            email: row.email,
            domain: row.domain,
            setup_completed: row.setup_completed,
            created_at: row.created_at,
        }
    }
}
