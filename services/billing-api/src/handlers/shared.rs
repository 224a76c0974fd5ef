//! Shared handler utilities
//!
//! Path parsing and metrics helpers used across handlers.

use std::time::Instant;

use uuid::Uuid;

use agenda_types::{BillingCycle, PlanId, SubscriptionId, TenantId};

use crate::error::ApiError;

// ============================================================================
// Input Validation
// ============================================================================

fn parse_uuid(value: &str, field_name: &str) -> Result<Uuid, ApiError> {
    Uuid::parse_str(value.trim()).map_err(|_| ApiError::BadRequest(format!("Invalid {field_name}")))
}

pub fn parse_tenant_id(value: &str) -> Result<TenantId, ApiError> {
    parse_uuid(value, "tenant_id").map(TenantId::from)
}

pub fn parse_subscription_id(value: &str) -> Result<SubscriptionId, ApiError> {
    parse_uuid(value, "subscription_id").map(SubscriptionId::from)
}

pub fn parse_plan_id(value: &str) -> Result<PlanId, ApiError> {
    parse_uuid(value, "plan_id").map(PlanId::from)
}

/// Billing cycle from a request body; absent means monthly
pub fn parse_billing_cycle(value: Option<&str>) -> Result<BillingCycle, ApiError> {
    match value {
        None => Ok(BillingCycle::Monthly),
        Some(raw) => raw
            .parse()
            .map_err(|_| ApiError::BadRequest(format!("Invalid billing_cycle: {raw}"))),
    }
}

// ============================================================================
// Metrics Helpers
// ============================================================================

/// Record HTTP operation duration with result label.
///
/// Labels: operation, result (ok/err)
#[inline]
pub fn record_op_duration(operation: &'static str, start: Instant, success: bool) {
    let result = if success { "ok" } else { "err" };
    metrics::histogram!(
        "billing_operation_duration_seconds",
        "operation" => operation,
        "result" => result
    )
    .record(start.elapsed().as_secs_f64());
}

// ============================================================================
// Tests
// ============================================================================
