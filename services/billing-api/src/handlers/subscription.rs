//! Subscription handlers
//!
//! Tenant-admin actions. The tenant id is always explicit in the path and the
//! core checks that the subscription belongs to it.

use std::future::Future;
use std::time::Instant;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use serde::Deserialize;

use agenda_billing_core::BillingError;
use agenda_types::{ActionOutcome, StatusSummary, Subscription};

use super::shared::{
    parse_billing_cycle, parse_plan_id, parse_subscription_id, parse_tenant_id, record_op_duration,
};
use crate::error::ApiResult;
use crate::state::AppState;

// ============================================================================
// Request Types
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct CreateSubscriptionRequest {
    pub plan_id: String,
    pub billing_cycle: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ReactivateRequest {
    pub plan_id: String,
    pub billing_cycle: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ChangePlanRequest {
    pub plan_id: String,
    /// Keeps the current cycle when absent
    pub billing_cycle: Option<String>,
}

/// Time a core call and record it under `operation`
async fn timed<T>(
    operation: &'static str,
    call: impl Future<Output = Result<T, BillingError>>,
) -> Result<T, BillingError> {
    let start = Instant::now();
    let result = call.await;
    record_op_duration(operation, start, result.is_ok());
    result
}

// ============================================================================
// Handlers
// ============================================================================

/// POST /api/v1/tenants/{tenant_id}/subscriptions
pub async fn create_subscription(
    State(state): State<AppState>,
    Path(tenant_id): Path<String>,
    Json(req): Json<CreateSubscriptionRequest>,
) -> ApiResult<(StatusCode, Json<Subscription>)> {
    let tenant_id = parse_tenant_id(&tenant_id)?;
    let plan_id = parse_plan_id(&req.plan_id)?;
    let cycle = parse_billing_cycle(req.billing_cycle.as_deref())?;

    let sub = timed(
        "create_subscription",
        state.billing.create_subscription(tenant_id, plan_id, cycle),
    )
    .await?;

    Ok((StatusCode::CREATED, Json(sub)))
}

/// GET /api/v1/tenants/{tenant_id}/subscriptions/{id}/status
pub async fn get_status(
    State(state): State<AppState>,
    Path((tenant_id, id)): Path<(String, String)>,
) -> ApiResult<Json<StatusSummary>> {
    let tenant_id = parse_tenant_id(&tenant_id)?;
    let id = parse_subscription_id(&id)?;

    let summary = timed("get_status", state.billing.get_status(tenant_id, id)).await?;
    Ok(Json(summary))
}

/// POST /api/v1/tenants/{tenant_id}/subscriptions/{id}/cancel
pub async fn cancel_subscription(
    State(state): State<AppState>,
    Path((tenant_id, id)): Path<(String, String)>,
) -> ApiResult<Json<ActionOutcome>> {
    let tenant_id = parse_tenant_id(&tenant_id)?;
    let id = parse_subscription_id(&id)?;

    let outcome = timed("cancel", state.billing.cancel(tenant_id, id)).await?;
    tracing::info!(tenant_id = %tenant_id, subscription_id = %id, "Subscription cancelled by tenant");
    Ok(Json(outcome))
}

/// POST /api/v1/tenants/{tenant_id}/subscriptions/{id}/reactivate
pub async fn reactivate_subscription(
    State(state): State<AppState>,
    Path((tenant_id, id)): Path<(String, String)>,
    Json(req): Json<ReactivateRequest>,
) -> ApiResult<Json<ActionOutcome>> {
    let tenant_id = parse_tenant_id(&tenant_id)?;
    let id = parse_subscription_id(&id)?;
    let plan_id = parse_plan_id(&req.plan_id)?;
    let cycle = parse_billing_cycle(req.billing_cycle.as_deref())?;

    let outcome = timed(
        "reactivate",
        state.billing.reactivate(tenant_id, id, plan_id, cycle),
    )
    .await?;
    Ok(Json(outcome))
}

/// POST /api/v1/tenants/{tenant_id}/subscriptions/{id}/change-plan
pub async fn change_plan(
    State(state): State<AppState>,
    Path((tenant_id, id)): Path<(String, String)>,
    Json(req): Json<ChangePlanRequest>,
) -> ApiResult<Json<ActionOutcome>> {
    let tenant_id = parse_tenant_id(&tenant_id)?;
    let id = parse_subscription_id(&id)?;
    let plan_id = parse_plan_id(&req.plan_id)?;
    let cycle = req
        .billing_cycle
        .as_deref()
        .map(|raw| parse_billing_cycle(Some(raw)))
        .transpose()?;

    let outcome = timed(
        "change_plan",
        state.billing.change_plan(tenant_id, id, plan_id, cycle),
    )
    .await?;
    Ok(Json(outcome))
}

/// POST /api/v1/tenants/{tenant_id}/subscriptions/{id}/payment-method
pub async fn setup_payment_method(
    State(state): State<AppState>,
    Path((tenant_id, id)): Path<(String, String)>,
) -> ApiResult<Json<ActionOutcome>> {
    let tenant_id = parse_tenant_id(&tenant_id)?;
    let id = parse_subscription_id(&id)?;

    let outcome = timed(
        "setup_payment_method",
        state.billing.setup_payment_method(tenant_id, id),
    )
    .await?;
    Ok(Json(outcome))
}
