//! Agenda Billing API
//!
//! HTTP surface, job timers and operator CLI for the subscription engine.
//!
//! ## REST Endpoints
//!
//! - `POST /api/v1/tenants/{tenant_id}/subscriptions` - Start a subscription
//! - `GET /api/v1/tenants/{tenant_id}/subscriptions/{id}/status` - Status summary
//! - `POST /api/v1/tenants/{tenant_id}/subscriptions/{id}/cancel` - Cancel
//! - `POST /api/v1/tenants/{tenant_id}/subscriptions/{id}/reactivate` - Reactivate
//! - `POST /api/v1/tenants/{tenant_id}/subscriptions/{id}/change-plan` - Change plan
//! - `POST /api/v1/tenants/{tenant_id}/subscriptions/{id}/payment-method` - Payment link
//! - `POST /webhooks/mercadopago` - MercadoPago notifications
//!
//! ## Health Endpoints
//!
//! - `GET /health` - Liveness probe
//! - `GET /ready` - Readiness probe
//! - `GET /metrics` - Prometheus metrics

pub mod cli;
pub mod config;
pub mod error;
pub mod handlers;
pub mod state;

use axum::routing::{get, post};
use axum::Router;
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use tower::ServiceBuilder;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer};
use tracing::Level;

use crate::handlers::{health, ready};
use crate::state::AppState;

pub fn build_router(state: AppState, metrics_handle: Option<PrometheusHandle>) -> Router {
    let request_timeout = state.request_timeout();

    // Tenant-admin routes
    let api_v1 = Router::new()
        .route(
            "/tenants/{tenant_id}/subscriptions",
            post(handlers::create_subscription),
        )
        .route(
            "/tenants/{tenant_id}/subscriptions/{id}/status",
            get(handlers::get_status),
        )
        .route(
            "/tenants/{tenant_id}/subscriptions/{id}/cancel",
            post(handlers::cancel_subscription),
        )
        .route(
            "/tenants/{tenant_id}/subscriptions/{id}/reactivate",
            post(handlers::reactivate_subscription),
        )
        .route(
            "/tenants/{tenant_id}/subscriptions/{id}/change-plan",
            post(handlers::change_plan),
        )
        .route(
            "/tenants/{tenant_id}/subscriptions/{id}/payment-method",
            post(handlers::setup_payment_method),
        );

    // Health routes (no timeout)
    let health_routes = Router::new()
        .route("/health", get(health))
        .route("/ready", get(ready));

    // Metrics route (no timeout)
    let metrics_route = if let Some(handle) = metrics_handle {
        Router::new().route("/metrics", get(move || async move { handle.render() }))
    } else {
        Router::new()
    };

    // Outermost first
    let middleware = ServiceBuilder::new()
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
        .layer(TimeoutLayer::new(request_timeout));

    // The provider's x-request-id is part of the signed manifest, so the
    // webhook never gets a generated one
    let webhook_routes = Router::new()
        .route("/webhooks/mercadopago", post(handlers::mercadopago_webhook))
        .layer(
            ServiceBuilder::new()
                .layer(
                    TraceLayer::new_for_http()
                        .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                        .on_response(DefaultOnResponse::new().level(Level::INFO)),
                )
                .layer(TimeoutLayer::new(request_timeout)),
        );

    Router::new()
        .nest("/api/v1", api_v1)
        .layer(middleware)
        .merge(webhook_routes)
        .merge(health_routes)
        .merge(metrics_route)
        .with_state(state)
}

pub fn setup_metrics() -> Result<PrometheusHandle, metrics_exporter_prometheus::BuildError> {
    // Request latency: most calls are one gateway round trip
    let operation_buckets = &[0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0];
    // Sweeps walk whole tables
    let sweep_buckets = &[0.1, 0.5, 1.0, 5.0, 15.0, 30.0, 60.0, 300.0, 900.0];

    let handle = PrometheusBuilder::new()
        .set_buckets_for_metric(
            Matcher::Full("billing_operation_duration_seconds".to_string()),
            operation_buckets,
        )?
        .set_buckets_for_metric(
            Matcher::Full("billing_sweep_duration_seconds".to_string()),
            sweep_buckets,
        )?
        .install_recorder()?;

    metrics::describe_counter!(
        "billing_transitions_total",
        "Subscription status transitions by from/to status"
    );
    metrics::describe_counter!(
        "billing_notifications_total",
        "Lifecycle notifications by kind and result"
    );
    metrics::describe_counter!(
        "billing_gateway_errors_total",
        "Failed payment gateway calls by operation and kind"
    );
    metrics::describe_counter!(
        "billing_webhooks_total",
        "Gateway notifications by outcome"
    );
    metrics::describe_counter!(
        "billing_sweeps_skipped_total",
        "Job runs skipped because another run of the job was still going"
    );
    metrics::describe_histogram!(
        "billing_sweep_duration_seconds",
        "Duration of one scheduled job run"
    );
    metrics::describe_histogram!(
        "billing_operation_duration_seconds",
        "Billing operation latency in seconds by operation type"
    );

    Ok(handle)
}
