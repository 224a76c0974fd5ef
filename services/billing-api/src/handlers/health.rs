//! Health check handlers

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde::Serialize;

use crate::state::AppState;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub service: &'static str,
    pub version: &'static str,
}

#[derive(Serialize)]
pub struct ReadyResponse {
    pub status: &'static str,
    pub database: &'static str,
    /// Whether this process runs the job timers
    pub scheduler: &'static str,
}

/// Liveness probe
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        service: env!("CARGO_PKG_NAME"),
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// Readiness probe; the sweeps and every tenant action need the database
pub async fn ready(State(state): State<AppState>) -> Result<Json<ReadyResponse>, StatusCode> {
    if let Err(e) = sqlx::query("SELECT 1").execute(&state.pool).await {
        tracing::error!(error = ?e, "Database readiness check failed");
        return Err(StatusCode::SERVICE_UNAVAILABLE);
    }

    Ok(Json(ReadyResponse {
        status: "ready",
        database: "connected",
        scheduler: if state.config.scheduler_enabled {
            "enabled"
        } else {
            "disabled"
        },
    }))
}
