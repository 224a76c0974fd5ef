//! Error types for the Billing API service.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

use agenda_billing_core::BillingError;

/// API error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: ErrorDetail,
}

#[derive(Debug, Serialize)]
pub struct ErrorDetail {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

/// API error type
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Database error")]
    Database(#[from] agenda_db::DbError),

    #[error(transparent)]
    Billing(#[from] BillingError),
}

impl ApiError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Database(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Billing(e) => match e {
                e if e.is_not_found() => StatusCode::NOT_FOUND,
                BillingError::NotOwner => StatusCode::FORBIDDEN,
                BillingError::InvalidTransition { .. }
                | BillingError::AlreadySubscribed
                | BillingError::Conflict => StatusCode::CONFLICT,
                BillingError::TransientGateway(_) => StatusCode::SERVICE_UNAVAILABLE,
                BillingError::FatalGateway(_) => StatusCode::BAD_GATEWAY,
                BillingError::Webhook(_) => StatusCode::BAD_REQUEST,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            },
        }
    }

    pub fn error_code(&self) -> &'static str {
        match self {
            Self::BadRequest(_) => "BAD_REQUEST",
            Self::Database(_) => "INTERNAL_ERROR",
            Self::Billing(e) => match e {
                BillingError::SubscriptionNotFound => "SUBSCRIPTION_NOT_FOUND",
                BillingError::PlanNotFound => "PLAN_NOT_FOUND",
                BillingError::TenantNotFound => "TENANT_NOT_FOUND",
                BillingError::NotOwner => "FORBIDDEN",
                BillingError::InvalidTransition { .. } => "INVALID_TRANSITION",
                BillingError::AlreadySubscribed => "ALREADY_SUBSCRIBED",
                BillingError::Conflict => "CONFLICT",
                BillingError::TransientGateway(_) => "GATEWAY_UNAVAILABLE",
                BillingError::FatalGateway(_) => "GATEWAY_ERROR",
                BillingError::Webhook(_) => "WEBHOOK_ERROR",
                _ => "INTERNAL_ERROR",
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let code = self.error_code();

        // Internal details stay in the logs
        let message = if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!(error = ?self, "Internal API error");
            "Internal server error".to_string()
        } else {
            if status.is_server_error() {
                tracing::warn!(error = %self, "Payment provider error");
            }
            self.to_string()
        };

        let body = ErrorResponse {
            error: ErrorDetail {
                code: code.to_string(),
                message,
                details: None,
            },
        };

        (status, Json(body)).into_response()
    }
}

/// Result type for API handlers
pub type ApiResult<T> = Result<T, ApiError>;
