//! MercadoPago webhook handler

use std::time::Instant;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};

use super::shared::record_op_duration;
use crate::error::ApiError;
use crate::state::AppState;

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}

/// POST /webhooks/mercadopago
///
/// Verifies `x-signature` against the shared secret before touching anything.
/// Ignored and duplicate notifications are acknowledged with 200 so the
/// provider stops redelivering them.
pub async fn mercadopago_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<StatusCode, ApiError> {
    let start = Instant::now();

    let signature = header(&headers, "x-signature");
    if signature.is_none() {
        tracing::warn!("Missing x-signature header");
    }
    let request_id = header(&headers, "x-request-id");

    let result = state
        .billing
        .process_webhook(&body, signature, request_id)
        .await;
    record_op_duration("process_webhook", start, result.is_ok());

    match result {
        Ok(outcome) => {
            tracing::info!(outcome = outcome.as_str(), "Webhook handled");
            Ok(StatusCode::OK)
        }
        Err(e) => {
            tracing::warn!(error = %e, "Webhook processing failed");
            metrics::counter!("billing_webhooks_total", "outcome" => "rejected").increment(1);
            Err(e.into())
        }
    }
}
