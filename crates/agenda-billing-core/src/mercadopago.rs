//! MercadoPago preapproval gateway implementation

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, instrument, warn};

use crate::config::BillingConfig;
use crate::error::GatewayError;
use crate::provider::{
    AuthorizedPayment, GatewayStatus, PaymentGateway, PaymentOutcome, Preapproval,
    PreapprovalRequest,
};

/// MercadoPago gateway
#[derive(Clone)]
pub struct MercadoPagoGateway {
    client: Client,
    base_url: String,
    access_token: String,
}

impl MercadoPagoGateway {
    /// Create a new MercadoPago gateway
    pub fn new(config: &BillingConfig) -> Self {
        let client = Client::builder()
            .timeout(config.gateway_timeout)
            .build()
            .unwrap_or_else(|_| Client::new());

        Self {
            client,
            base_url: config.mercadopago_base_url.trim_end_matches('/').to_string(),
            access_token: config.mercadopago_access_token.clone(),
        }
    }

    /// Make authenticated request to MercadoPago
    async fn mp_request<T: DeserializeOwned, B: Serialize + ?Sized>(
        &self,
        method: Method,
        endpoint: &str,
        body: Option<&B>,
        idempotency_key: Option<&str>,
    ) -> Result<T, GatewayError> {
        let url = format!("{}{endpoint}", self.base_url);

        let mut request = self
            .client
            .request(method, &url)
            .bearer_auth(&self.access_token);

        if let Some(key) = idempotency_key {
            request = request.header("X-Idempotency-Key", key);
        }
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request.send().await.map_err(|e| {
            warn!(error = %e, endpoint, "MercadoPago request failed");
            GatewayError::Network(e.to_string())
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(map_status(status, body, endpoint));
        }

        response.json::<T>().await.map_err(|e| {
            error!(error = %e, endpoint, "Failed to parse MercadoPago response");
            GatewayError::Api {
                status: status.as_u16(),
                message: format!("unreadable response: {e}"),
            }
        })
    }
}

fn map_status(status: StatusCode, body: String, endpoint: &str) -> GatewayError {
    let message = serde_json::from_str::<MpErrorBody>(&body)
        .ok()
        .and_then(|b| b.message)
        .unwrap_or(body);

    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            error!(status = %status, endpoint, "MercadoPago rejected credentials");
            GatewayError::Auth(message)
        }
        StatusCode::NOT_FOUND => GatewayError::NotFound,
        StatusCode::TOO_MANY_REQUESTS | StatusCode::REQUEST_TIMEOUT => {
            GatewayError::Network(format!("{status}: {message}"))
        }
        s if s.is_server_error() => GatewayError::Network(format!("{status}: {message}")),
        _ => {
            error!(status = %status, body = %message, endpoint, "MercadoPago API error");
            GatewayError::Api {
                status: status.as_u16(),
                message,
            }
        }
    }
}

#[async_trait]
impl PaymentGateway for MercadoPagoGateway {
    #[instrument(skip(self, request), fields(external_reference = %request.external_reference))]
    async fn create_preapproval(
        &self,
        request: &PreapprovalRequest,
    ) -> Result<Preapproval, GatewayError> {
        debug!("Creating preapproval");

        let body = MpPreapprovalCreate {
            reason: &request.reason,
            external_reference: &request.external_reference,
            payer_email: &request.payer_email,
            back_url: &request.back_url,
            status: "pending",
            auto_recurring: MpAutoRecurring {
                frequency: request.billing_cycle.months(),
                frequency_type: "months",
                transaction_amount: request.amount_cents as f64 / 100.0,
                currency_id: &request.currency,
            },
        };

        let created: MpPreapproval = self
            .mp_request(
                Method::POST,
                "/preapproval",
                Some(&body),
                Some(&request.idempotency_key),
            )
            .await?;

        let init_point = created.init_point.ok_or_else(|| GatewayError::Api {
            status: 200,
            message: "preapproval without init_point".to_string(),
        })?;

        Ok(Preapproval {
            id: created.id,
            init_point,
        })
    }

    #[instrument(skip(self))]
    async fn cancel_preapproval(&self, preapproval_id: &str) -> Result<(), GatewayError> {
        debug!("Cancelling preapproval");

        let body = serde_json::json!({ "status": "cancelled" });
        let _: MpPreapproval = self
            .mp_request(
                Method::PUT,
                &format!("/preapproval/{preapproval_id}"),
                Some(&body),
                None,
            )
            .await?;

        Ok(())
    }

    #[instrument(skip(self))]
    async fn get_preapproval(&self, preapproval_id: &str) -> Result<GatewayStatus, GatewayError> {
        let preapproval: MpPreapproval = self
            .mp_request::<_, ()>(
                Method::GET,
                &format!("/preapproval/{preapproval_id}"),
                None,
                None,
            )
            .await?;

        Ok(GatewayStatus::parse(&preapproval.status))
    }

    #[instrument(skip(self))]
    async fn get_authorized_payment(
        &self,
        payment_id: &str,
    ) -> Result<AuthorizedPayment, GatewayError> {
        let payment: MpAuthorizedPayment = self
            .mp_request::<_, ()>(
                Method::GET,
                &format!("/authorized_payments/{payment_id}"),
                None,
                None,
            )
            .await?;

        let outcome = payment.outcome();
        Ok(AuthorizedPayment {
            id: payment.id.into_string(),
            preapproval_id: payment.preapproval_id,
            outcome,
            charged_at: payment
                .debit_date
                .or(payment.date_created)
                .unwrap_or_else(Utc::now),
        })
    }
}

// MercadoPago API types

#[derive(Debug, Serialize)]
struct MpPreapprovalCreate<'a> {
    reason: &'a str,
    external_reference: &'a str,
    payer_email: &'a str,
    back_url: &'a str,
    status: &'static str,
    auto_recurring: MpAutoRecurring<'a>,
}

#[derive(Debug, Serialize)]
struct MpAutoRecurring<'a> {
    frequency: u32,
    frequency_type: &'static str,
    transaction_amount: f64,
    currency_id: &'a str,
}

/// MercadoPago preapproval
#[derive(Debug, Clone, Deserialize)]
pub struct MpPreapproval {
    /// Preapproval ID
    pub id: String,
    /// Provider status string
    pub status: String,
    /// Checkout URL
    pub init_point: Option<String>,
    /// Our subscription id
    pub external_reference: Option<String>,
}

/// MercadoPago authorized payment (one recurring charge)
#[derive(Debug, Clone, Deserialize)]
pub struct MpAuthorizedPayment {
    pub id: MpId,
    pub preapproval_id: String,
    /// Charge lifecycle (`scheduled`, `processed`, `recycling`, ...)
    pub status: String,
    pub payment: Option<MpPaymentInfo>,
    pub debit_date: Option<DateTime<Utc>>,
    pub date_created: Option<DateTime<Utc>>,
}

impl MpAuthorizedPayment {
    fn outcome(&self) -> PaymentOutcome {
        match self.payment.as_ref().map(|p| p.status.as_str()) {
            Some("approved") => PaymentOutcome::Approved,
            Some("rejected" | "cancelled") => PaymentOutcome::Rejected,
            _ if self.status == "recycling" => PaymentOutcome::Rejected,
            _ => PaymentOutcome::Pending,
        }
    }
}

/// Payment attached to an authorized payment
#[derive(Debug, Clone, Deserialize)]
pub struct MpPaymentInfo {
    pub status: String,
}

/// MercadoPago ids arrive as numbers or strings depending on the resource
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum MpId {
    Number(i64),
    Text(String),
}

impl MpId {
    pub fn into_string(self) -> String {
        match self {
            Self::Number(n) => n.to_string(),
            Self::Text(s) => s,
        }
    }
}

#[derive(Debug, Deserialize)]
struct MpErrorBody {
    message: Option<String>,
}
