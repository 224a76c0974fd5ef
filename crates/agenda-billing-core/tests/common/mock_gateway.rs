//! Scripted payment gateway for testing

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use agenda_billing_core::{
    AuthorizedPayment, GatewayError, GatewayStatus, PaymentGateway, Preapproval, PreapprovalRequest,
};
use async_trait::async_trait;
use dashmap::DashMap;

/// Gateway double honouring idempotency keys like MercadoPago does
#[derive(Default, Clone)]
pub struct MockGateway {
    by_key: Arc<DashMap<String, Preapproval>>,
    statuses: Arc<DashMap<String, GatewayStatus>>,
    payments: Arc<DashMap<String, AuthorizedPayment>>,
    created: Arc<AtomicUsize>,
    cancelled: Arc<Mutex<Vec<String>>>,
    requests: Arc<Mutex<Vec<PreapprovalRequest>>>,
    create_error: Arc<Mutex<Option<GatewayError>>>,
    cancel_error: Arc<Mutex<Option<GatewayError>>>,
    cancel_errors_for: Arc<DashMap<String, GatewayError>>,
    poll_errors: Arc<DashMap<String, GatewayError>>,
    cancel_delay: Arc<Mutex<Option<Duration>>>,
}

#[allow(dead_code)]
impl MockGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of distinct preapprovals created
    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    pub fn cancelled(&self) -> Vec<String> {
        self.cancelled.lock().unwrap().clone()
    }

    pub fn requests(&self) -> Vec<PreapprovalRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn set_status(&self, preapproval_id: &str, status: GatewayStatus) {
        self.statuses.insert(preapproval_id.to_string(), status);
    }

    pub fn add_payment(&self, payment: AuthorizedPayment) {
        self.payments.insert(payment.id.clone(), payment);
    }

    pub fn fail_create(&self, error: GatewayError) {
        *self.create_error.lock().unwrap() = Some(error);
    }

    pub fn fail_cancel(&self, error: Option<GatewayError>) {
        *self.cancel_error.lock().unwrap() = error;
    }

    /// Fail cancellations of one preapproval only
    pub fn fail_cancel_of(&self, preapproval_id: &str, error: GatewayError) {
        self.cancel_errors_for.insert(preapproval_id.to_string(), error);
    }

    pub fn status_of(&self, preapproval_id: &str) -> Option<GatewayStatus> {
        self.statuses.get(preapproval_id).map(|s| s.value().clone())
    }

    /// Preapprovals the gateway would still charge
    pub fn live(&self) -> Vec<String> {
        let mut live: Vec<String> = self
            .statuses
            .iter()
            .filter(|s| *s.value() != GatewayStatus::Cancelled)
            .map(|s| s.key().clone())
            .collect();
        live.sort();
        live
    }

    pub fn fail_poll(&self, preapproval_id: &str, error: GatewayError) {
        self.poll_errors.insert(preapproval_id.to_string(), error);
    }

    /// Make cancellations hang for `delay`
    pub fn delay_cancel(&self, delay: Duration) {
        *self.cancel_delay.lock().unwrap() = Some(delay);
    }
}

#[async_trait]
impl PaymentGateway for MockGateway {
    async fn create_preapproval(&self, request: &PreapprovalRequest) -> Result<Preapproval, GatewayError> {
        self.requests.lock().unwrap().push(request.clone());
        if let Some(err) = self.create_error.lock().unwrap().clone() {
            return Err(err);
        }

        let preapproval = self
            .by_key
            .entry(request.idempotency_key.clone())
            .or_insert_with(|| {
                let n = self.created.fetch_add(1, Ordering::SeqCst) + 1;
                Preapproval {
                    id: format!("pre_{n}"),
                    init_point: format!("https://mp.test/checkout/pre_{n}"),
                }
            })
            .clone();

        self.statuses
            .entry(preapproval.id.clone())
            .or_insert(GatewayStatus::Pending);
        Ok(preapproval)
    }

    async fn cancel_preapproval(&self, preapproval_id: &str) -> Result<(), GatewayError> {
        let delay = *self.cancel_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(err) = self.cancel_error.lock().unwrap().clone() {
            return Err(err);
        }
        if let Some(err) = self.cancel_errors_for.get(preapproval_id) {
            return Err(err.value().clone());
        }
        if !self.statuses.contains_key(preapproval_id) {
            return Err(GatewayError::NotFound);
        }

        self.statuses
            .insert(preapproval_id.to_string(), GatewayStatus::Cancelled);
        self.cancelled.lock().unwrap().push(preapproval_id.to_string());
        Ok(())
    }

    async fn get_preapproval(&self, preapproval_id: &str) -> Result<GatewayStatus, GatewayError> {
        if let Some(err) = self.poll_errors.get(preapproval_id) {
            return Err(err.value().clone());
        }
        self.statuses
            .get(preapproval_id)
            .map(|s| s.value().clone())
            .ok_or(GatewayError::NotFound)
    }

    async fn get_authorized_payment(&self, payment_id: &str) -> Result<AuthorizedPayment, GatewayError> {
        self.payments
            .get(payment_id)
            .map(|p| p.value().clone())
            .ok_or(GatewayError::NotFound)
    }
}
