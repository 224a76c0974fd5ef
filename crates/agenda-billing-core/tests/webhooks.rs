//! Integration tests for gateway webhook processing

mod common;

use agenda_billing_core::webhook::manifest;
use agenda_billing_core::{
    AuthorizedPayment, BillingError, GatewayStatus, PaymentOutcome, WebhookOutcome,
    WebhookVerifier,
};
use agenda_types::{NotificationKind, PaymentStatus, SubscriptionStatus};
use common::{Harness, WEBHOOK_SECRET};
use serde_json::json;
use uuid::Uuid;

const REQUEST_ID: &str = "4f1c2b7e-request";

fn body(kind: &str, data_id: &str) -> Vec<u8> {
    json!({
        "action": "updated",
        "type": kind,
        "data": { "id": data_id },
    })
    .to_string()
    .into_bytes()
}

fn signature(h: &Harness, data_id: &str) -> String {
    let ts = h.now().timestamp().to_string();
    let v1 = WebhookVerifier::new(WEBHOOK_SECRET)
        .sign(&manifest(data_id, Some(REQUEST_ID), &ts))
        .unwrap();
    format!("ts={ts},v1={v1}")
}

async fn deliver(h: &Harness, kind: &str, data_id: &str) -> Result<WebhookOutcome, BillingError> {
    let signature = signature(h, data_id);
    h.service
        .process_webhook(&body(kind, data_id), Some(&signature), Some(REQUEST_ID))
        .await
}

/// Paid subscription with a checkout already created at the gateway
async fn with_checkout(h: &Harness, status: SubscriptionStatus, payment_status: &str) -> Uuid {
    let tenant = h.add_tenant();
    let plan = h.add_plan(false, 0);
    let payment_status = payment_status.to_string();
    let sub = h.add_subscription(tenant, plan, status, |s| s.payment_status = payment_status);
    let sub_row = h.subscription(sub);
    let plan = h.service.stores().plan_of(&sub_row).await.unwrap();
    h.service.create_preapproval(&sub_row, &plan).await.unwrap();
    sub
}

#[tokio::test]
async fn preapproval_authorization_activates_subscription() {
    let h = Harness::new();
    let sub = with_checkout(&h, SubscriptionStatus::Pending, "pending_payment_method").await;
    h.gateway.set_status("pre_1", GatewayStatus::Authorized);

    let outcome = deliver(&h, "subscription_preapproval", "pre_1").await.unwrap();
    assert_eq!(outcome, WebhookOutcome::Applied);
    assert_eq!(h.subscription(sub).status, SubscriptionStatus::Active);

    let again = deliver(&h, "subscription_preapproval", "pre_1").await.unwrap();
    assert_eq!(again, WebhookOutcome::Duplicate);
    assert_eq!(h.subscriptions.events(sub).len(), 1);
}

#[tokio::test]
async fn approved_payment_clears_failures_once() {
    let h = Harness::new();
    let sub = with_checkout(&h, SubscriptionStatus::Active, "past_due").await;
    let mut row = h.subscriptions.get(sub).unwrap();
    row.failed_payment_attempts = 2;
    row.payment_due_reminder_sent_at = Some(h.now());
    h.subscriptions.insert(row);

    h.gateway.add_payment(AuthorizedPayment {
        id: "7001".to_string(),
        preapproval_id: "pre_1".to_string(),
        outcome: PaymentOutcome::Approved,
        charged_at: h.now(),
    });

    let outcome = deliver(&h, "subscription_authorized_payment", "7001").await.unwrap();
    assert_eq!(outcome, WebhookOutcome::Applied);

    let after = h.subscription(sub);
    assert_eq!(after.payment_status, PaymentStatus::Active);
    assert_eq!(after.failed_payment_attempts, 0);
    assert_eq!(after.payment_due_reminder_sent_at, None);
    assert_eq!(after.last_payment_date, Some(h.now()));

    let again = deliver(&h, "subscription_authorized_payment", "7001").await.unwrap();
    assert_eq!(again, WebhookOutcome::Duplicate);
    assert_eq!(h.subscription(sub).updated_at, after.updated_at);
}

#[tokio::test]
async fn rejected_payments_count_and_notify_once() {
    let h = Harness::new();
    let sub = with_checkout(&h, SubscriptionStatus::Active, "active").await;

    for id in ["7101", "7102"] {
        h.gateway.add_payment(AuthorizedPayment {
            id: id.to_string(),
            preapproval_id: "pre_1".to_string(),
            outcome: PaymentOutcome::Rejected,
            charged_at: h.now(),
        });
        let outcome = deliver(&h, "subscription_authorized_payment", id).await.unwrap();
        assert_eq!(outcome, WebhookOutcome::Applied);
    }

    let after = h.subscription(sub);
    assert_eq!(after.status, SubscriptionStatus::Active);
    assert_eq!(after.payment_status, PaymentStatus::PastDue);
    assert_eq!(after.failed_payment_attempts, 2);
    assert_eq!(h.mail.sent_of(NotificationKind::PaymentFailed), 1);
}

#[tokio::test]
async fn pending_payment_is_ignored() {
    let h = Harness::new();
    let sub = with_checkout(&h, SubscriptionStatus::Active, "active").await;
    h.gateway.add_payment(AuthorizedPayment {
        id: "7201".to_string(),
        preapproval_id: "pre_1".to_string(),
        outcome: PaymentOutcome::Pending,
        charged_at: h.now(),
    });

    let outcome = deliver(&h, "subscription_authorized_payment", "7201").await.unwrap();

    assert_eq!(outcome, WebhookOutcome::Ignored);
    assert_eq!(h.subscription(sub).failed_payment_attempts, 0);
}

#[tokio::test]
async fn payment_for_unknown_preapproval_stays_retryable() {
    let h = Harness::new();
    h.gateway.add_payment(AuthorizedPayment {
        id: "7301".to_string(),
        preapproval_id: "pre_elsewhere".to_string(),
        outcome: PaymentOutcome::Approved,
        charged_at: h.now(),
    });

    let first = deliver(&h, "subscription_authorized_payment", "7301").await.unwrap();
    let second = deliver(&h, "subscription_authorized_payment", "7301").await.unwrap();

    assert_eq!(first, WebhookOutcome::Ignored);
    assert_eq!(second, WebhookOutcome::Ignored);
}

#[tokio::test]
async fn bad_signature_changes_nothing() {
    let h = Harness::new();
    let sub = with_checkout(&h, SubscriptionStatus::Pending, "pending_payment_method").await;
    h.gateway.set_status("pre_1", GatewayStatus::Authorized);
    let before = h.subscriptions.get(sub).unwrap();

    let ts = h.now().timestamp();
    let forged = format!("ts={ts},v1={}", "0".repeat(64));
    let err = h
        .service
        .process_webhook(&body("subscription_preapproval", "pre_1"), Some(&forged), Some(REQUEST_ID))
        .await
        .unwrap_err();
    assert!(matches!(err, BillingError::Webhook(_)));

    let missing = h
        .service
        .process_webhook(&body("subscription_preapproval", "pre_1"), None, Some(REQUEST_ID))
        .await
        .unwrap_err();
    assert!(matches!(missing, BillingError::Webhook(_)));

    assert_eq!(h.subscriptions.get(sub).unwrap(), before);
}

#[tokio::test]
async fn untracked_topics_and_resources_are_ignored() {
    let h = Harness::new();

    let topic = deliver(&h, "payment", "123456").await.unwrap();
    assert_eq!(topic, WebhookOutcome::Ignored);

    let resource = deliver(&h, "subscription_preapproval", "pre_unknown").await.unwrap();
    assert_eq!(resource, WebhookOutcome::Ignored);
}
