//! Integration tests for the hourly lifecycle sweep

mod common;

use agenda_billing_core::{GatewayError, GatewayStatus, GraceExpiryAction, Job};
use agenda_types::{NotificationKind, PaymentStatus, SubscriptionStatus};
use chrono::Duration;
use common::{test_config, Harness};

#[tokio::test]
async fn free_trial_past_its_end_becomes_active_without_mail() {
    let h = Harness::new();
    let tenant = h.add_tenant();
    let plan = h.add_plan(true, 14);
    let sub = h.add_subscription(tenant, plan, SubscriptionStatus::Trial, |s| {
        s.trial_ends_at = Some(h.now() - Duration::days(1));
    });

    let report = h.sweeper().run(Job::Process).await.unwrap();

    let after = h.subscription(sub);
    assert_eq!(after.status, SubscriptionStatus::Active);
    assert_eq!(after.payment_status, PaymentStatus::Pending);
    assert_eq!(report.transitioned, 1);
    assert!(h.mail.sent().is_empty());

    let events = h.subscriptions.events(sub);
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].from_status, "trial");
    assert_eq!(events[0].to_status, "active");
}

#[tokio::test]
async fn paid_trial_without_payment_method_expires() {
    let h = Harness::new();
    let tenant = h.add_tenant();
    let plan = h.add_plan(false, 14);
    let sub = h.add_subscription(tenant, plan, SubscriptionStatus::Trial, |s| {
        s.trial_ends_at = Some(h.now() - Duration::minutes(10));
    });

    h.sweeper().process().await.unwrap();

    let after = h.subscription(sub);
    assert_eq!(after.status, SubscriptionStatus::TrialExpired);
    assert_eq!(after.payment_status, PaymentStatus::PendingPaymentMethod);
}

#[tokio::test]
async fn paid_trial_with_authorized_preapproval_activates() {
    let h = Harness::new();
    let tenant = h.add_tenant();
    let plan = h.add_plan(false, 14);
    let sub = h.add_subscription(tenant, plan, SubscriptionStatus::Trial, |s| {
        s.trial_ends_at = Some(h.now() - Duration::minutes(10));
        s.mp_preapproval_id = Some("pre_ok".to_string());
        s.payment_status = "active".to_string();
    });

    h.sweeper().process().await.unwrap();

    assert_eq!(h.subscription(sub).status, SubscriptionStatus::Active);
}

#[tokio::test]
async fn expired_grace_period_cancels_even_when_gateway_fails() {
    let h = Harness::new();
    h.gateway.fail_cancel(Some(GatewayError::Network("connection reset".into())));
    let tenant = h.add_tenant();
    let plan = h.add_plan(false, 0);
    let sub = h.add_subscription(tenant, plan, SubscriptionStatus::OnGracePeriod, |s| {
        s.grace_period_ends_at = Some(h.now() - Duration::hours(1));
        s.grace_period_reminder_sent_at = Some(h.now() - Duration::days(7));
        s.failed_payment_attempts = 3;
        s.mp_preapproval_id = Some("pre_live".to_string());
    });

    h.sweeper().process().await.unwrap();

    let after = h.subscription(sub);
    assert_eq!(after.status, SubscriptionStatus::Cancelled);
    assert_eq!(after.payment_status, PaymentStatus::Suspended);
    assert_eq!(after.ends_at, Some(h.now()));
    assert!(after.gateway_cleanup_required);
}

#[tokio::test]
async fn grace_expiry_revokes_only_after_the_commit_lands() {
    let h = Harness::new();
    let tenant = h.add_tenant();
    let plan = h.add_plan(false, 0);
    let sub = h.add_subscription(tenant, plan, SubscriptionStatus::OnGracePeriod, |s| {
        s.grace_period_ends_at = Some(h.now() - Duration::hours(1));
        s.grace_period_reminder_sent_at = Some(h.now() - Duration::days(7));
        s.mp_preapproval_id = Some("pre_live".to_string());
    });
    h.gateway.set_status("pre_live", GatewayStatus::Authorized);

    // A payment webhook wins the race for the row
    h.subscriptions.lose_next_updates(1);
    let report = h.sweeper().process().await.unwrap();

    assert_eq!(report.conflicts, 1);
    assert_eq!(h.subscription(sub).status, SubscriptionStatus::OnGracePeriod);
    assert!(h.gateway.cancelled().is_empty());

    let report = h.sweeper().process().await.unwrap();

    let after = h.subscription(sub);
    assert_eq!(report.transitioned, 1);
    assert_eq!(after.status, SubscriptionStatus::Cancelled);
    assert!(!after.gateway_cleanup_required);
    assert_eq!(after.mp_status.as_deref(), Some("cancelled"));
    assert_eq!(h.gateway.cancelled(), vec!["pre_live".to_string()]);
}

#[tokio::test]
async fn expired_grace_period_pauses_when_configured() {
    let h = Harness::with_config(test_config().with_grace_expiry_action(GraceExpiryAction::Pause));
    let tenant = h.add_tenant();
    let plan = h.add_plan(false, 0);
    let sub = h.add_subscription(tenant, plan, SubscriptionStatus::OnGracePeriod, |s| {
        s.grace_period_ends_at = Some(h.now() - Duration::hours(1));
        s.grace_period_reminder_sent_at = Some(h.now() - Duration::days(7));
    });

    h.sweeper().process().await.unwrap();

    let after = h.subscription(sub);
    assert_eq!(after.status, SubscriptionStatus::Paused);
    assert!(!after.gateway_cleanup_required);
}

#[tokio::test]
async fn second_sweep_changes_nothing_and_sends_nothing() {
    let h = Harness::new();
    let paid = h.add_plan(false, 14);
    let free = h.add_plan(true, 14);

    let ids = [
        h.add_subscription(h.add_tenant(), paid, SubscriptionStatus::Trial, |s| {
            s.trial_ends_at = Some(h.now() + Duration::days(2));
        }),
        h.add_subscription(h.add_tenant(), free, SubscriptionStatus::Trial, |s| {
            s.trial_ends_at = Some(h.now() - Duration::days(2));
        }),
        h.add_subscription(h.add_tenant(), paid, SubscriptionStatus::OnGracePeriod, |s| {
            s.grace_period_ends_at = Some(h.now() + Duration::days(3));
        }),
    ];

    let first = h.sweeper().process().await.unwrap();
    let after_first: Vec<_> = ids.iter().map(|id| h.subscriptions.get(*id).unwrap()).collect();
    let mails_after_first = h.mail.sent().len();

    let second = h.sweeper().process().await.unwrap();
    let after_second: Vec<_> = ids.iter().map(|id| h.subscriptions.get(*id).unwrap()).collect();

    assert_eq!(first.transitioned, 1);
    assert_eq!(first.notified, 2);
    assert_eq!(second.transitioned, 0);
    assert_eq!(second.notified, 0);
    assert_eq!(after_first, after_second);
    assert_eq!(h.mail.sent().len(), mails_after_first);
    assert_eq!(h.mail.sent_of(NotificationKind::TrialExpiring), 1);
    assert_eq!(h.mail.sent_of(NotificationKind::GracePeriod), 1);
}

#[tokio::test]
async fn trial_reminder_skips_free_plans_and_authorized_methods() {
    let h = Harness::new();
    let paid = h.add_plan(false, 14);
    let free = h.add_plan(true, 14);
    let ending = h.now() + Duration::days(1);

    let needs_reminder = h.add_subscription(h.add_tenant(), paid, SubscriptionStatus::Trial, |s| {
        s.trial_ends_at = Some(ending);
    });
    let free_sub = h.add_subscription(h.add_tenant(), free, SubscriptionStatus::Trial, |s| {
        s.trial_ends_at = Some(ending);
    });
    h.add_subscription(h.add_tenant(), paid, SubscriptionStatus::Trial, |s| {
        s.trial_ends_at = Some(ending);
        s.mp_preapproval_id = Some("pre_ok".to_string());
        s.payment_status = "active".to_string();
    });
    let far_away = h.add_subscription(h.add_tenant(), paid, SubscriptionStatus::Trial, |s| {
        s.trial_ends_at = Some(h.now() + Duration::days(10));
    });

    h.sweeper().process().await.unwrap();

    assert_eq!(h.mail.sent_of(NotificationKind::TrialExpiring), 1);
    assert!(h.subscription(needs_reminder).payment_setup_reminder_sent_at.is_some());
    assert!(h.subscription(free_sub).payment_setup_reminder_sent_at.is_none());
    assert!(h.subscription(far_away).payment_setup_reminder_sent_at.is_none());
}

#[tokio::test]
async fn mail_failure_keeps_marker_and_does_not_resend() {
    let h = Harness::new();
    let plan = h.add_plan(false, 14);
    let sub = h.add_subscription(h.add_tenant(), plan, SubscriptionStatus::Trial, |s| {
        s.trial_ends_at = Some(h.now() + Duration::days(1));
    });

    h.mail.set_failing(true);
    let report = h.sweeper().process().await.unwrap();
    assert_eq!(report.failed, 1);
    assert!(h.subscription(sub).payment_setup_reminder_sent_at.is_some());

    h.mail.set_failing(false);
    h.sweeper().process().await.unwrap();
    assert!(h.mail.sent().is_empty());
}

#[tokio::test]
async fn missing_plan_is_flagged_and_batch_continues() {
    let h = Harness::new();
    let free = h.add_plan(true, 14);
    let broken = h.add_subscription(h.add_tenant(), uuid::Uuid::new_v4(), SubscriptionStatus::Trial, |s| {
        s.trial_ends_at = Some(h.now() - Duration::days(3));
        s.created_at = h.now() - Duration::days(30);
    });
    let healthy = h.add_subscription(h.add_tenant(), free, SubscriptionStatus::Trial, |s| {
        s.trial_ends_at = Some(h.now() - Duration::days(1));
    });

    let report = h.sweeper().process().await.unwrap();

    assert_eq!(report.failed, 1);
    assert_eq!(report.transitioned, 1);
    assert_eq!(h.subscription(broken).status, SubscriptionStatus::Trial);
    assert!(h.subscription(broken).review_reason.unwrap().contains("missing plan"));
    assert_eq!(h.subscription(healthy).status, SubscriptionStatus::Active);
}

#[tokio::test]
async fn unreadable_row_is_flagged_for_review() {
    let h = Harness::new();
    let plan = h.add_plan(true, 14);
    let sub = h.add_subscription(h.add_tenant(), plan, SubscriptionStatus::Trial, |s| {
        s.trial_ends_at = Some(h.now() - Duration::days(1));
        s.billing_cycle = "weekly".to_string();
    });

    let report = h.sweeper().process().await.unwrap();

    assert_eq!(report.failed, 1);
    let row = h.subscriptions.get(sub).unwrap();
    assert_eq!(row.status, "trial");
    assert!(row.review_reason.unwrap().contains("weekly"));
}

#[tokio::test]
async fn database_outage_aborts_the_sweep() {
    let h = Harness::new();
    let plan = h.add_plan(true, 14);
    h.add_subscription(h.add_tenant(), plan, SubscriptionStatus::Trial, |s| {
        s.trial_ends_at = Some(h.now() - Duration::days(1));
    });
    h.subscriptions.set_unavailable(true);

    let err = h.sweeper().process().await.unwrap_err();
    assert!(err.is_catastrophic());
}
