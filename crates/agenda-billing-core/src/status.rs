//! Status summary for the UI layer

use chrono::{DateTime, Utc};

use agenda_types::{Alert, PaymentStatus, Plan, StatusSummary, Subscription, SubscriptionStatus};

const SECONDS_PER_DAY: i64 = 86_400;

/// Whole days from `now` until `end`, rounded up, never negative
fn days_until(end: DateTime<Utc>, now: DateTime<Utc>) -> i64 {
    let seconds = (end - now).num_seconds();
    if seconds <= 0 {
        0
    } else {
        (seconds + SECONDS_PER_DAY - 1) / SECONDS_PER_DAY
    }
}

/// End of the period the current status runs until
fn current_period_end(sub: &Subscription) -> Option<DateTime<Utc>> {
    match sub.status {
        SubscriptionStatus::Trial => sub.trial_ends_at,
        SubscriptionStatus::OnGracePeriod => sub.grace_period_ends_at,
        SubscriptionStatus::Active => sub.next_billing_date,
        _ => None,
    }
}

/// Build the read-only status view of a subscription
pub fn summarize(
    sub: &Subscription,
    plan: &Plan,
    now: DateTime<Utc>,
    reminder_days: u32,
) -> StatusSummary {
    let days_until_expiry = current_period_end(sub).map(|end| days_until(end, now));
    let needs_method = !plan.is_free && !sub.has_authorized_payment_method();
    let mut alerts = Vec::new();

    match sub.status {
        SubscriptionStatus::Trial => {
            if let Some(days_left) = days_until_expiry {
                if days_left <= i64::from(reminder_days) {
                    alerts.push(Alert::TrialEndingSoon { days_left });
                    if needs_method {
                        alerts.push(Alert::PaymentMethodRequired);
                    }
                }
            }
        }
        SubscriptionStatus::TrialExpired => {
            alerts.push(Alert::TrialExpired);
            alerts.push(Alert::PaymentMethodRequired);
        }
        SubscriptionStatus::Pending | SubscriptionStatus::Active => {
            let method_missing = matches!(
                sub.payment_status,
                PaymentStatus::PendingPaymentMethod | PaymentStatus::Expired
            );
            if needs_method && method_missing {
                alerts.push(Alert::PaymentMethodRequired);
            }
        }
        SubscriptionStatus::OnGracePeriod => {
            if let Some(ends_at) = sub.grace_period_ends_at {
                alerts.push(Alert::GracePeriod { ends_at });
            }
        }
        SubscriptionStatus::Paused => alerts.push(Alert::Suspended),
        SubscriptionStatus::Cancelled => alerts.push(Alert::Cancelled),
    }

    if sub.failed_payment_attempts > 0 && !sub.status.is_terminal() {
        alerts.push(Alert::PaymentFailed {
            attempts: sub.failed_payment_attempts,
        });
    }

    StatusSummary {
        status: sub.status,
        payment_status: sub.payment_status,
        days_until_expiry,
        alerts,
    }
}
