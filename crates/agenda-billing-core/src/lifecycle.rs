//! Subscription state machine
//!
//! Pure functions computing and applying lifecycle transitions. Nothing here
//! performs I/O; callers persist the mutated subscription through the guarded
//! repository write and dispatch any notification afterwards.

use chrono::{DateTime, Duration, Utc};

use agenda_types::{NotificationKind, PaymentStatus, Plan, Subscription, SubscriptionStatus};

use crate::config::{BillingConfig, GraceExpiryAction};
use crate::provider::GatewayStatus;

/// Lifecycle knobs the state machine needs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LifecyclePolicy {
    pub grace_period: Duration,
    pub max_failed_attempts: u32,
    pub grace_expiry: GraceExpiryAction,
}

impl From<&BillingConfig> for LifecyclePolicy {
    fn from(config: &BillingConfig) -> Self {
        Self {
            grace_period: config.grace_period(),
            max_failed_attempts: config.max_failed_attempts,
            grace_expiry: config.grace_expiry_action,
        }
    }
}

impl Default for LifecyclePolicy {
    fn default() -> Self {
        Self {
            grace_period: Duration::days(7),
            max_failed_attempts: 3,
            grace_expiry: GraceExpiryAction::Cancel,
        }
    }
}

/// A time-driven transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Trial over on a free plan, or with an authorized payment method
    ActivateTrial,
    /// Paid trial over without a payment method
    ExpireTrial,
    /// Grace window closed
    EndGracePeriod,
}

impl Transition {
    pub fn target(&self, policy: &LifecyclePolicy) -> SubscriptionStatus {
        match self {
            Self::ActivateTrial => SubscriptionStatus::Active,
            Self::ExpireTrial => SubscriptionStatus::TrialExpired,
            Self::EndGracePeriod => policy.grace_expiry.target_status(),
        }
    }

    pub const fn reason(&self) -> &'static str {
        match self {
            Self::ActivateTrial => "trial_ended",
            Self::ExpireTrial => "trial_expired",
            Self::EndGracePeriod => "grace_period_expired",
        }
    }
}

/// A committed status change, recorded in the transition history
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Change {
    pub from: SubscriptionStatus,
    pub to: SubscriptionStatus,
    pub reason: &'static str,
}

/// What a mutation did to a subscription
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Effect {
    pub change: Option<Change>,
    /// Notification whose marker was set by this mutation; send it after the
    /// write commits
    pub notify: Option<NotificationKind>,
}

impl Effect {
    fn status(from: SubscriptionStatus, to: SubscriptionStatus, reason: &'static str) -> Self {
        Self {
            change: (from != to).then_some(Change { from, to, reason }),
            notify: None,
        }
    }
}

type Rule = fn(&Subscription, &Plan, DateTime<Utc>) -> Option<Transition>;

// Earliest unresolved condition first: trial expiry before grace expiry.
const RULES: [Rule; 2] = [trial_rule, grace_rule];

fn trial_rule(sub: &Subscription, plan: &Plan, now: DateTime<Utc>) -> Option<Transition> {
    if sub.status != SubscriptionStatus::Trial {
        return None;
    }
    let ends_at = sub.trial_ends_at?;
    if ends_at >= now {
        return None;
    }

    if plan.is_free || sub.has_authorized_payment_method() {
        Some(Transition::ActivateTrial)
    } else {
        Some(Transition::ExpireTrial)
    }
}

fn grace_rule(sub: &Subscription, _plan: &Plan, now: DateTime<Utc>) -> Option<Transition> {
    if sub.status != SubscriptionStatus::OnGracePeriod {
        return None;
    }
    let ends_at = sub.grace_period_ends_at?;
    (ends_at < now).then_some(Transition::EndGracePeriod)
}

/// The single time-driven transition due for `sub` at `now`, if any
pub fn next_transition(sub: &Subscription, plan: &Plan, now: DateTime<Utc>) -> Option<Transition> {
    RULES.iter().find_map(|rule| rule(sub, plan, now))
}

/// Apply a time-driven transition
pub fn apply_transition(
    sub: &mut Subscription,
    transition: Transition,
    now: DateTime<Utc>,
    policy: &LifecyclePolicy,
) -> Change {
    let from = sub.status;
    let to = transition.target(policy);

    match transition {
        Transition::ActivateTrial => {
            if sub.has_authorized_payment_method() && sub.next_billing_date.is_none() {
                sub.next_billing_date = sub.trial_ends_at;
            }
        }
        Transition::ExpireTrial => {
            sub.payment_status = PaymentStatus::PendingPaymentMethod;
        }
        Transition::EndGracePeriod => {
            sub.payment_status = PaymentStatus::Suspended;
            sub.ends_at = Some(now);
            sub.next_billing_date = None;
        }
    }
    sub.status = to;

    Change {
        from,
        to,
        reason: transition.reason(),
    }
}

/// Record a rejected charge.
///
/// When the attempt count reaches the maximum on an `active` or `trial_expired`
/// subscription, the grace period starts in the same mutation and its marker is
/// set. Otherwise the payment-failed marker is set if this occurrence has not
/// been notified yet. `exhaust` spends the remaining retry budget at once.
pub fn record_payment_failure(
    sub: &mut Subscription,
    now: DateTime<Utc>,
    policy: &LifecyclePolicy,
    exhaust: bool,
) -> Effect {
    let from = sub.status;
    let max = policy.max_failed_attempts.max(1);

    sub.failed_payment_attempts = sub.failed_payment_attempts.saturating_add(1);
    if exhaust {
        sub.failed_payment_attempts = sub.failed_payment_attempts.max(max);
    }
    sub.payment_status = PaymentStatus::PastDue;

    let grace_eligible = matches!(
        from,
        SubscriptionStatus::Active | SubscriptionStatus::TrialExpired
    );

    if sub.failed_payment_attempts >= max && grace_eligible {
        sub.status = SubscriptionStatus::OnGracePeriod;
        sub.grace_period_ends_at = Some(now + policy.grace_period);
        sub.grace_period_reminder_sent_at = Some(now);

        return Effect {
            change: Some(Change {
                from,
                to: SubscriptionStatus::OnGracePeriod,
                reason: "payment_failed",
            }),
            notify: Some(NotificationKind::GracePeriod),
        };
    }

    let mut effect = Effect::default();
    if sub.failed_payment_attempts < max && sub.payment_due_reminder_sent_at.is_none() {
        sub.payment_due_reminder_sent_at = Some(now);
        effect.notify = Some(NotificationKind::PaymentFailed);
    }
    effect
}

/// The gateway confirmed the payment method; clears the failure state
pub fn record_method_authorized(sub: &mut Subscription, now: DateTime<Utc>) -> Effect {
    let from = sub.status;

    sub.payment_status = PaymentStatus::Active;
    sub.failed_payment_attempts = 0;
    sub.grace_period_ends_at = None;
    sub.payment_due_reminder_sent_at = None;
    sub.grace_period_reminder_sent_at = None;

    if matches!(
        from,
        SubscriptionStatus::Pending
            | SubscriptionStatus::TrialExpired
            | SubscriptionStatus::OnGracePeriod
    ) {
        sub.status = SubscriptionStatus::Active;
    }

    if sub.next_billing_date.is_none() {
        sub.next_billing_date = match sub.status {
            SubscriptionStatus::Trial => sub.trial_ends_at,
            _ => Some(sub.billing_cycle.advance(now)),
        };
    }

    Effect::status(from, sub.status, "payment_method_authorized")
}

/// A charge was collected
pub fn record_payment_success(sub: &mut Subscription, paid_at: DateTime<Utc>) -> Effect {
    let mut effect = record_method_authorized(sub, paid_at);
    sub.last_payment_date = Some(paid_at);
    sub.next_billing_date = Some(sub.billing_cycle.advance(paid_at));

    if let Some(change) = effect.change.as_mut() {
        change.reason = "payment_succeeded";
    }
    effect
}

/// Apply a polled (or notified) preapproval status.
///
/// `None` means the cached status already matches and nothing was touched.
/// A missing preapproval is passed as [`GatewayStatus::Cancelled`].
pub fn apply_gateway_status(
    sub: &mut Subscription,
    status: &GatewayStatus,
    now: DateTime<Utc>,
    policy: &LifecyclePolicy,
) -> Option<Effect> {
    if sub.mp_status.as_deref() == Some(status.as_str()) {
        return None;
    }
    sub.mp_status = Some(status.as_str().to_string());

    let effect = match status {
        GatewayStatus::Authorized => record_method_authorized(sub, now),
        GatewayStatus::Pending => {
            if sub.payment_status != PaymentStatus::PastDue {
                sub.payment_status = PaymentStatus::PendingPaymentMethod;
            }
            Effect::default()
        }
        GatewayStatus::Paused => record_payment_failure(sub, now, policy, false),
        GatewayStatus::Cancelled => {
            let effect = record_payment_failure(sub, now, policy, true);
            sub.payment_status = PaymentStatus::Expired;
            sub.mp_preapproval_id = None;
            sub.mp_init_point = None;
            effect
        }
        GatewayStatus::Other(_) => Effect::default(),
    };

    Some(effect)
}
