//! Configuration for the Billing API service.

use std::time::Duration;

use agenda_billing_core::{BillingConfig, GraceExpiryAction};

/// Billing API configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// HTTP server port
    pub http_port: u16,
    /// Database URL
    pub database_url: String,
    /// Billing core configuration
    pub billing: BillingConfig,
    /// Mail relay settings
    pub mail: MailConfig,
    /// Request timeout
    pub request_timeout: Duration,
    /// Metrics enabled
    pub metrics_enabled: bool,
    /// Run the job timers inside this process
    pub scheduler_enabled: bool,
}

/// Outbound mail settings
#[derive(Debug, Clone)]
pub struct MailConfig {
    pub from: String,
    /// HTTP relay endpoint; lifecycle emails are only logged when unset
    pub service_url: Option<String>,
    pub service_token: Option<String>,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through `lookup`
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let required = |key: &'static str| lookup(key).ok_or(ConfigError::Missing(key));
        let or_default = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());

        // Database
        let database_url = required("DATABASE_URL")?;

        // Server
        let http_port = parse("HTTP_PORT", &or_default("HTTP_PORT", "8081"))?;
        let request_timeout_secs: u64 =
            parse("REQUEST_TIMEOUT_SECS", &or_default("REQUEST_TIMEOUT_SECS", "30"))?;
        let metrics_enabled = parse("METRICS_ENABLED", &or_default("METRICS_ENABLED", "true"))?;
        let scheduler_enabled = parse("SCHEDULER_ENABLED", &or_default("SCHEDULER_ENABLED", "true"))?;

        // MercadoPago
        let access_token = required("MERCADOPAGO_ACCESS_TOKEN")?;
        let webhook_secret = required("MERCADOPAGO_WEBHOOK_SECRET")?;
        let gateway_timeout_secs: u64 =
            parse("GATEWAY_TIMEOUT_SECS", &or_default("GATEWAY_TIMEOUT_SECS", "10"))?;

        // Lifecycle
        let reminder_days = parse(
            "BILLING_REMINDER_DAYS_BEFORE_TRIAL_END",
            &or_default("BILLING_REMINDER_DAYS_BEFORE_TRIAL_END", "3"),
        )?;
        let grace_days = parse(
            "BILLING_GRACE_PERIOD_DAYS",
            &or_default("BILLING_GRACE_PERIOD_DAYS", "7"),
        )?;
        let max_attempts: u32 = parse(
            "BILLING_MAX_FAILED_ATTEMPTS",
            &or_default("BILLING_MAX_FAILED_ATTEMPTS", "3"),
        )?;
        if max_attempts == 0 {
            return Err(ConfigError::Invalid("BILLING_MAX_FAILED_ATTEMPTS"));
        }
        let grace_expiry: GraceExpiryAction = parse(
            "BILLING_GRACE_EXPIRY_ACTION",
            &or_default("BILLING_GRACE_EXPIRY_ACTION", "cancel"),
        )?;
        let orphan_retention_days = parse(
            "BILLING_ORPHAN_RETENTION_DAYS",
            &or_default("BILLING_ORPHAN_RETENTION_DAYS", "7"),
        )?;

        // Mail
        let mail_timeout_secs: u64 =
            parse("MAIL_TIMEOUT_SECS", &or_default("MAIL_TIMEOUT_SECS", "10"))?;
        let mail = MailConfig {
            from: or_default("MAIL_FROM", "Agenda <no-reply@agenda.app>"),
            service_url: lookup("MAIL_SERVICE_URL").filter(|u| !u.is_empty()),
            service_token: lookup("MAIL_SERVICE_TOKEN").filter(|t| !t.is_empty()),
        };

        let mut billing = BillingConfig::new(access_token, webhook_secret)
            .with_timeouts(
                Duration::from_secs(gateway_timeout_secs),
                Duration::from_secs(mail_timeout_secs),
            )
            .with_lifecycle(reminder_days, grace_days, max_attempts)
            .with_grace_expiry_action(grace_expiry)
            .with_orphan_retention_days(orphan_retention_days);
        if let Some(base_url) = lookup("MERCADOPAGO_BASE_URL") {
            billing = billing.with_base_url(base_url);
        }
        if let Some(path) = lookup("BILLING_PAYMENT_RETURN_PATH") {
            billing = billing.with_payment_return_path(path);
        }

        Ok(Self {
            http_port,
            database_url,
            billing,
            mail,
            request_timeout: Duration::from_secs(request_timeout_secs),
            metrics_enabled,
            scheduler_enabled,
        })
    }
}

fn parse<T: std::str::FromStr>(key: &'static str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::Invalid(key))
}

/// Configuration error
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    Missing(&'static str),

    #[error("Invalid value for environment variable: {0}")]
    Invalid(&'static str),
}
