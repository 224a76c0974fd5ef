//! Agenda Billing Core - Subscription lifecycle engine
//!
//! Trial, grace-period and suspension transitions, MercadoPago preapproval
//! reconciliation, marker-guarded lifecycle emails and the scheduled sweeps
//! that drive them.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use agenda_billing_core::{BillingConfig, BillingService, LogMailTransport, MercadoPagoGateway};
//! use agenda_db::Repositories;
//!
//! let config = BillingConfig::new("APP_USR-...", "webhook-secret");
//! let gateway = Arc::new(MercadoPagoGateway::new(&config));
//! let billing = BillingService::new(repos.into(), gateway, Arc::new(LogMailTransport), config);
//!
//! // Tenant-admin action
//! let outcome = billing.cancel(tenant_id, subscription_id).await?;
//!
//! // Scheduled pass
//! let report = Sweeper::new(billing.clone()).run(Job::Process).await?;
//! ```

pub mod clock;
pub mod config;
pub mod error;
pub mod gateway;
pub mod lifecycle;
pub mod mail;
pub mod mercadopago;
pub mod notify;
pub mod provider;
pub mod scheduler;
pub mod service;
pub mod status;
pub mod stores;
pub mod sweeper;
pub mod webhook;

pub use clock::{Clock, SystemClock};
pub use config::{BillingConfig, GraceExpiryAction};
pub use error::{BillingError, GatewayError};
pub use gateway::GatewayAdapter;
pub use lifecycle::LifecyclePolicy;
pub use mail::{HttpMailTransport, LogMailTransport, MailError, MailMessage, MailTransport};
pub use mercadopago::MercadoPagoGateway;
pub use notify::{Delivery, NotificationDispatcher};
pub use provider::{
    AuthorizedPayment, GatewayStatus, PaymentGateway, PaymentOutcome, Preapproval,
    PreapprovalRequest,
};
pub use scheduler::{Cadence, Job, OverlapGuard, Scheduler};
pub use service::{BillingService, Committed};
pub use stores::Stores;
pub use sweeper::{SweepReport, Sweeper};
pub use webhook::{WebhookNotification, WebhookOutcome, WebhookTopic, WebhookVerifier};
