//! Mail transport
//!
//! Templates are rendered by the relay; the engine only hands over the
//! template kind and its data.

use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use thiserror::Error;
use tracing::{info, instrument};

use agenda_types::NotificationKind;

/// Mail transport failure
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct MailError(pub String);

/// A lifecycle email ready for the transport
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MailMessage {
    pub to: String,
    pub template: NotificationKind,
    pub data: serde_json::Value,
}

/// Outbound mail
#[async_trait]
pub trait MailTransport: Send + Sync {
    async fn send(&self, message: &MailMessage) -> Result<(), MailError>;
}

/// Posts messages to an HTTP mail relay
#[derive(Clone)]
pub struct HttpMailTransport {
    client: Client,
    url: String,
    token: Option<String>,
    from: String,
}

impl HttpMailTransport {
    pub fn new(url: impl Into<String>, token: Option<String>, from: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            url: url.into(),
            token,
            from: from.into(),
        }
    }
}

#[derive(Serialize)]
struct RelayRequest<'a> {
    from: &'a str,
    to: &'a str,
    template: &'a str,
    data: &'a serde_json::Value,
}

#[async_trait]
impl MailTransport for HttpMailTransport {
    #[instrument(skip(self, message), fields(template = %message.template))]
    async fn send(&self, message: &MailMessage) -> Result<(), MailError> {
        let body = RelayRequest {
            from: &self.from,
            to: &message.to,
            template: message.template.as_str(),
            data: &message.data,
        };

        let mut request = self.client.post(&self.url).json(&body);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| MailError(format!("relay unreachable: {e}")))?;

        if !response.status().is_success() {
            return Err(MailError(format!("relay returned {}", response.status())));
        }
        Ok(())
    }
}

/// Logs messages instead of sending them
#[derive(Debug, Clone, Copy, Default)]
pub struct LogMailTransport;

#[async_trait]
impl MailTransport for LogMailTransport {
    async fn send(&self, message: &MailMessage) -> Result<(), MailError> {
        info!(
            to = %message.to,
            template = %message.template,
            data = %message.data,
            "Mail relay not configured, logging lifecycle email"
        );
        Ok(())
    }
}
