//! Recording mail transport for testing

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use agenda_billing_core::{MailError, MailMessage, MailTransport};
use agenda_types::NotificationKind;
use async_trait::async_trait;

#[derive(Default, Clone)]
pub struct RecordingMailer {
    sent: Arc<Mutex<Vec<MailMessage>>>,
    failing: Arc<AtomicBool>,
}

#[allow(dead_code)]
impl RecordingMailer {
    pub fn sent(&self) -> Vec<MailMessage> {
        self.sent.lock().unwrap().clone()
    }

    pub fn sent_of(&self, kind: NotificationKind) -> usize {
        self.sent().iter().filter(|m| m.template == kind).count()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl MailTransport for RecordingMailer {
    async fn send(&self, message: &MailMessage) -> Result<(), MailError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(MailError("relay down".to_string()));
        }
        self.sent.lock().unwrap().push(message.clone());
        Ok(())
    }
}
