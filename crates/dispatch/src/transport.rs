//! Outbound mail delivery.
//!
//! [`MailTransport`] is the seam to the email service provider. The
//! [`LogTransport`] stub builds the provider payload, logs it and hands back
//! a synthetic message id; production wires a real provider client here.

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use drip_core::SequencerResult;
use drip_sequences::types::Sender;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundEmail {
    /// Idempotency key for providers that support one.
    pub scheduled_email_id: Uuid,
    pub to: String,
    pub to_name: Option<String>,
    pub from: Sender,
    pub subject: String,
    pub html: String,
}

#[async_trait]
pub trait MailTransport: Send + Sync {
    /// Returns the provider's message id.
    async fn send(&self, email: &OutboundEmail) -> SequencerResult<String>;
}

/// Development transport: logs instead of sending.
#[derive(Default)]
pub struct LogTransport {
    sent: AtomicU64,
}

impl LogTransport {
    pub fn new() -> Self {
        info!("Log mail transport initialized, emails will not leave this process");
        Self::default()
    }

    pub fn sent_count(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl MailTransport for LogTransport {
    async fn send(&self, email: &OutboundEmail) -> SequencerResult<String> {
        let payload = serde_json::json!({
            "personalizations": [{
                "to": [{"email": email.to, "name": email.to_name}],
                "custom_args": {"scheduled_email_id": email.scheduled_email_id}
            }],
            "from": {"email": email.from.email, "name": email.from.name},
            "subject": email.subject,
            "content": [{"type": "text/html", "value": email.html}],
        });
        let message_id = format!("log-{}", Uuid::new_v4());

        debug!(payload = %payload, "Outbound email payload");
        info!(
            to = %email.to,
            subject = %email.subject,
            message_id = %message_id,
            "Email logged (not sent)"
        );
        self.sent.fetch_add(1, Ordering::Relaxed);
        Ok(message_id)
    }
}
