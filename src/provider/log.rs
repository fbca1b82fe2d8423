//! Development provider that only logs what would have been sent.

use async_trait::async_trait;
use uuid::Uuid;

use super::{ConnectionCheck, Envelope, Provider, ProviderError, SendReceipt};

#[derive(Debug, Default)]
pub struct LogProvider;

impl LogProvider {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Provider for LogProvider {
    fn name(&self) -> &'static str {
        "log"
    }

    async fn send(&self, envelope: &Envelope) -> Result<SendReceipt, ProviderError> {
        let message_id = format!("log-{}", Uuid::new_v4());
        tracing::info!(
            job_id = %envelope.job_id,
            recipient_id = %envelope.recipient_id,
            to = %envelope.to_address,
            subject = %envelope.subject,
            body_len = envelope.body.len(),
            message_id = %message_id,
            "Delivered message to log provider"
        );
        Ok(SendReceipt {
            provider_message_id: Some(message_id),
        })
    }

    async fn test_connection(&self) -> ConnectionCheck {
        ConnectionCheck::healthy()
    }
}
