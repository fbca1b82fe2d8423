//! Message transport providers.
//!
//! Every transport implements `Provider` and classifies its native errors as
//! transient (retry the pointer later) or permanent (fail the recipient).

mod factory;
mod http_api;
mod log;
mod smtp;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

pub use factory::create_provider;
pub use http_api::{HttpApiConfig, HttpApiProvider};
pub use log::LogProvider;
pub use smtp::{SmtpConfig, SmtpProvider};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProviderError {
    /// Worth retrying later: timeouts, throttling, remote 5xx, network or
    /// credential errors
    #[error("transient provider error: {0}")]
    Transient(String),

    /// Retrying will not help: rejected address, malformed message
    #[error("permanent provider error: {0}")]
    Permanent(String),
}

impl ProviderError {
    pub fn is_transient(&self) -> bool {
        matches!(self, ProviderError::Transient(_))
    }

    pub fn message(&self) -> &str {
        match self {
            ProviderError::Transient(m) | ProviderError::Permanent(m) => m,
        }
    }
}

/// One rendered message addressed to one recipient.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub job_id: Uuid,
    pub recipient_id: String,
    pub to_address: String,
    pub to_name: Option<String>,
    pub subject: String,
    pub body: String,
}

impl Envelope {
    /// Bodies that start with markup are sent as HTML.
    pub fn is_html(&self) -> bool {
        self.body.trim_start().starts_with('<')
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SendReceipt {
    pub provider_message_id: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConnectionCheck {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ConnectionCheck {
    pub fn healthy() -> Self {
        Self { ok: true, error: None }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            ok: false,
            error: Some(error.into()),
        }
    }
}

/// Transport used to deliver rendered messages.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Provider name for logging.
    fn name(&self) -> &'static str;

    async fn send(&self, envelope: &Envelope) -> Result<SendReceipt, ProviderError>;

    /// Send several envelopes; results are in input order.
    async fn send_batch(&self, envelopes: &[Envelope]) -> Vec<Result<SendReceipt, ProviderError>> {
        let mut results = Vec::with_capacity(envelopes.len());
        for envelope in envelopes {
            results.push(self.send(envelope).await);
        }
        results
    }

    async fn test_connection(&self) -> ConnectionCheck;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn envelope(body: &str) -> Envelope {
        Envelope {
            job_id: Uuid::new_v4(),
            recipient_id: "r1".into(),
            to_address: "a@b.io".into(),
            to_name: None,
            subject: "s".into(),
            body: body.into(),
        }
    }

    #[test]
    fn test_html_detection() {
        assert!(envelope("  <p>Hi</p>").is_html());
        assert!(!envelope("Hi <b>there</b>").is_html());
    }

    #[test]
    fn test_error_classification() {
        assert!(ProviderError::Transient("t".into()).is_transient());
        assert!(!ProviderError::Permanent("p".into()).is_transient());
        assert_eq!(ProviderError::Permanent("bad rcpt".into()).message(), "bad rcpt");
    }

    #[tokio::test]
    async fn test_default_send_batch_preserves_order() {
        let provider = LogProvider::new();
        let envelopes = vec![envelope("one"), envelope("two")];
        let results = provider.send_batch(&envelopes).await;
        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|r| r.is_ok()));
    }
}
