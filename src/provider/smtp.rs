//! SMTP provider using lettre's pooled async transport.

use async_trait::async_trait;
use lettre::{
    message::{header::ContentType, Mailbox},
    transport::smtp::{authentication::Credentials, PoolConfig},
    Address, AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor,
};

use crate::config::ProviderConfig;

use super::{ConnectionCheck, Envelope, Provider, ProviderError, SendReceipt};

#[derive(Debug, Clone)]
pub struct SmtpConfig {
    pub host: String,
    pub port: u16,
    pub from_email: String,
    pub from_name: String,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Whether to use TLS (false for local dev servers like Mailpit)
    pub use_tls: bool,
    pub pool_size: u32,
}

impl From<&ProviderConfig> for SmtpConfig {
    fn from(config: &ProviderConfig) -> Self {
        Self {
            host: config.smtp_host.clone(),
            port: config.smtp_port,
            from_email: config.from_email.clone(),
            from_name: config.from_name.clone(),
            username: config.smtp_username.clone(),
            password: config.smtp_password.clone(),
            use_tls: config.smtp_tls,
            pool_size: config.smtp_pool_size,
        }
    }
}

pub struct SmtpProvider {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
    config: SmtpConfig,
}

impl SmtpProvider {
    pub fn new(config: SmtpConfig) -> Result<Self, ProviderError> {
        let transport = Self::build_transport(&config)?;
        let from_address: Address = config
            .from_email
            .parse()
            .map_err(|e| ProviderError::Permanent(format!("Invalid from address: {}", e)))?;
        let from = mailbox(Some(&config.from_name), from_address);

        Ok(Self {
            transport,
            from,
            config,
        })
    }

    fn build_transport(
        config: &SmtpConfig,
    ) -> Result<AsyncSmtpTransport<Tokio1Executor>, ProviderError> {
        let pool = PoolConfig::new().max_size(config.pool_size.max(1));

        let mut builder = if config.use_tls {
            AsyncSmtpTransport::<Tokio1Executor>::relay(&config.host)
                .map_err(|e| {
                    ProviderError::Permanent(format!("Failed to create SMTP relay: {}", e))
                })?
                .port(config.port)
        } else {
            AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&config.host).port(config.port)
        };

        if let (Some(username), Some(password)) = (&config.username, &config.password) {
            builder = builder.credentials(Credentials::new(username.clone(), password.clone()));
        }

        Ok(builder.pool_config(pool).build())
    }

    fn build_message(&self, envelope: &Envelope) -> Result<Message, ProviderError> {
        let address: Address = envelope
            .to_address
            .parse()
            .map_err(|e| ProviderError::Permanent(format!("Invalid recipient address: {}", e)))?;
        let to = mailbox(envelope.to_name.as_deref(), address);

        let content_type = if envelope.is_html() {
            ContentType::TEXT_HTML
        } else {
            ContentType::TEXT_PLAIN
        };

        Message::builder()
            .from(self.from.clone())
            .to(to)
            .subject(&envelope.subject)
            .header(content_type)
            .body(envelope.body.clone())
            .map_err(|e| ProviderError::Permanent(format!("Failed to build message: {}", e)))
    }
}

/// Display names are carried as-is; lettre quotes them when encoding.
fn mailbox(name: Option<&str>, address: Address) -> Mailbox {
    let name = name.map(str::trim).filter(|n| !n.is_empty()).map(String::from);
    Mailbox::new(name, address)
}

/// 5xx replies that reject the recipient or the content itself.
///
/// Other 5xx replies (530/535 authentication, 521 no service, 500-504 on
/// commands) describe the relay or our account and apply to every recipient.
fn is_message_rejection(code: u16) -> bool {
    matches!(code, 541 | 550 | 551 | 552 | 553 | 554 | 556)
}

fn classify_reply(code: Option<u16>, detail: String) -> ProviderError {
    match code {
        Some(code) if is_message_rejection(code) => {
            ProviderError::Permanent(format!("SMTP rejected message: {}", detail))
        }
        _ => ProviderError::Transient(format!("SMTP send failed: {}", detail)),
    }
}

fn classify(err: lettre::transport::smtp::Error) -> ProviderError {
    let code = if err.is_permanent() {
        err.status().map(u16::from)
    } else {
        None
    };
    classify_reply(code, err.to_string())
}

#[async_trait]
impl Provider for SmtpProvider {
    fn name(&self) -> &'static str {
        "smtp"
    }

    async fn send(&self, envelope: &Envelope) -> Result<SendReceipt, ProviderError> {
        tracing::debug!(
            job_id = %envelope.job_id,
            recipient_id = %envelope.recipient_id,
            host = %self.config.host,
            port = %self.config.port,
            "Sending message via SMTP"
        );

        let message = self.build_message(envelope)?;
        let response = self.transport.send(message).await.map_err(|e| {
            let err = classify(e);
            tracing::warn!(
                job_id = %envelope.job_id,
                recipient_id = %envelope.recipient_id,
                error = %err,
                "SMTP delivery failed"
            );
            err
        })?;

        let provider_message_id = response.message().next().map(|s| s.to_string());
        Ok(SendReceipt {
            provider_message_id,
        })
    }

    async fn test_connection(&self) -> ConnectionCheck {
        match self.transport.test_connection().await {
            Ok(true) => ConnectionCheck::healthy(),
            Ok(false) => ConnectionCheck::failed("SMTP server did not accept NOOP"),
            Err(e) => ConnectionCheck::failed(format!("SMTP connection failed: {}", e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use uuid::Uuid;

    use super::*;

    fn config() -> SmtpConfig {
        SmtpConfig::from(&ProviderConfig::default())
    }

    fn envelope(address: &str, name: Option<&str>) -> Envelope {
        Envelope {
            job_id: Uuid::new_v4(),
            recipient_id: "r1".into(),
            to_address: address.into(),
            to_name: name.map(String::from),
            subject: "Hello".into(),
            body: "<p>Hi</p>".into(),
        }
    }

    #[test]
    fn test_config_from_settings() {
        let config = config();
        assert_eq!(config.port, 1025);
        assert!(!config.use_tls);
    }

    #[tokio::test]
    async fn test_build_message() {
        let provider = SmtpProvider::new(config()).unwrap();
        assert!(provider
            .build_message(&envelope("ann@example.com", Some("Ann")))
            .is_ok());
    }

    #[tokio::test]
    async fn test_malformed_address_is_permanent() {
        let provider = SmtpProvider::new(config()).unwrap();
        let err = provider
            .build_message(&envelope("not an address", None))
            .unwrap_err();
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn test_display_name_with_specials_is_accepted() {
        let provider = SmtpProvider::new(config()).unwrap();
        for name in ["Doe, John", "O'Brien <ops>", "\"Quoted\" Name"] {
            let message = provider
                .build_message(&envelope("john@example.com", Some(name)))
                .unwrap();
            let to = &message.envelope().to()[0];
            assert_eq!(to.to_string(), "john@example.com");
        }
    }

    #[test]
    fn test_blank_display_name_is_dropped() {
        let address: Address = "ann@example.com".parse().unwrap();
        assert_eq!(mailbox(Some("  "), address.clone()).name, None);
        assert_eq!(
            mailbox(Some("Doe, John"), address).name.as_deref(),
            Some("Doe, John")
        );
    }

    #[test]
    fn test_recipient_rejections_are_permanent() {
        for code in [550, 551, 553, 554] {
            assert!(!classify_reply(Some(code), "rejected".into()).is_transient());
        }
    }

    #[test]
    fn test_account_and_relay_failures_are_transient() {
        for code in [421, 450, 500, 521, 530, 535, 538] {
            assert!(
                classify_reply(Some(code), "relay".into()).is_transient(),
                "{} should be transient",
                code
            );
        }
        assert!(classify_reply(None, "connection reset".into()).is_transient());
    }
}
