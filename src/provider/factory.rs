//! Provider factory

use std::sync::Arc;
use std::time::Duration;

use crate::config::ProviderConfig;

use super::http_api::{HttpApiConfig, HttpApiProvider};
use super::log::LogProvider;
use super::smtp::{SmtpConfig, SmtpProvider};
use super::{Provider, ProviderError};

/// Create the configured transport.
///
/// - `"smtp"`: `SmtpProvider`
/// - `"http"`: `HttpApiProvider` (requires `provider.api_key`)
/// - `"log"` (default): `LogProvider`
pub fn create_provider(
    settings: &ProviderConfig,
    send_timeout: Duration,
) -> Result<Arc<dyn Provider>, ProviderError> {
    match settings.kind.as_str() {
        "smtp" => {
            tracing::info!(
                provider = "smtp",
                host = %settings.smtp_host,
                port = settings.smtp_port,
                tls = settings.smtp_tls,
                "Creating SMTP provider"
            );
            Ok(Arc::new(SmtpProvider::new(SmtpConfig::from(settings))?))
        }
        "http" => {
            tracing::info!(provider = "http", url = %settings.api_url, "Creating HTTP API provider");
            let config = HttpApiConfig::from_settings(settings, send_timeout)?;
            Ok(Arc::new(HttpApiProvider::new(config)?))
        }
        "log" => {
            tracing::info!(provider = "log", "Creating log provider");
            Ok(Arc::new(LogProvider::new()))
        }
        other => {
            tracing::warn!(provider = %other, "Unknown provider kind, falling back to log");
            Ok(Arc::new(LogProvider::new()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_log() {
        let provider = create_provider(&ProviderConfig::default(), Duration::from_secs(1)).unwrap();
        assert_eq!(provider.name(), "log");
    }

    #[test]
    fn test_http_requires_key() {
        let settings = ProviderConfig {
            kind: "http".into(),
            ..ProviderConfig::default()
        };
        assert!(create_provider(&settings, Duration::from_secs(1)).is_err());
    }
}
