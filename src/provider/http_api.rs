//! HTTP mail API provider speaking the SendGrid v3 `mail/send` format.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};

use crate::config::ProviderConfig;

use super::{ConnectionCheck, Envelope, Provider, ProviderError, SendReceipt};

#[derive(Debug, Clone)]
pub struct HttpApiConfig {
    pub api_url: String,
    pub api_key: String,
    pub from_email: String,
    pub from_name: String,
    pub timeout: Duration,
}

impl HttpApiConfig {
    pub fn from_settings(config: &ProviderConfig, timeout: Duration) -> Result<Self, ProviderError> {
        let api_key = config
            .api_key
            .clone()
            .filter(|k| !k.is_empty())
            .ok_or_else(|| ProviderError::Permanent("provider.api_key is not set".to_string()))?;

        Ok(Self {
            api_url: config.api_url.trim_end_matches('/').to_string(),
            api_key,
            from_email: config.from_email.clone(),
            from_name: config.from_name.clone(),
            timeout,
        })
    }
}

#[derive(Debug, Serialize)]
struct SendRequest<'a> {
    personalizations: Vec<Personalization<'a>>,
    from: EmailAddress<'a>,
    subject: &'a str,
    content: Vec<Content<'a>>,
    custom_args: CustomArgs<'a>,
}

#[derive(Debug, Serialize)]
struct Personalization<'a> {
    to: Vec<EmailAddress<'a>>,
}

#[derive(Debug, Serialize)]
struct EmailAddress<'a> {
    email: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<&'a str>,
}

#[derive(Debug, Serialize)]
struct Content<'a> {
    #[serde(rename = "type")]
    content_type: &'static str,
    value: &'a str,
}

#[derive(Debug, Serialize)]
struct CustomArgs<'a> {
    job_id: String,
    recipient_id: &'a str,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    #[serde(default)]
    errors: Vec<ApiErrorDetail>,
}

#[derive(Debug, Deserialize)]
struct ApiErrorDetail {
    message: String,
}

pub struct HttpApiProvider {
    config: HttpApiConfig,
    client: Client,
}

impl HttpApiProvider {
    pub fn new(config: HttpApiConfig) -> Result<Self, ProviderError> {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| ProviderError::Permanent(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self { config, client })
    }

    fn request<'a>(&'a self, envelope: &'a Envelope) -> SendRequest<'a> {
        SendRequest {
            personalizations: vec![Personalization {
                to: vec![EmailAddress {
                    email: &envelope.to_address,
                    name: envelope.to_name.as_deref().filter(|n| !n.is_empty()),
                }],
            }],
            from: EmailAddress {
                email: &self.config.from_email,
                name: Some(&self.config.from_name),
            },
            subject: &envelope.subject,
            content: vec![Content {
                content_type: if envelope.is_html() {
                    "text/html"
                } else {
                    "text/plain"
                },
                value: &envelope.body,
            }],
            custom_args: CustomArgs {
                job_id: envelope.job_id.to_string(),
                recipient_id: &envelope.recipient_id,
            },
        }
    }
}

/// Rejections of our credentials or endpoint apply to every recipient.
fn is_account_failure(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN | StatusCode::NOT_FOUND
    )
}

/// Throttling, server-side and account failures are transient; the
/// remaining 4xx reject the message itself.
fn classify_status(status: StatusCode, detail: String) -> ProviderError {
    let message = format!("mail API returned {}: {}", status.as_u16(), detail);
    if status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
        || status.is_server_error()
        || is_account_failure(status)
    {
        ProviderError::Transient(message)
    } else {
        ProviderError::Permanent(message)
    }
}

fn classify_transport(err: reqwest::Error) -> ProviderError {
    if err.is_builder() {
        ProviderError::Permanent(format!("invalid mail API request: {}", err))
    } else {
        ProviderError::Transient(format!("mail API unreachable: {}", err))
    }
}

fn error_detail(body: &str) -> String {
    match serde_json::from_str::<ApiErrorBody>(body) {
        Ok(parsed) if !parsed.errors.is_empty() => parsed
            .errors
            .into_iter()
            .map(|e| e.message)
            .collect::<Vec<_>>()
            .join("; "),
        _ => body.chars().take(200).collect(),
    }
}

#[async_trait]
impl Provider for HttpApiProvider {
    fn name(&self) -> &'static str {
        "http"
    }

    async fn send(&self, envelope: &Envelope) -> Result<SendReceipt, ProviderError> {
        tracing::debug!(
            job_id = %envelope.job_id,
            recipient_id = %envelope.recipient_id,
            "Sending message via HTTP API"
        );

        let response = self
            .client
            .post(format!("{}/mail/send", self.config.api_url))
            .bearer_auth(&self.config.api_key)
            .json(&self.request(envelope))
            .send()
            .await
            .map_err(classify_transport)?;

        let status = response.status();
        let provider_message_id = response
            .headers()
            .get("x-message-id")
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());

        if status.is_success() {
            return Ok(SendReceipt {
                provider_message_id,
            });
        }

        let body = response.text().await.unwrap_or_default();
        let err = classify_status(status, error_detail(&body));
        tracing::warn!(
            job_id = %envelope.job_id,
            recipient_id = %envelope.recipient_id,
            status = status.as_u16(),
            error = %err,
            "HTTP API delivery failed"
        );
        Err(err)
    }

    async fn test_connection(&self) -> ConnectionCheck {
        let result = self
            .client
            .get(format!("{}/scopes", self.config.api_url))
            .bearer_auth(&self.config.api_key)
            .send()
            .await;

        match result {
            Ok(response) if response.status().is_success() => ConnectionCheck::healthy(),
            Ok(response) => {
                ConnectionCheck::failed(format!("mail API returned {}", response.status()))
            }
            Err(e) => ConnectionCheck::failed(format!("mail API unreachable: {}", e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use uuid::Uuid;

    use super::*;

    #[test]
    fn test_status_classification() {
        assert!(classify_status(StatusCode::TOO_MANY_REQUESTS, String::new()).is_transient());
        assert!(classify_status(StatusCode::BAD_GATEWAY, String::new()).is_transient());
        assert!(!classify_status(StatusCode::BAD_REQUEST, String::new()).is_transient());
        assert!(
            !classify_status(StatusCode::UNPROCESSABLE_ENTITY, String::new()).is_transient()
        );
    }

    #[test]
    fn test_credential_failures_are_transient() {
        for status in [
            StatusCode::UNAUTHORIZED,
            StatusCode::FORBIDDEN,
            StatusCode::NOT_FOUND,
        ] {
            let err = classify_status(status, "bad key".into());
            assert!(err.is_transient(), "{} should be transient", status);
            assert!(err.to_string().contains("bad key"));
        }
    }

    #[test]
    fn test_error_detail_parsing() {
        let body = r#"{"errors":[{"message":"invalid email","field":"to"}]}"#;
        assert_eq!(error_detail(body), "invalid email");
        assert_eq!(error_detail("plain failure"), "plain failure");
    }

    #[test]
    fn test_missing_api_key_rejected() {
        let settings = ProviderConfig::default();
        assert!(HttpApiConfig::from_settings(&settings, Duration::from_secs(5)).is_err());
    }

    #[test]
    fn test_request_shape() {
        let settings = ProviderConfig {
            api_key: Some("key".into()),
            ..ProviderConfig::default()
        };
        let provider =
            HttpApiProvider::new(HttpApiConfig::from_settings(&settings, Duration::from_secs(5)).unwrap())
                .unwrap();
        let envelope = Envelope {
            job_id: Uuid::new_v4(),
            recipient_id: "r9".into(),
            to_address: "bo@example.com".into(),
            to_name: Some("Bo".into()),
            subject: "Hi".into(),
            body: "plain".into(),
        };

        let json = serde_json::to_value(provider.request(&envelope)).unwrap();
        assert_eq!(json["personalizations"][0]["to"][0]["email"], "bo@example.com");
        assert_eq!(json["content"][0]["type"], "text/plain");
        assert_eq!(json["custom_args"]["recipient_id"], "r9");
    }
}
