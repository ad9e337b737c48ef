//! Twilio REST client for SMS

use super::SmsProvider;
use crate::config::TwilioSettings;
use crate::error::{NotificationError, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, info};

#[derive(Debug, Deserialize)]
struct TwilioError {
    #[serde(default)]
    code: Option<i64>,
    message: String,
}

pub struct TwilioClient {
    client: reqwest::Client,
    base_url: String,
    account_sid: String,
    auth_token: String,
}

impl TwilioClient {
    pub fn new(settings: &TwilioSettings, timeout: Duration) -> Result<Self> {
        info!("Initializing Twilio SMS provider");

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| NotificationError::config(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: settings.base_url.trim_end_matches('/').to_string(),
            account_sid: settings.account_sid.clone(),
            auth_token: settings.auth_token.clone(),
        })
    }
}

#[async_trait]
impl SmsProvider for TwilioClient {
    async fn send(&self, from: &str, to: &str, body: &str) -> Result<()> {
        let url = format!(
            "{}/2010-04-01/Accounts/{}/Messages.json",
            self.base_url, self.account_sid
        );
        debug!(to = to, "Submitting SMS");

        let response = self
            .client
            .post(&url)
            .basic_auth(&self.account_sid, Some(&self.auth_token))
            .form(&[("From", from), ("To", to), ("Body", body)])
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        let text = response.text().await.unwrap_or_default();
        let message = match serde_json::from_str::<TwilioError>(&text) {
            Ok(TwilioError {
                code: Some(code),
                message,
            }) => format!("{} ({})", message, code),
            Ok(TwilioError { message, .. }) => message,
            Err(_) => format!("status {}", status),
        };
        Err(NotificationError::sms(message))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_string_contains, header_exists, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client_for(server: &MockServer) -> TwilioClient {
        let settings = TwilioSettings {
            account_sid: "AC123".to_string(),
            auth_token: "secret".to_string(),
            base_url: server.uri(),
        };
        TwilioClient::new(&settings, Duration::from_secs(5)).unwrap()
    }

    #[tokio::test]
    async fn test_send_posts_form_with_basic_auth() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/2010-04-01/Accounts/AC123/Messages.json"))
            .and(header_exists("authorization"))
            .and(body_string_contains("Body=You+have+a+new+message."))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({"sid": "SM1"})))
            .expect(1)
            .mount(&server)
            .await;

        client_for(&server)
            .send("+15555550100", "+15555550123", "You have a new message.")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_rejection_becomes_sms_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(400).set_body_json(json!({
                "code": 21211,
                "message": "The 'To' number is not a valid phone number."
            })))
            .mount(&server)
            .await;

        let err = client_for(&server)
            .send("+15555550100", "bogus", "hi")
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "SMS_ERROR");
        assert!(err.to_string().contains("21211"));
    }
}
