//! Mandrill-style template email API
//!
//! Wire types for `messages/send-template.json` and an HTTP client. Any
//! status of 400 or above carries a `{status, code, name, message}` body that
//! is surfaced as [`NotificationError::TemplateProvider`].

use super::TemplateProvider;
use crate::config::MandrillSettings;
use crate::error::{NotificationError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, info};

pub const MERGE_LANGUAGE_HANDLEBARS: &str = "handlebars";

/// Template variable
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Var {
    pub name: String,
    pub content: serde_json::Value,
}

impl Var {
    pub fn new(name: impl Into<String>, content: impl Into<serde_json::Value>) -> Self {
        Self {
            name: name.into(),
            content: content.into(),
        }
    }
}

/// Variables scoped to one recipient address
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergeVar {
    pub rcpt: String,
    pub vars: Vec<Var>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecipientType {
    To,
    Cc,
    Bcc,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recipient {
    pub email: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<RecipientType>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    #[serde(rename = "type")]
    pub mime_type: String,
    pub name: String,
    /// Base64-encoded body
    pub content: String,
}

/// Message metadata sent alongside a template name
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Message {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from_email: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from_name: Option<String>,
    #[serde(default)]
    pub to: Vec<Recipient>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bcc_address: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preserve_recipients: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub view_content_link: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub merge_language: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub global_merge_vars: Vec<Var>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub merge_vars: Vec<MergeVar>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<Attachment>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
}

impl Message {
    pub fn recipient_emails(&self) -> Vec<&str> {
        self.to.iter().map(|r| r.email.as_str()).collect()
    }

    pub fn global_var(&self, name: &str) -> Option<&serde_json::Value> {
        self.global_merge_vars
            .iter()
            .find(|var| var.name == name)
            .map(|var| &var.content)
    }
}

/// Per-recipient result of a send
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendResult {
    pub email: String,
    pub status: String,
    #[serde(default)]
    pub reject_reason: Option<String>,
    #[serde(rename = "_id", default)]
    pub id: Option<String>,
}

/// Error body returned with any failing status
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderErrorBody {
    pub status: String,
    pub code: i64,
    pub name: String,
    pub message: String,
}

impl From<ProviderErrorBody> for NotificationError {
    fn from(body: ProviderErrorBody) -> Self {
        NotificationError::TemplateProvider {
            status: body.status,
            code: body.code,
            name: body.name,
            message: body.message,
        }
    }
}

#[derive(Serialize)]
struct SendTemplateRequest<'a> {
    key: &'a str,
    template_name: &'a str,
    template_content: Option<&'a [Var]>,
    message: &'a Message,
    #[serde(rename = "async")]
    async_send: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    ip_pool: Option<&'a str>,
}

pub struct MandrillClient {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    ip_pool: Option<String>,
}

impl MandrillClient {
    pub fn new(settings: &MandrillSettings, timeout: Duration) -> Result<Self> {
        info!("Initializing Mandrill template provider");

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| NotificationError::config(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: settings.base_url.trim_end_matches('/').to_string(),
            api_key: settings.api_key.clone(),
            ip_pool: settings.ip_pool.clone(),
        })
    }
}

#[async_trait]
impl TemplateProvider for MandrillClient {
    async fn send_message_template(
        &self,
        template_name: &str,
        template_content: Option<&[Var]>,
        message: &Message,
        async_send: bool,
    ) -> Result<Vec<SendResult>> {
        let url = format!("{}/messages/send-template.json", self.base_url);
        let request = SendTemplateRequest {
            key: &self.api_key,
            template_name,
            template_content,
            message,
            async_send,
            ip_pool: self.ip_pool.as_deref(),
        };

        debug!(
            template = template_name,
            recipients = message.to.len(),
            "Submitting template send"
        );

        let response = self.client.post(&url).json(&request).send().await?;
        let status = response.status();
        if status.as_u16() >= 400 {
            let body = response.text().await?;
            return Err(match serde_json::from_str::<ProviderErrorBody>(&body) {
                Ok(error) => error.into(),
                Err(_) => NotificationError::email(format!(
                    "Template provider returned {}: {}",
                    status, body
                )),
            });
        }

        Ok(response.json::<Vec<SendResult>>().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client_for(server: &MockServer) -> MandrillClient {
        let settings = MandrillSettings {
            api_key: "test-key".to_string(),
            base_url: server.uri(),
            ip_pool: Some("Main Pool".to_string()),
        };
        MandrillClient::new(&settings, Duration::from_secs(5)).unwrap()
    }

    fn message() -> Message {
        Message {
            to: vec![Recipient {
                email: "alice@example.test".to_string(),
                name: None,
                kind: None,
            }],
            merge_language: Some(MERGE_LANGUAGE_HANDLEBARS.to_string()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_send_template_request_shape() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/messages/send-template.json"))
            .and(body_partial_json(json!({
                "key": "test-key",
                "template_name": "welcome",
                "template_content": null,
                "async": true,
                "ip_pool": "Main Pool",
                "message": {"merge_language": "handlebars"}
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                {"email": "alice@example.test", "status": "queued", "_id": "abc"}
            ])))
            .expect(1)
            .mount(&server)
            .await;

        let results = client_for(&server)
            .send_message_template("welcome", None, &message(), true)
            .await
            .unwrap();

        assert_eq!(results.len(), 1);
        assert_eq!(results[0].status, "queued");
        assert_eq!(results[0].id.as_deref(), Some("abc"));
    }

    #[tokio::test]
    async fn test_error_body_is_surfaced() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/messages/send-template.json"))
            .respond_with(ResponseTemplate::new(500).set_body_json(json!({
                "status": "error",
                "code": 5,
                "name": "Unknown_Template",
                "message": "No such template \"welcome\""
            })))
            .mount(&server)
            .await;

        let err = client_for(&server)
            .send_message_template("welcome", None, &message(), false)
            .await
            .unwrap_err();

        match err {
            NotificationError::TemplateProvider { code, name, .. } => {
                assert_eq!(code, 5);
                assert_eq!(name, "Unknown_Template");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_error_without_json_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(502).set_body_string("bad gateway"))
            .mount(&server)
            .await;

        let err = client_for(&server)
            .send_message_template("welcome", None, &message(), false)
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "EMAIL_ERROR");
    }
}
