//! Providers that log every call and keep the most recent ones in memory
//!
//! Used when no real provider is configured (local runs and the admin tool
//! print what would have been sent) and by tests, which can also script
//! failures per endpoint or per recipient. Each history is capped at
//! [`HISTORY_LIMIT`] entries, oldest dropped first.

use super::{Message, PushProvider, SendResult, SmsProvider, TemplateProvider, Var};
use crate::error::{NotificationError, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, HashSet, VecDeque};
use tracing::info;

/// Entries kept per history before the oldest is dropped
pub const HISTORY_LIMIT: usize = 1000;

struct History<T> {
    entries: Mutex<VecDeque<T>>,
    limit: usize,
}

impl<T: Clone> History<T> {
    fn with_limit(limit: usize) -> Self {
        Self {
            entries: Mutex::new(VecDeque::new()),
            limit,
        }
    }

    fn push(&self, entry: T) {
        let mut entries = self.entries.lock();
        while entries.len() >= self.limit.max(1) {
            entries.pop_front();
        }
        entries.push_back(entry);
    }

    fn to_vec(&self) -> Vec<T> {
        self.entries.lock().iter().cloned().collect()
    }
}

impl<T: Clone> Default for History<T> {
    fn default() -> Self {
        Self::with_limit(HISTORY_LIMIT)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PublishedPush {
    pub endpoint: String,
    pub payload: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CreatedEndpoint {
    pub application_endpoint: String,
    pub device_token: String,
    pub endpoint: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushFailure {
    Transport,
    Disabled,
}

#[derive(Default)]
pub struct RecordingPushProvider {
    published: History<PublishedPush>,
    created: History<CreatedEndpoint>,
    failures: Mutex<HashMap<String, PushFailure>>,
    next_endpoints: Mutex<Vec<String>>,
}

impl RecordingPushProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_history_limit(limit: usize) -> Self {
        Self {
            published: History::with_limit(limit),
            created: History::with_limit(limit),
            ..Self::default()
        }
    }

    /// Make publishes to `endpoint` fail.
    pub fn fail_endpoint(&self, endpoint: &str, failure: PushFailure) {
        self.failures.lock().insert(endpoint.to_string(), failure);
    }

    /// Queue endpoint ids to hand out from `create_platform_endpoint`.
    pub fn queue_endpoint(&self, endpoint: &str) {
        self.next_endpoints.lock().push(endpoint.to_string());
    }

    pub fn published(&self) -> Vec<PublishedPush> {
        self.published.to_vec()
    }

    pub fn created(&self) -> Vec<CreatedEndpoint> {
        self.created.to_vec()
    }
}

#[async_trait]
impl PushProvider for RecordingPushProvider {
    async fn create_platform_endpoint(
        &self,
        application_endpoint: &str,
        device_token: &str,
    ) -> Result<String> {
        let endpoint = {
            let mut queued = self.next_endpoints.lock();
            if queued.is_empty() {
                format!("{}/endpoint/{}", application_endpoint, device_token)
            } else {
                queued.remove(0)
            }
        };
        info!(
            application_endpoint = application_endpoint,
            endpoint = %endpoint,
            "Created push endpoint"
        );
        self.created.push(CreatedEndpoint {
            application_endpoint: application_endpoint.to_string(),
            device_token: device_token.to_string(),
            endpoint: endpoint.clone(),
        });
        Ok(endpoint)
    }

    async fn publish(&self, endpoint: &str, payload: &str) -> Result<()> {
        info!(endpoint = endpoint, payload = payload, "Push publish");
        self.published.push(PublishedPush {
            endpoint: endpoint.to_string(),
            payload: payload.to_string(),
        });
        match self.failures.lock().get(endpoint) {
            None => Ok(()),
            Some(PushFailure::Transport) => Err(NotificationError::push(format!(
                "publish to {} failed",
                endpoint
            ))),
            Some(PushFailure::Disabled) => Err(NotificationError::EndpointDisabled {
                endpoint: endpoint.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SentSms {
    pub from: String,
    pub to: String,
    pub body: String,
}

#[derive(Default)]
pub struct RecordingSmsProvider {
    sent: History<SentSms>,
    failing: Mutex<HashSet<String>>,
}

impl RecordingSmsProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_history_limit(limit: usize) -> Self {
        Self {
            sent: History::with_limit(limit),
            ..Self::default()
        }
    }

    pub fn fail_number(&self, number: &str) {
        self.failing.lock().insert(number.to_string());
    }

    pub fn sent(&self) -> Vec<SentSms> {
        self.sent.to_vec()
    }
}

#[async_trait]
impl SmsProvider for RecordingSmsProvider {
    async fn send(&self, from: &str, to: &str, body: &str) -> Result<()> {
        info!(from = from, to = to, body = body, "SMS send");
        self.sent.push(SentSms {
            from: from.to_string(),
            to: to.to_string(),
            body: body.to_string(),
        });
        if self.failing.lock().contains(to) {
            return Err(NotificationError::sms(format!("delivery to {} failed", to)));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SentTemplate {
    pub template_name: String,
    pub message: Message,
    pub async_send: bool,
}

#[derive(Default)]
pub struct RecordingTemplateProvider {
    sent: History<SentTemplate>,
    unknown_templates: Mutex<HashSet<String>>,
}

impl RecordingTemplateProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_history_limit(limit: usize) -> Self {
        Self {
            sent: History::with_limit(limit),
            ..Self::default()
        }
    }

    /// Reject sends of `template_name` the way the provider rejects a
    /// missing template.
    pub fn reject_template(&self, template_name: &str) {
        self.unknown_templates
            .lock()
            .insert(template_name.to_string());
    }

    pub fn sent(&self) -> Vec<SentTemplate> {
        self.sent.to_vec()
    }
}

#[async_trait]
impl TemplateProvider for RecordingTemplateProvider {
    async fn send_message_template(
        &self,
        template_name: &str,
        _template_content: Option<&[Var]>,
        message: &Message,
        async_send: bool,
    ) -> Result<Vec<SendResult>> {
        info!(
            template = template_name,
            to = ?message.recipient_emails(),
            "Template email send"
        );
        if self.unknown_templates.lock().contains(template_name) {
            return Err(NotificationError::TemplateProvider {
                status: "error".to_string(),
                code: 5,
                name: "Unknown_Template".to_string(),
                message: format!("No such template \"{}\"", template_name),
            });
        }
        self.sent.push(SentTemplate {
            template_name: template_name.to_string(),
            message: message.clone(),
            async_send,
        });
        Ok(message
            .to
            .iter()
            .map(|recipient| SendResult {
                email: recipient.email.clone(),
                status: if async_send { "queued" } else { "sent" }.to_string(),
                reject_reason: None,
                id: None,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_sms_history_keeps_most_recent() {
        let provider = RecordingSmsProvider::with_history_limit(2);
        for to in ["+1", "+2", "+3"] {
            provider.send("+100", to, "hello").await.unwrap();
        }

        let numbers: Vec<String> = provider.sent().into_iter().map(|sms| sms.to).collect();
        assert_eq!(numbers, vec!["+2", "+3"]);
    }

    #[tokio::test]
    async fn test_push_history_is_bounded() {
        let provider = RecordingPushProvider::with_history_limit(3);
        for i in 0..10 {
            provider.publish(&format!("ep-{}", i), "{}").await.unwrap();
        }

        let endpoints: Vec<String> = provider
            .published()
            .into_iter()
            .map(|push| push.endpoint)
            .collect();
        assert_eq!(endpoints, vec!["ep-7", "ep-8", "ep-9"]);
    }

    #[tokio::test]
    async fn test_template_history_is_bounded() {
        let provider = RecordingTemplateProvider::with_history_limit(1);
        provider
            .send_message_template("first", None, &Message::default(), false)
            .await
            .unwrap();
        provider
            .send_message_template("second", None, &Message::default(), true)
            .await
            .unwrap();

        let sent = provider.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].template_name, "second");
    }
}
