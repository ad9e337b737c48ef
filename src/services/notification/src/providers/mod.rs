//! Outbound provider ports
//!
//! The senders talk to push, SMS and email-template providers only through
//! these traits. Concrete adapters: Amazon SNS for push (feature `sns`),
//! Twilio for SMS, Mandrill for templated email, and recording providers
//! that log and keep every call for local runs and tests.

use crate::error::Result;
use async_trait::async_trait;

pub mod mandrill;
pub mod recording;
#[cfg(feature = "sns")]
pub mod sns;
pub mod twilio;

pub use mandrill::{
    Attachment, MandrillClient, MergeVar, Message, ProviderErrorBody, Recipient, RecipientType,
    SendResult, Var,
};
pub use recording::{RecordingPushProvider, RecordingSmsProvider, RecordingTemplateProvider};
pub use twilio::TwilioClient;

#[async_trait]
pub trait PushProvider: Send + Sync {
    /// Register a device token against a platform application and return
    /// the endpoint to publish to.
    async fn create_platform_endpoint(
        &self,
        application_endpoint: &str,
        device_token: &str,
    ) -> Result<String>;

    /// Publish a multi-target JSON payload. A disabled endpoint is reported
    /// as `NotificationError::EndpointDisabled`.
    async fn publish(&self, endpoint: &str, payload: &str) -> Result<()>;
}

#[async_trait]
pub trait SmsProvider: Send + Sync {
    async fn send(&self, from: &str, to: &str, body: &str) -> Result<()>;
}

#[async_trait]
pub trait TemplateProvider: Send + Sync {
    async fn send_message_template(
        &self,
        template_name: &str,
        template_content: Option<&[Var]>,
        message: &Message,
        async_send: bool,
    ) -> Result<Vec<SendResult>>;
}
