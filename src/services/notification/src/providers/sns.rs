//! Amazon SNS push provider

use super::PushProvider;
use crate::error::{NotificationError, Result};
use async_trait::async_trait;
use aws_sdk_sns::config::Region;
use aws_sdk_sns::Client;
use tracing::{debug, info};

pub struct SnsPushProvider {
    client: Client,
}

impl SnsPushProvider {
    pub async fn new(region: Option<&str>) -> Self {
        info!("Initializing SNS push provider");

        let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest());
        if let Some(region) = region {
            loader = loader.region(Region::new(region.to_string()));
        }
        let shared = loader.load().await;
        Self {
            client: Client::new(&shared),
        }
    }
}

#[async_trait]
impl PushProvider for SnsPushProvider {
    async fn create_platform_endpoint(
        &self,
        application_endpoint: &str,
        device_token: &str,
    ) -> Result<String> {
        let output = self
            .client
            .create_platform_endpoint()
            .platform_application_arn(application_endpoint)
            .token(device_token)
            .send()
            .await
            .map_err(|e| NotificationError::push(format!("CreatePlatformEndpoint failed: {}", e)))?;

        output
            .endpoint_arn()
            .map(str::to_string)
            .ok_or_else(|| NotificationError::push("CreatePlatformEndpoint returned no endpoint"))
    }

    async fn publish(&self, endpoint: &str, payload: &str) -> Result<()> {
        debug!(endpoint = endpoint, "Publishing to SNS");
        self.client
            .publish()
            .target_arn(endpoint)
            .message(payload)
            .message_structure("json")
            .send()
            .await
            .map(|_| ())
            .map_err(|e| {
                let disabled = e
                    .as_service_error()
                    .map(|service| service.is_endpoint_disabled_exception())
                    .unwrap_or(false);
                if disabled {
                    NotificationError::EndpointDisabled {
                        endpoint: endpoint.to_string(),
                    }
                } else {
                    NotificationError::push(format!("Publish failed: {}", e))
                }
            })
    }
}
