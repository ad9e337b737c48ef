//! Push fan-out across an account's devices

use crate::channels::ChannelInfo;
use crate::config::{AndroidPayloadStyle, NotificationConfig, NotificationConfigs};
use crate::devices::clear_push_preference_if_deviceless;
use crate::directory::{Directory, PushConfig};
use crate::error::{NotificationError, Result};
use crate::metrics::DispatchMetrics;
use crate::providers::PushProvider;
use crate::views::PushMessage;
use futures::future::join_all;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use telehealth_shared::{AccountId, Platform, Role};
use tracing::{debug, info, warn};

/// Per-platform content for one device
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlatformEnvelope {
    Ios {
        alert: String,
        badge: i64,
        sandbox: bool,
    },
    Android {
        message: String,
        /// Present only for the structured style
        push_id: Option<String>,
    },
}

#[derive(Serialize)]
struct IosAlert<'a> {
    alert: &'a str,
    badge: i64,
}

#[derive(Serialize)]
struct AndroidPlain<'a> {
    message: &'a str,
}

#[derive(Serialize)]
struct AndroidData<'a> {
    message: &'a str,
    push_id: &'a str,
}

#[derive(Serialize)]
struct AndroidStructured<'a> {
    data: AndroidData<'a>,
}

/// Multi-target payload; each platform value is itself a JSON string.
#[derive(Serialize)]
struct ProviderPayload<'a> {
    default: &'a str,
    #[serde(rename = "APNS", skip_serializing_if = "Option::is_none")]
    apns: Option<String>,
    #[serde(rename = "APNS_SANDBOX", skip_serializing_if = "Option::is_none")]
    apns_sandbox: Option<String>,
    #[serde(rename = "GCM", skip_serializing_if = "Option::is_none")]
    gcm: Option<String>,
}

impl PlatformEnvelope {
    pub fn for_device(
        config: &NotificationConfig,
        message: &PushMessage,
        badge: i64,
        style: AndroidPayloadStyle,
    ) -> Self {
        match config.platform {
            Platform::Ios => PlatformEnvelope::Ios {
                alert: message.short_message.clone(),
                badge,
                sandbox: config.sandbox,
            },
            Platform::Android => PlatformEnvelope::Android {
                message: message.short_message.clone(),
                push_id: match style {
                    AndroidPayloadStyle::Plain => None,
                    AndroidPayloadStyle::Structured => Some(uuid::Uuid::new_v4().to_string()),
                },
            },
        }
    }

    /// Serialize into the provider's multi-target JSON document.
    pub fn to_payload(&self, default: &str) -> Result<String> {
        let mut payload = ProviderPayload {
            default,
            apns: None,
            apns_sandbox: None,
            gcm: None,
        };
        match self {
            PlatformEnvelope::Ios {
                alert,
                badge,
                sandbox,
            } => {
                let body = serde_json::to_string(&IosAlert {
                    alert,
                    badge: *badge,
                })?;
                if *sandbox {
                    payload.apns_sandbox = Some(body);
                } else {
                    payload.apns = Some(body);
                }
            }
            PlatformEnvelope::Android {
                message,
                push_id: None,
            } => {
                payload.gcm = Some(serde_json::to_string(&AndroidPlain { message })?);
            }
            PlatformEnvelope::Android {
                message,
                push_id: Some(push_id),
            } => {
                payload.gcm = Some(serde_json::to_string(&AndroidStructured {
                    data: AndroidData { message, push_id },
                })?);
            }
        }
        Ok(serde_json::to_string(&payload)?)
    }
}

/// Outcome of one fan-out
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PushReport {
    pub devices: usize,
    pub sent: usize,
    pub failed: usize,
    /// Devices removed because the provider disabled their endpoint
    pub pruned: usize,
}

enum DeviceOutcome {
    Sent,
    Failed,
    Pruned,
}

pub struct PushSender {
    directory: Arc<dyn Directory>,
    provider: Arc<dyn PushProvider>,
    configs: NotificationConfigs,
    android_style: AndroidPayloadStyle,
    timeout: Duration,
    metrics: DispatchMetrics,
    provider_name: String,
}

impl PushSender {
    pub fn new(
        directory: Arc<dyn Directory>,
        provider: Arc<dyn PushProvider>,
        configs: NotificationConfigs,
        android_style: AndroidPayloadStyle,
        timeout: Duration,
        metrics: DispatchMetrics,
    ) -> Self {
        info!("Initializing push channel");
        Self {
            directory,
            provider,
            configs,
            android_style,
            timeout,
            metrics,
            provider_name: "push".to_string(),
        }
    }

    pub fn with_provider_name(mut self, name: &str) -> Self {
        self.provider_name = name.to_string();
        self
    }

    pub fn channel_info(&self) -> ChannelInfo {
        ChannelInfo {
            name: "push".to_string(),
            provider: self.provider_name.clone(),
            enabled: !self.configs.is_empty(),
            timeout_seconds: self.timeout.as_secs(),
        }
    }

    /// Deliver `message` to every device of `account`. Device failures are
    /// counted and never abort the siblings.
    pub async fn send(
        &self,
        account: AccountId,
        role: Role,
        message: &PushMessage,
        badge: i64,
    ) -> Result<PushReport> {
        let devices = self.directory.push_configs_for_account(account).await?;
        if devices.is_empty() {
            debug!(account_id = %account, "No devices registered");
            return Ok(PushReport::default());
        }

        debug!(
            account_id = %account,
            role = %role,
            devices = devices.len(),
            "Sending push"
        );

        let outcomes = join_all(
            devices
                .iter()
                .map(|device| self.send_to_device(device, message, badge)),
        )
        .await;

        let mut report = PushReport {
            devices: devices.len(),
            ..Default::default()
        };
        for outcome in outcomes {
            match outcome {
                DeviceOutcome::Sent => report.sent += 1,
                DeviceOutcome::Failed => report.failed += 1,
                DeviceOutcome::Pruned => {
                    report.failed += 1;
                    report.pruned += 1;
                }
            }
        }

        if report.pruned > 0 {
            clear_push_preference_if_deviceless(self.directory.as_ref(), account).await?;
        }
        Ok(report)
    }

    async fn send_to_device(
        &self,
        device: &PushConfig,
        message: &PushMessage,
        badge: i64,
    ) -> DeviceOutcome {
        let Some(config) =
            self.configs
                .get(device.platform, &device.app_type, &device.app_environment)
        else {
            warn!(
                account_id = %device.account_id,
                platform = %device.platform,
                app_type = %device.app_type,
                app_environment = %device.app_environment,
                "No notification config for device"
            );
            self.metrics.push_failed.inc();
            return DeviceOutcome::Failed;
        };

        let envelope = PlatformEnvelope::for_device(config, message, badge, self.android_style);
        let payload = match envelope.to_payload(&message.short_message) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(error = %e, "Failed to encode push payload");
                self.metrics.push_failed.inc();
                return DeviceOutcome::Failed;
            }
        };

        let result = match tokio::time::timeout(
            self.timeout,
            self.provider.publish(&device.push_endpoint, &payload),
        )
        .await
        {
            Ok(result) => result,
            Err(elapsed) => Err(elapsed.into()),
        };

        match result {
            Ok(()) => {
                self.metrics.push_sent.inc();
                DeviceOutcome::Sent
            }
            Err(NotificationError::EndpointDisabled { endpoint }) => {
                self.metrics.push_failed.inc();
                warn!(
                    account_id = %device.account_id,
                    endpoint = %endpoint,
                    "Push endpoint disabled, removing device"
                );
                match self.directory.delete_push_config(&device.device_token).await {
                    Ok(_) => {
                        self.metrics.push_endpoint_pruned.inc();
                        DeviceOutcome::Pruned
                    }
                    Err(e) => {
                        warn!(error = %e, "Failed to remove disabled device");
                        DeviceOutcome::Failed
                    }
                }
            }
            Err(e) => {
                self.metrics.push_failed.inc();
                warn!(
                    account_id = %device.account_id,
                    endpoint = %device.push_endpoint,
                    error = %e,
                    "Push publish failed"
                );
                DeviceOutcome::Failed
            }
        }
    }
}
