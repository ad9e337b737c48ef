//! Device registry
//!
//! Maps device tokens to accounts and provider endpoints. A token belongs to
//! at most one account: registering it for a new account detaches it from
//! the previous one, and an account left without devices loses its push
//! preference.

use crate::config::NotificationConfigs;
use crate::directory::{Directory, PushConfig};
use crate::error::{NotificationError, Result};
use crate::providers::PushProvider;
use chrono::Utc;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use telehealth_shared::{
    AccountId, Channel, ClientDevice, ClientOs, ClientVersion, PromptStatus,
};
use tracing::{debug, info};

/// Device metadata from the client's request headers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceHeaders {
    pub version: ClientVersion,
    pub os: ClientOs,
    pub device: ClientDevice,
    pub device_id: String,
}

impl DeviceHeaders {
    /// Parse the raw header values. Every header is mandatory.
    pub fn parse(
        version: Option<&str>,
        os: Option<&str>,
        device: Option<&str>,
        device_id: Option<&str>,
    ) -> Result<Self> {
        fn required<'a>(value: Option<&'a str>, name: &str) -> Result<&'a str> {
            value
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .ok_or_else(|| NotificationError::validation(name, "header is required"))
        }

        Ok(Self {
            version: required(version, "S-Version")?.parse()?,
            os: required(os, "S-OS")?.parse()?,
            device: required(device, "S-Device")?.parse()?,
            device_id: required(device_id, "S-Device-ID")?.to_string(),
        })
    }
}

pub struct DeviceRegistry {
    directory: Arc<dyn Directory>,
    provider: Arc<dyn PushProvider>,
    configs: NotificationConfigs,
    timeout: Duration,
}

impl DeviceRegistry {
    pub fn new(
        directory: Arc<dyn Directory>,
        provider: Arc<dyn PushProvider>,
        configs: NotificationConfigs,
        timeout: Duration,
    ) -> Self {
        info!(applications = configs.len(), "Initializing device registry");
        Self {
            directory,
            provider,
            configs,
            timeout,
        }
    }

    /// Register `device_token` for `account`, provisioning a provider
    /// endpoint when the token is new, changes hands, or moves to another
    /// application. Metadata-only changes keep the existing endpoint.
    pub async fn register(
        &self,
        account: AccountId,
        headers: &DeviceHeaders,
        device_token: &str,
    ) -> Result<PushConfig> {
        let device_token = device_token.trim();
        if device_token.is_empty() {
            return Err(NotificationError::validation(
                "device_token",
                "device token is required",
            ));
        }

        let platform = headers.os.platform;
        let app_type = &headers.version.app_type;
        let app_environment = &headers.version.app_environment;
        let app = self
            .configs
            .get(platform, app_type, app_environment)
            .ok_or_else(|| NotificationError::UnknownNotificationConfig {
                platform,
                app_type: app_type.clone(),
                app_environment: app_environment.clone(),
            })?;

        let existing = self.directory.push_config_for_token(device_token).await?;
        let reusable = existing.as_ref().filter(|row| {
            row.account_id == account
                && row.platform == platform
                && row.app_type.eq_ignore_ascii_case(app_type)
                && row.app_environment.eq_ignore_ascii_case(app_environment)
                && !row.push_endpoint.is_empty()
        });

        let push_endpoint = match reusable {
            Some(row) => row.push_endpoint.clone(),
            None => {
                debug!(
                    account_id = %account,
                    platform = %platform,
                    "Provisioning push endpoint"
                );
                tokio::time::timeout(
                    self.timeout,
                    self.provider
                        .create_platform_endpoint(&app.application_endpoint, device_token),
                )
                .await??
            }
        };

        let created = reusable.map(|row| row.created).unwrap_or_else(Utc::now);
        let config = PushConfig {
            device_token: device_token.to_string(),
            account_id: account,
            push_endpoint,
            platform,
            platform_version: headers.os.version.clone(),
            app_type: app_type.clone(),
            app_environment: app_environment.clone(),
            app_version: headers.version.version.clone(),
            device: headers.device.form.clone(),
            device_model: headers.device.model.clone(),
            device_id: headers.device_id.clone(),
            created,
        };

        self.set_or_replace(&config).await?;
        Ok(config)
    }

    /// Upsert by device token, detaching the token from any previous owner.
    pub async fn set_or_replace(&self, config: &PushConfig) -> Result<()> {
        if let Some(previous) = self
            .directory
            .push_config_for_token(&config.device_token)
            .await?
        {
            if previous.account_id != config.account_id {
                info!(
                    from = %previous.account_id,
                    to = %config.account_id,
                    "Device token changed accounts"
                );
                self.directory
                    .delete_push_config(&config.device_token)
                    .await?;
                self.clear_preference_if_deviceless(previous.account_id)
                    .await?;
            }
        }

        self.directory.upsert_push_config(config).await?;
        self.directory
            .set_communication_preference(config.account_id, Channel::Push)
            .await
    }

    pub async fn for_account(&self, account: AccountId) -> Result<Vec<PushConfig>> {
        self.directory.push_configs_for_account(account).await
    }

    /// Logout: drop every device and the push preference.
    pub async fn remove_all_for_account(&self, account: AccountId) -> Result<usize> {
        let removed = self
            .directory
            .delete_push_configs_for_account(account)
            .await?;
        self.directory
            .delete_communication_preference(account, Channel::Push)
            .await?;
        info!(account_id = %account, removed = removed, "Removed devices for account");
        Ok(removed)
    }

    /// Drop every row registered from a physical device.
    pub async fn remove_for_device_id(&self, device_id: &str) -> Result<usize> {
        let removed = self
            .directory
            .delete_push_configs_for_device_id(device_id)
            .await?;
        let accounts: BTreeSet<AccountId> = removed.iter().map(|row| row.account_id).collect();
        for account in accounts {
            self.clear_preference_if_deviceless(account).await?;
        }
        Ok(removed.len())
    }

    pub async fn set_prompt_status(&self, account: AccountId, status: PromptStatus) -> Result<()> {
        self.directory.set_push_prompt_status(account, status).await
    }

    async fn clear_preference_if_deviceless(&self, account: AccountId) -> Result<()> {
        clear_push_preference_if_deviceless(self.directory.as_ref(), account).await
    }
}

/// Drop the Push preference once `account` has no devices left, so channel
/// resolution falls through to SMS or email.
pub(crate) async fn clear_push_preference_if_deviceless(
    directory: &dyn Directory,
    account: AccountId,
) -> Result<()> {
    if directory.push_configs_for_account(account).await?.is_empty() {
        directory
            .delete_communication_preference(account, Channel::Push)
            .await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NotificationConfig;
    use crate::memory::MemoryDirectory;
    use crate::providers::RecordingPushProvider;
    use pretty_assertions::assert_eq;
    use telehealth_shared::Platform;

    struct Fixture {
        directory: Arc<MemoryDirectory>,
        provider: Arc<RecordingPushProvider>,
        registry: DeviceRegistry,
    }

    fn fixture() -> Fixture {
        let directory = Arc::new(MemoryDirectory::new());
        let provider = Arc::new(RecordingPushProvider::new());
        let configs = NotificationConfigs::new(&[NotificationConfig {
            platform: Platform::Ios,
            app_type: "Patient".to_string(),
            app_environment: "Feature".to_string(),
            application_endpoint: "arn:app/APNS/patient".to_string(),
            sandbox: true,
        }]);
        let registry = DeviceRegistry::new(
            directory.clone(),
            provider.clone(),
            configs,
            Duration::from_secs(1),
        );
        Fixture {
            directory,
            provider,
            registry,
        }
    }

    fn headers(version: &str) -> DeviceHeaders {
        DeviceHeaders::parse(
            Some(version),
            Some("iOS;7.1.1"),
            Some("Phone;iPhone6,1;640;1136;2.0"),
            Some("12345678-1234-1234-1234-123456789abc"),
        )
        .unwrap()
    }

    #[test]
    fn test_missing_header_is_validation_error() {
        let err = DeviceHeaders::parse(Some("Patient;Feature;0.9.0;000105"), None, Some("Phone"), Some("id"))
            .unwrap_err();
        assert_eq!(err.error_code(), "VALIDATION_ERROR");
    }

    #[tokio::test]
    async fn test_register_provisions_endpoint_and_sets_preference() {
        let f = fixture();
        f.provider.queue_endpoint("ep1");

        let row = f
            .registry
            .register(AccountId(1), &headers("Patient;Feature;0.9.0;000105"), "abc")
            .await
            .unwrap();

        assert_eq!(row.push_endpoint, "ep1");
        let devices = f.registry.for_account(AccountId(1)).await.unwrap();
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].device_token, "abc");
        assert_eq!(devices[0].push_endpoint, "ep1");
        assert_eq!(
            f.directory.communication_preferences(AccountId(1)).await.unwrap(),
            vec![Channel::Push]
        );
    }

    #[tokio::test]
    async fn test_same_token_twice_keeps_one_row_and_endpoint() {
        let f = fixture();
        f.registry
            .register(AccountId(1), &headers("Patient;Feature;0.9.0;000105"), "abc")
            .await
            .unwrap();
        let first_endpoint = f.registry.for_account(AccountId(1)).await.unwrap()[0]
            .push_endpoint
            .clone();

        let row = f
            .registry
            .register(AccountId(1), &headers("Patient;Feature;0.9.1;000106"), "abc")
            .await
            .unwrap();

        assert_eq!(f.registry.for_account(AccountId(1)).await.unwrap().len(), 1);
        assert_eq!(row.push_endpoint, first_endpoint);
        assert_eq!(row.app_version, "0.9.1");
        assert_eq!(f.provider.created().len(), 1);
    }

    #[tokio::test]
    async fn test_different_token_adds_second_row() {
        let f = fixture();
        let h = headers("Patient;Feature;0.9.0;000105");
        f.registry.register(AccountId(1), &h, "abc").await.unwrap();
        f.registry.register(AccountId(1), &h, "def").await.unwrap();
        assert_eq!(f.registry.for_account(AccountId(1)).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_unknown_notification_config() {
        let f = fixture();
        let err = f
            .registry
            .register(AccountId(1), &headers("Patient;Demo;0.9.0;000105"), "abc")
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "UNKNOWN_NOTIFICATION_CONFIG");
        assert!(f.provider.created().is_empty());
    }

    #[tokio::test]
    async fn test_empty_token_rejected() {
        let f = fixture();
        let err = f
            .registry
            .register(AccountId(1), &headers("Patient;Feature;0.9.0;000105"), "  ")
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "VALIDATION_ERROR");
    }

    #[tokio::test]
    async fn test_token_moves_to_last_registering_account() {
        let f = fixture();
        let h = headers("Patient;Feature;0.9.0;000105");
        for account in 1..=4 {
            f.registry
                .register(AccountId(account), &h, "shared-token")
                .await
                .unwrap();
        }

        for account in 1..=3 {
            assert!(f.registry.for_account(AccountId(account)).await.unwrap().is_empty());
            assert!(f
                .directory
                .communication_preferences(AccountId(account))
                .await
                .unwrap()
                .is_empty());
        }
        assert_eq!(f.registry.for_account(AccountId(4)).await.unwrap().len(), 1);
        // Each change of owner provisions a fresh endpoint
        assert_eq!(f.provider.created().len(), 4);
    }

    #[tokio::test]
    async fn test_logout_clears_devices_and_preference() {
        let f = fixture();
        let h = headers("Patient;Feature;0.9.0;000105");
        f.registry.register(AccountId(1), &h, "abc").await.unwrap();
        f.registry.register(AccountId(1), &h, "def").await.unwrap();

        assert_eq!(f.registry.remove_all_for_account(AccountId(1)).await.unwrap(), 2);
        assert!(f.registry.for_account(AccountId(1)).await.unwrap().is_empty());
        assert!(f
            .directory
            .communication_preferences(AccountId(1))
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_remove_for_device_id() {
        let f = fixture();
        let h = headers("Patient;Feature;0.9.0;000105");
        f.registry.register(AccountId(1), &h, "abc").await.unwrap();

        let removed = f
            .registry
            .remove_for_device_id("12345678-1234-1234-1234-123456789abc")
            .await
            .unwrap();
        assert_eq!(removed, 1);
        assert!(f
            .directory
            .communication_preferences(AccountId(1))
            .await
            .unwrap()
            .is_empty());
    }
}
