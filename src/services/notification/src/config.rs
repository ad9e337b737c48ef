//! Configuration module for the notification service
//!
//! Static settings are loaded once at start from defaults, an optional file
//! and `NOTIFICATION__`-prefixed environment variables. Unknown keys are
//! rejected. The few settings operators change at runtime (whitelist,
//! campaign toggles) live in [`LiveConfig`] and are read as immutable
//! snapshots.

use crate::error::NotificationError;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use telehealth_shared::{Environment, Platform, ServerConfig};

/// Main configuration structure for the notification service
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DispatcherConfig {
    pub server: ServerConfig,
    pub environment: Environment,
    pub logging: LoggingConfig,
    pub dispatch: DispatchSettings,
    pub push: PushSettings,
    pub sms: SmsSettings,
    pub email: EmailSettings,
    pub campaigns: CampaignSettings,
    pub lock: LockSettings,
    /// Initial values for the runtime-adjustable settings
    pub runtime: RuntimeSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LoggingConfig {
    /// Default filter directive when `RUST_LOG` is unset
    pub level: String,
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DispatchSettings {
    /// Run asynchronous publishes inline on the publisher's task
    pub synchronous: bool,
}

// =============================================================================
// Push
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PushProviderKind {
    #[default]
    Log,
    Sns,
}

/// Shape of the value placed under the `GCM` key for Android devices
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AndroidPayloadStyle {
    /// `{"message": "..."}`
    #[default]
    Plain,
    /// `{"data": {"message": "...", "push_id": "..."}}`
    Structured,
}

/// Push application registered at the provider for one
/// (platform, app type, app environment) tuple.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NotificationConfig {
    pub platform: Platform,
    pub app_type: String,
    pub app_environment: String,
    /// Provider-side application endpoint used to create device endpoints
    pub application_endpoint: String,
    #[serde(default)]
    pub sandbox: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PushSettings {
    pub provider: PushProviderKind,
    pub timeout_seconds: u64,
    pub android_payload: AndroidPayloadStyle,
    pub aws_region: Option<String>,
    pub applications: Vec<NotificationConfig>,
}

impl Default for PushSettings {
    fn default() -> Self {
        Self {
            provider: PushProviderKind::Log,
            timeout_seconds: 10,
            android_payload: AndroidPayloadStyle::Plain,
            aws_region: None,
            applications: Vec::new(),
        }
    }
}

/// Lookup table over the configured push applications. App type and
/// environment match case-insensitively.
#[derive(Debug, Clone, Default)]
pub struct NotificationConfigs {
    by_key: HashMap<(Platform, String, String), NotificationConfig>,
}

impl NotificationConfigs {
    pub fn new(applications: &[NotificationConfig]) -> Self {
        let by_key = applications
            .iter()
            .map(|app| {
                (
                    Self::key(app.platform, &app.app_type, &app.app_environment),
                    app.clone(),
                )
            })
            .collect();
        Self { by_key }
    }

    fn key(platform: Platform, app_type: &str, app_environment: &str) -> (Platform, String, String) {
        (
            platform,
            app_type.to_ascii_lowercase(),
            app_environment.to_ascii_lowercase(),
        )
    }

    pub fn get(
        &self,
        platform: Platform,
        app_type: &str,
        app_environment: &str,
    ) -> Option<&NotificationConfig> {
        self.by_key
            .get(&Self::key(platform, app_type, app_environment))
    }

    pub fn len(&self) -> usize {
        self.by_key.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_key.is_empty()
    }
}

// =============================================================================
// SMS
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SmsProviderKind {
    #[default]
    Log,
    Twilio,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SmsSettings {
    pub enabled: bool,
    pub provider: SmsProviderKind,
    /// Sender number for every outgoing message
    pub from_number: String,
    pub timeout_seconds: u64,
    pub twilio: TwilioSettings,
}

impl Default for SmsSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            provider: SmsProviderKind::Log,
            from_number: "+15555550100".to_string(),
            timeout_seconds: 10,
            twilio: TwilioSettings::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TwilioSettings {
    pub account_sid: String,
    pub auth_token: String,
    pub base_url: String,
}

impl Default for TwilioSettings {
    fn default() -> Self {
        Self {
            account_sid: String::new(),
            auth_token: String::new(),
            base_url: "https://api.twilio.com".to_string(),
        }
    }
}

// =============================================================================
// Email
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmailProviderKind {
    #[default]
    Log,
    Mandrill,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EmailSettings {
    pub enabled: bool,
    pub provider: EmailProviderKind,
    pub timeout_seconds: u64,
    pub from_email: String,
    pub from_name: String,
    /// Destination of internal alerts such as unsuitable-visit notices
    pub support_email: String,
    pub mandrill: MandrillSettings,
}

impl Default for EmailSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            provider: EmailProviderKind::Log,
            timeout_seconds: 15,
            from_email: "noreply@telehealth.dev".to_string(),
            from_name: "Telehealth".to_string(),
            support_email: "support@telehealth.dev".to_string(),
            mandrill: MandrillSettings::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MandrillSettings {
    pub api_key: String,
    pub base_url: String,
    pub ip_pool: Option<String>,
}

impl Default for MandrillSettings {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            base_url: "https://mandrillapp.com/api/1.0".to_string(),
            ip_pool: None,
        }
    }
}

// =============================================================================
// Campaigns and lock
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CampaignSettings {
    pub enabled: bool,
    pub interval_seconds: u64,
    /// Host used for opt-out and parent-facing links
    pub web_domain: String,
    /// HMAC key for opt-out links. Links are omitted when empty.
    pub optout_signing_key: String,
}

impl Default for CampaignSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_seconds: 3600,
            web_domain: "www.telehealth.dev".to_string(),
            optout_signing_key: String::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockBackend {
    #[default]
    Local,
    Redis,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LockSettings {
    pub backend: LockBackend,
    pub redis_url: String,
    pub key: String,
    pub ttl_seconds: u64,
    pub retry_seconds: u64,
}

impl Default for LockSettings {
    fn default() -> Self {
        Self {
            backend: LockBackend::Local,
            redis_url: "redis://127.0.0.1:6379".to_string(),
            key: "notification:campaigns:lock".to_string(),
            ttl_seconds: 7200,
            retry_seconds: 30,
        }
    }
}

// =============================================================================
// Runtime-adjustable settings
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RuntimeSettings {
    /// Newline-separated regex list. Empty disables filtering.
    pub email_whitelist: String,
    pub welcome_email_enabled: bool,
    pub minor_treatment_plan_issued_email_enabled: bool,
    pub minor_triaged_email_enabled: bool,
    pub parent_welcome_email_enabled: bool,
    /// Age of an open visit before the reminder goes out. Zero disables.
    pub abandoned_visit_after_hours: u64,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            email_whitelist: String::new(),
            welcome_email_enabled: true,
            minor_treatment_plan_issued_email_enabled: true,
            minor_triaged_email_enabled: true,
            parent_welcome_email_enabled: true,
            abandoned_visit_after_hours: 7 * 24,
        }
    }
}

/// Longest accepted abandoned-visit delay (ten years)
pub const MAX_ABANDONED_VISIT_AFTER_HOURS: u64 = 10 * 365 * 24;

impl RuntimeSettings {
    pub fn abandoned_visit_after(&self) -> Option<chrono::Duration> {
        match self.abandoned_visit_after_hours.min(MAX_ABANDONED_VISIT_AFTER_HOURS) {
            0 => None,
            hours => Some(chrono::Duration::hours(hours as i64)),
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.abandoned_visit_after_hours > MAX_ABANDONED_VISIT_AFTER_HOURS {
            return Err(format!(
                "abandoned_visit_after_hours must be at most {}, got {}",
                MAX_ABANDONED_VISIT_AFTER_HOURS, self.abandoned_visit_after_hours
            ));
        }
        Ok(())
    }
}

/// Holder for the runtime settings. Readers take an `Arc` snapshot that
/// never changes under them; updates swap the pointer.
#[derive(Debug, Default)]
pub struct LiveConfig {
    current: RwLock<Arc<RuntimeSettings>>,
}

impl LiveConfig {
    pub fn new(initial: RuntimeSettings) -> Self {
        Self {
            current: RwLock::new(Arc::new(initial)),
        }
    }

    pub fn snapshot(&self) -> Arc<RuntimeSettings> {
        self.current.read().clone()
    }

    /// Apply `change` to a copy of the current settings and publish it.
    /// Invalid results are rejected and the current settings stay in place.
    pub fn update<F>(&self, change: F) -> crate::error::Result<()>
    where
        F: FnOnce(&mut RuntimeSettings),
    {
        let mut next = (*self.snapshot()).clone();
        change(&mut next);
        next.validate()
            .map_err(|message| NotificationError::validation("runtime", message))?;
        *self.current.write() = Arc::new(next);
        Ok(())
    }
}

// =============================================================================
// Loading and validation
// =============================================================================

impl DispatcherConfig {
    /// Load configuration from defaults, `NOTIFICATION_CONFIG_FILE` and
    /// environment variables such as `NOTIFICATION__SERVER__PORT`.
    pub fn from_env() -> Result<Self, config::ConfigError> {
        let file = std::env::var("NOTIFICATION_CONFIG_FILE").ok();
        Self::load(file.as_deref())
    }

    pub fn load(file: Option<&str>) -> Result<Self, config::ConfigError> {
        let mut cfg = config::Config::builder();

        // Start with default configuration
        cfg = cfg.add_source(config::Config::try_from(&DispatcherConfig::default())?);

        if let Some(path) = file {
            cfg = cfg.add_source(config::File::with_name(path).required(true));
        }

        cfg = cfg.add_source(
            config::Environment::with_prefix("NOTIFICATION")
                .separator("__")
                .try_parsing(true),
        );

        cfg.build()?.try_deserialize()
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.server.port == 0 {
            return Err("Server port must be greater than 0".to_string());
        }

        if self.push.timeout_seconds == 0
            || self.sms.timeout_seconds == 0
            || self.email.timeout_seconds == 0
        {
            return Err("Provider timeouts must be greater than 0".to_string());
        }

        let mut seen = std::collections::HashSet::new();
        for app in &self.push.applications {
            if app.application_endpoint.is_empty() {
                return Err(format!(
                    "Push application {} {} {} has no application endpoint",
                    app.platform, app.app_type, app.app_environment
                ));
            }
            let key = (
                app.platform,
                app.app_type.to_ascii_lowercase(),
                app.app_environment.to_ascii_lowercase(),
            );
            if !seen.insert(key) {
                return Err(format!(
                    "Push application {} {} {} is configured twice",
                    app.platform, app.app_type, app.app_environment
                ));
            }
        }

        if self.sms.enabled && self.sms.provider == SmsProviderKind::Twilio {
            let twilio = &self.sms.twilio;
            if twilio.account_sid.is_empty() || twilio.auth_token.is_empty() {
                return Err("Twilio credentials are required when SMS uses Twilio".to_string());
            }
        }

        if self.email.enabled {
            if self.email.from_email.is_empty() {
                return Err("From email is required when email is enabled".to_string());
            }
            if self.email.provider == EmailProviderKind::Mandrill
                && self.email.mandrill.api_key.is_empty()
            {
                return Err("Mandrill API key is required when email uses Mandrill".to_string());
            }
        }

        if self.campaigns.enabled && self.campaigns.interval_seconds == 0 {
            return Err("Campaign interval must be greater than 0".to_string());
        }

        if self.lock.backend == LockBackend::Redis && self.lock.redis_url.is_empty() {
            return Err("Redis URL is required for the redis lock backend".to_string());
        }

        self.runtime.validate()
    }

    /// Get timeout duration for a provider operation
    pub fn get_timeout(&self, operation: &str) -> Duration {
        match operation {
            "push" => Duration::from_secs(self.push.timeout_seconds),
            "sms" => Duration::from_secs(self.sms.timeout_seconds),
            "email" => Duration::from_secs(self.email.timeout_seconds),
            _ => Duration::from_secs(self.server.timeout_seconds),
        }
    }

    pub fn notification_configs(&self) -> NotificationConfigs {
        NotificationConfigs::new(&self.push.applications)
    }
}
