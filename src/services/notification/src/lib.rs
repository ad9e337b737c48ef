//! # Notification Service
//!
//! Multi-channel user notification dispatcher for the telehealth platform:
//! - In-process event bus carrying domain events
//! - One view per event kind rendering push, SMS and email content
//! - Device registry with push endpoint provisioning
//! - Preference-driven channel selection with email fallback
//! - Push fan-out across devices, SMS, and templated email with whitelist,
//!   opt-out and once-only filtering
//! - Lock-gated email campaigns and event-driven campaign listeners
//!
//! ## Usage
//!
//! ```rust,no_run
//! use notification_service::{DispatcherConfig, MemoryDirectory, NotificationService};
//! use std::sync::Arc;
//! use telehealth_shared::events::CaseAssigned;
//! use telehealth_shared::DomainEvent;
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = DispatcherConfig::from_env()?;
//!     let directory = Arc::new(MemoryDirectory::new());
//!     let service = NotificationService::new(config, directory, CancellationToken::new()).await?;
//!
//!     service
//!         .publish(DomainEvent::CaseAssigned(CaseAssigned { case_id: 1, doctor_id: 2 }))
//!         .await;
//!     Ok(())
//! }
//! ```

use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

pub mod campaigns;
pub mod channels;
pub mod config;
pub mod devices;
pub mod directory;
pub mod dispatch;
pub mod error;
pub mod handlers;
pub mod lock;
pub mod manager;
pub mod memory;
pub mod metrics;
pub mod preferences;
pub mod providers;
pub mod routes;
pub mod views;

pub use campaigns::{AbandonedVisit, Campaign, CampaignInfo, CampaignListeners, CampaignRunner};
pub use channels::{ChannelInfo, EmailOptions, EmailSender, PushSender, SmsSender};
pub use config::{DispatcherConfig, LiveConfig, NotificationConfig, RuntimeSettings};
pub use devices::{DeviceHeaders, DeviceRegistry};
pub use directory::{Directory, Person, PushConfig};
pub use dispatch::{Dispatcher, EventHandler};
pub use error::{NotificationError, Result};
pub use lock::{LocalLock, Lock, RedisLock};
pub use manager::{Delivery, NotificationManager};
pub use memory::{AccountRecord, MemoryDirectory};
pub use metrics::{DispatchMetrics, MetricsSnapshot};
pub use views::ViewRegistry;

use config::{EmailProviderKind, PushProviderKind, SmsProviderKind};
use providers::{
    MandrillClient, PushProvider, RecordingPushProvider, RecordingSmsProvider,
    RecordingTemplateProvider, SmsProvider, TemplateProvider, TwilioClient,
};

/// The three outbound provider ports
#[derive(Clone)]
pub struct Providers {
    pub push: Arc<dyn PushProvider>,
    pub sms: Arc<dyn SmsProvider>,
    pub templates: Arc<dyn TemplateProvider>,
}

impl Providers {
    /// Providers that only log and record
    pub fn recording() -> Self {
        Self {
            push: Arc::new(RecordingPushProvider::new()),
            sms: Arc::new(RecordingSmsProvider::new()),
            templates: Arc::new(RecordingTemplateProvider::new()),
        }
    }

    /// Build the providers selected in `config`.
    pub async fn from_config(config: &DispatcherConfig) -> Result<Self> {
        let push: Arc<dyn PushProvider> = match config.push.provider {
            PushProviderKind::Log => Arc::new(RecordingPushProvider::new()),
            #[cfg(feature = "sns")]
            PushProviderKind::Sns => Arc::new(
                providers::sns::SnsPushProvider::new(config.push.aws_region.as_deref()).await,
            ),
            #[cfg(not(feature = "sns"))]
            PushProviderKind::Sns => {
                return Err(NotificationError::config(
                    "push provider sns requires the `sns` feature",
                ))
            }
        };

        let sms: Arc<dyn SmsProvider> = match config.sms.provider {
            SmsProviderKind::Log => Arc::new(RecordingSmsProvider::new()),
            SmsProviderKind::Twilio => Arc::new(TwilioClient::new(
                &config.sms.twilio,
                config.get_timeout("sms"),
            )?),
        };

        let templates: Arc<dyn TemplateProvider> = match config.email.provider {
            EmailProviderKind::Log => Arc::new(RecordingTemplateProvider::new()),
            EmailProviderKind::Mandrill => Arc::new(MandrillClient::new(
                &config.email.mandrill,
                config.get_timeout("email"),
            )?),
        };

        Ok(Self {
            push,
            sms,
            templates,
        })
    }
}

/// Fully wired dispatcher: bus, registry, senders, manager and campaigns
#[derive(Clone)]
pub struct NotificationService {
    config: Arc<DispatcherConfig>,
    live: Arc<LiveConfig>,
    directory: Arc<dyn Directory>,
    dispatcher: Arc<Dispatcher>,
    devices: Arc<DeviceRegistry>,
    push: Arc<PushSender>,
    sms: Arc<SmsSender>,
    email: Arc<EmailSender>,
    manager: Arc<NotificationManager>,
    campaigns: Arc<CampaignRunner>,
    metrics: DispatchMetrics,
}

impl NotificationService {
    /// Build the service with the providers and lock selected in `config`.
    pub async fn new(
        config: DispatcherConfig,
        directory: Arc<dyn Directory>,
        cancel: CancellationToken,
    ) -> Result<Self> {
        let providers = Providers::from_config(&config).await?;
        let lock = lock::from_settings(&config.lock, cancel).await?;
        Self::with_parts(config, directory, providers, lock)
    }

    /// Build the service around explicit providers and lock.
    pub fn with_parts(
        config: DispatcherConfig,
        directory: Arc<dyn Directory>,
        providers: Providers,
        lock: Arc<dyn Lock>,
    ) -> Result<Self> {
        info!(environment = %config.environment, "Initializing notification service");

        let metrics = DispatchMetrics::new()?;
        let live = Arc::new(LiveConfig::new(config.runtime.clone()));
        let dispatcher = Arc::new(if config.dispatch.synchronous {
            Dispatcher::synchronous()
        } else {
            Dispatcher::new()
        });
        let configs = config.notification_configs();

        let devices = Arc::new(DeviceRegistry::new(
            directory.clone(),
            providers.push.clone(),
            configs.clone(),
            config.get_timeout("push"),
        ));

        let push = Arc::new(
            PushSender::new(
                directory.clone(),
                providers.push,
                configs,
                config.push.android_payload,
                config.get_timeout("push"),
                metrics.clone(),
            )
            .with_provider_name(&provider_name(&config.push.provider)),
        );

        let mut sms = SmsSender::new(
            directory.clone(),
            providers.sms,
            &config.sms.from_number,
            config.get_timeout("sms"),
            metrics.clone(),
        )
        .with_provider_name(&provider_name(&config.sms.provider));
        if !config.sms.enabled {
            sms = sms.disabled();
        }
        let sms = Arc::new(sms);

        let email = Arc::new(EmailSender::new(
            directory.clone(),
            providers.templates,
            live.clone(),
            dispatcher.clone(),
            config.environment,
            &config.email,
            metrics.clone(),
        ));

        let manager = Arc::new(NotificationManager::new(
            directory.clone(),
            ViewRegistry::builtin()?,
            push.clone(),
            sms.clone(),
            email.clone(),
            dispatcher.clone(),
        ));
        manager.register();

        let listeners = Arc::new(CampaignListeners::new(
            directory.clone(),
            email.clone(),
            live.clone(),
            &config.campaigns.web_domain,
        ));
        listeners.register(&dispatcher);

        let mut runner = CampaignRunner::new(
            directory.clone(),
            email.clone(),
            live.clone(),
            lock,
            &config.campaigns,
            metrics.clone(),
        );
        runner.register(Arc::new(AbandonedVisit::new(directory.clone())));

        Ok(Self {
            config: Arc::new(config),
            live,
            directory,
            dispatcher,
            devices,
            push,
            sms,
            email,
            manager,
            campaigns: Arc::new(runner),
            metrics,
        })
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    pub fn live(&self) -> &Arc<LiveConfig> {
        &self.live
    }

    pub fn directory(&self) -> &Arc<dyn Directory> {
        &self.directory
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn devices(&self) -> &Arc<DeviceRegistry> {
        &self.devices
    }

    pub fn email(&self) -> &Arc<EmailSender> {
        &self.email
    }

    pub fn manager(&self) -> &Arc<NotificationManager> {
        &self.manager
    }

    pub fn campaigns(&self) -> &Arc<CampaignRunner> {
        &self.campaigns
    }

    pub fn metrics(&self) -> &DispatchMetrics {
        &self.metrics
    }

    pub fn channel_info(&self) -> Vec<ChannelInfo> {
        vec![
            self.push.channel_info(),
            self.sms.channel_info(),
            self.email.channel_info(),
        ]
    }

    /// Publish a domain event without waiting for its handlers.
    pub async fn publish(&self, event: telehealth_shared::DomainEvent) {
        self.dispatcher.publish_async(event).await;
    }

    /// Start the campaign loop unless campaigns are disabled.
    pub fn start_campaigns(&self, cancel: CancellationToken) -> Option<JoinHandle<()>> {
        if !self.config.campaigns.enabled {
            info!("Campaigns disabled");
            return None;
        }
        Some(self.campaigns.clone().start(cancel))
    }
}

fn provider_name<T: std::fmt::Debug>(kind: &T) -> String {
    format!("{:?}", kind).to_lowercase()
}
