//! Shared fixture for integration tests: an in-memory directory, recording
//! providers and a synchronous bus.

#![allow(dead_code)]

use chrono::Utc;
use notification_service::dispatch::Recorder;
use notification_service::providers::{
    RecordingPushProvider, RecordingSmsProvider, RecordingTemplateProvider,
};
use notification_service::{
    DispatcherConfig, LocalLock, MemoryDirectory, NotificationConfig, NotificationService,
    Providers, PushConfig,
};
use std::sync::Arc;
use telehealth_shared::{AccountId, Environment, EventKind, Platform};
use tokio_util::sync::CancellationToken;

pub struct Harness {
    pub directory: Arc<MemoryDirectory>,
    pub push: Arc<RecordingPushProvider>,
    pub sms: Arc<RecordingSmsProvider>,
    pub templates: Arc<RecordingTemplateProvider>,
    pub sends: Arc<Recorder>,
    pub service: NotificationService,
}

fn app(platform: Platform, app_type: &str, env: &str, sandbox: bool) -> NotificationConfig {
    NotificationConfig {
        platform,
        app_type: app_type.to_string(),
        app_environment: env.to_string(),
        application_endpoint: format!("arn:{}:{}:{}", platform, app_type, env),
        sandbox,
    }
}

pub fn harness() -> Harness {
    harness_with(|_| {})
}

pub fn harness_with(customize: impl FnOnce(&mut DispatcherConfig)) -> Harness {
    let mut config = DispatcherConfig::default();
    config.environment = Environment::Test;
    config.dispatch.synchronous = true;
    config.campaigns.optout_signing_key = "test-signing-key".to_string();
    config.push.applications = vec![
        app(Platform::Ios, "patient", "prod", false),
        app(Platform::Ios, "patient", "dev", true),
        app(Platform::Android, "patient", "staging", false),
        app(Platform::Ios, "doctor", "prod", false),
    ];
    customize(&mut config);

    let directory = Arc::new(MemoryDirectory::new());
    let push = Arc::new(RecordingPushProvider::new());
    let sms = Arc::new(RecordingSmsProvider::new());
    let templates = Arc::new(RecordingTemplateProvider::new());
    let providers = Providers {
        push: push.clone(),
        sms: sms.clone(),
        templates: templates.clone(),
    };

    let service = NotificationService::with_parts(
        config,
        directory.clone(),
        providers,
        Arc::new(LocalLock::new(CancellationToken::new())),
    )
    .expect("service");

    let sends = Recorder::new();
    service.dispatcher().subscribe(EventKind::Send, sends.clone());

    Harness {
        directory,
        push,
        sms,
        templates,
        sends,
        service,
    }
}

pub fn device(
    token: &str,
    account: i64,
    endpoint: &str,
    platform: Platform,
    app_type: &str,
    app_environment: &str,
) -> PushConfig {
    PushConfig {
        device_token: token.to_string(),
        account_id: AccountId(account),
        push_endpoint: endpoint.to_string(),
        platform,
        platform_version: "1".to_string(),
        app_type: app_type.to_string(),
        app_environment: app_environment.to_string(),
        app_version: "1.0".to_string(),
        device: "Phone".to_string(),
        device_model: "Model".to_string(),
        device_id: format!("device-{}", token),
        created: Utc::now(),
    }
}
