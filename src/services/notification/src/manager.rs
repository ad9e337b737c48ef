//! Notification Manager
//!
//! Subscribes to every event kind that has a view. For each event it finds
//! the recipient, computes the badge, picks the channel and hands the
//! rendered content to that channel's sender. Push and SMS deliveries are
//! reported on the bus as `Send` events; the email sender reports its own.
//! Events with an internal view are mailed to the support address instead.

use crate::channels::{EmailOptions, EmailSender, PushSender, SmsSender};
use crate::directory::{Directory, EmailRecipient};
use crate::dispatch::{Dispatcher, EventHandler};
use crate::error::{NotificationError, Result};
use crate::preferences::PreferenceResolver;
use crate::providers::Message;
use crate::views::ViewRegistry;
use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use telehealth_shared::{AccountId, Channel, DomainEvent, SendEvent};
use tracing::{debug, info};

/// What happened for one handled event
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Delivery {
    pub account_id: AccountId,
    pub channel: Channel,
    /// Whether at least one provider accepted the notification
    pub delivered: bool,
}

pub struct NotificationManager {
    directory: Arc<dyn Directory>,
    views: ViewRegistry,
    preferences: PreferenceResolver,
    push: Arc<PushSender>,
    sms: Arc<SmsSender>,
    email: Arc<EmailSender>,
    dispatcher: Arc<Dispatcher>,
}

impl NotificationManager {
    pub fn new(
        directory: Arc<dyn Directory>,
        views: ViewRegistry,
        push: Arc<PushSender>,
        sms: Arc<SmsSender>,
        email: Arc<EmailSender>,
        dispatcher: Arc<Dispatcher>,
    ) -> Self {
        Self {
            preferences: PreferenceResolver::new(directory.clone()),
            directory,
            views,
            push,
            sms,
            email,
            dispatcher,
        }
    }

    /// Subscribe one handler per event kind with a view or internal view.
    pub fn register(self: &Arc<Self>) {
        let handler: Arc<dyn EventHandler> = Arc::new(ManagerSubscriber {
            manager: self.clone(),
        });
        let mut kinds = self.views.kinds();
        kinds.extend(self.views.internal_kinds());
        for kind in kinds {
            self.dispatcher.subscribe(kind, handler.clone());
        }
        info!(
            views = self.views.kinds().len(),
            internal = self.views.internal_kinds().len(),
            "Notification manager subscribed"
        );
    }

    /// Notify the event's recipient on their preferred channel. Returns
    /// `None` for events without a user-facing view.
    pub async fn handle_event(&self, event: &DomainEvent) -> Result<Option<Delivery>> {
        let kind = event.kind();
        let (Some(view), Some(who)) = (self.views.view(kind), event.recipient()) else {
            return Ok(None);
        };

        let person = self
            .directory
            .person(who)
            .await?
            .ok_or_else(|| NotificationError::not_found(format!("{:?} {}", who.role, who.id)))?;
        let account = person.account_id;
        let role = person.role;

        let badge = if role.is_provider() {
            self.directory.pending_work_count(who.id).await?
        } else {
            0
        };

        let channel = self.preferences.channel_for(account).await?;
        debug!(
            kind = %kind,
            account_id = %account,
            channel = %channel,
            "Dispatching notification"
        );

        let delivered = match channel {
            Channel::Push => {
                let report = self
                    .push
                    .send(account, role, &view.render_push(role), badge)
                    .await?;
                report.sent > 0
            }
            Channel::Sms => self.sms.send(account, role, &view.render_sms(role)).await?,
            Channel::Email => {
                let rendering = view.render_email(event, role);
                let message = Message {
                    global_merge_vars: rendering.context,
                    ..Default::default()
                };
                let outcome = self
                    .email
                    .send(
                        &[account],
                        &rendering.email_type,
                        None,
                        message,
                        EmailOptions::CAN_OPT_OUT | EmailOptions::ASYNC,
                    )
                    .await?;
                !outcome.recipients.is_empty()
            }
        };

        if delivered && channel != Channel::Email {
            self.dispatcher
                .publish_async(DomainEvent::Send(SendEvent {
                    account_id: account,
                    channel,
                    cause: kind.to_string(),
                    sent_at: Utc::now(),
                }))
                .await;
        }

        Ok(Some(Delivery {
            account_id: account,
            channel,
            delivered,
        }))
    }

    /// Mail the internal rendering of `event` to `to_email`, bypassing
    /// preferences and opt-outs.
    pub async fn notify_support(&self, to_email: &str, event: &DomainEvent) -> Result<()> {
        let Some(view) = self.views.internal_view(event.kind()) else {
            return Ok(());
        };
        let rendering = view.render_email(event);
        let recipient = EmailRecipient {
            account_id: AccountId::SYSTEM,
            email: to_email.to_string(),
            name: "Support".to_string(),
            opted_out_at: None,
        };
        let message = Message {
            global_merge_vars: rendering.context,
            ..Default::default()
        };
        self.email
            .send_to_recipients(
                vec![recipient],
                &rendering.email_type,
                None,
                message,
                EmailOptions::ASYNC,
            )
            .await?;
        Ok(())
    }
}

struct ManagerSubscriber {
    manager: Arc<NotificationManager>,
}

#[async_trait]
impl EventHandler for ManagerSubscriber {
    async fn handle(&self, event: &DomainEvent) -> Result<()> {
        if self.manager.views.internal_view(event.kind()).is_some() {
            let support = self.manager.email.support_email().to_string();
            self.manager.notify_support(&support, event).await?;
        }
        self.manager.handle_event(event).await?;
        Ok(())
    }

    fn name(&self) -> &str {
        "notification-manager"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{
        AndroidPayloadStyle, EmailSettings, LiveConfig, NotificationConfig, NotificationConfigs,
        RuntimeSettings,
    };
    use crate::directory::PushConfig;
    use crate::dispatch::Recorder;
    use crate::memory::{AccountRecord, MemoryDirectory};
    use crate::metrics::DispatchMetrics;
    use crate::providers::{RecordingPushProvider, RecordingSmsProvider, RecordingTemplateProvider};
    use pretty_assertions::assert_eq;
    use std::time::Duration;
    use telehealth_shared::events::{CaseAssigned, VisitMarkedUnsuitable, VisitSubmitted};
    use telehealth_shared::{Environment, EventKind, PhoneNumber, Platform};

    struct Fixture {
        directory: Arc<MemoryDirectory>,
        push: Arc<RecordingPushProvider>,
        sms: Arc<RecordingSmsProvider>,
        templates: Arc<RecordingTemplateProvider>,
        sends: Arc<Recorder>,
        dispatcher: Arc<Dispatcher>,
        manager: Arc<NotificationManager>,
    }

    fn fixture() -> Fixture {
        let directory = Arc::new(MemoryDirectory::new());
        let push = Arc::new(RecordingPushProvider::new());
        let sms = Arc::new(RecordingSmsProvider::new());
        let templates = Arc::new(RecordingTemplateProvider::new());
        let dispatcher = Arc::new(Dispatcher::synchronous());
        let sends = Recorder::new();
        dispatcher.subscribe(EventKind::Send, sends.clone());
        let metrics = DispatchMetrics::new().unwrap();
        let configs = NotificationConfigs::new(&[NotificationConfig {
            platform: Platform::Ios,
            app_type: "doctor".to_string(),
            app_environment: "prod".to_string(),
            application_endpoint: "arn:doctor".to_string(),
            sandbox: false,
        }]);

        let push_sender = Arc::new(PushSender::new(
            directory.clone(),
            push.clone(),
            configs,
            AndroidPayloadStyle::Plain,
            Duration::from_secs(1),
            metrics.clone(),
        ));
        let sms_sender = Arc::new(SmsSender::new(
            directory.clone(),
            sms.clone(),
            "+15555550100",
            Duration::from_secs(1),
            metrics.clone(),
        ));
        let email_sender = Arc::new(EmailSender::new(
            directory.clone(),
            templates.clone(),
            Arc::new(LiveConfig::new(RuntimeSettings::default())),
            dispatcher.clone(),
            Environment::Test,
            &EmailSettings::default(),
            metrics,
        ));
        let manager = Arc::new(NotificationManager::new(
            directory.clone(),
            ViewRegistry::builtin().unwrap(),
            push_sender,
            sms_sender,
            email_sender,
            dispatcher.clone(),
        ));
        manager.register();

        directory.add_account(
            AccountRecord::doctor(3, 30, "doc@example.test")
                .with_phone(PhoneNumber::cell("+15555550003")),
        );
        directory.set_pending_work(AccountId(3), 4);

        Fixture {
            directory,
            push,
            sms,
            templates,
            sends,
            dispatcher,
            manager,
        }
    }

    fn case_assigned() -> DomainEvent {
        DomainEvent::CaseAssigned(CaseAssigned {
            case_id: 8,
            doctor_id: 30,
        })
    }

    #[tokio::test]
    async fn test_no_preference_falls_back_to_email() {
        let f = fixture();

        let delivery = f.manager.handle_event(&case_assigned()).await.unwrap().unwrap();

        assert_eq!(delivery.channel, Channel::Email);
        let sent = f.templates.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].template_name, "case_assigned_doctor");
        // Email reports its own send event
        assert_eq!(f.sends.len(), 1);
    }

    #[tokio::test]
    async fn test_sms_preference() {
        let f = fixture();
        f.directory
            .set_communication_preference(AccountId(3), Channel::Sms)
            .await
            .unwrap();

        f.dispatcher.publish(&case_assigned()).await;

        let sent = f.sms.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].body, "A patient case has been assigned to you.");
        assert!(f.templates.sent().is_empty());
        match &f.sends.events()[0] {
            DomainEvent::Send(send) => {
                assert_eq!(send.channel, Channel::Sms);
                assert_eq!(send.cause, "case_assigned");
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_rejected_sms_is_not_reported_as_sent() {
        let f = fixture();
        f.directory
            .set_communication_preference(AccountId(3), Channel::Sms)
            .await
            .unwrap();
        f.sms.fail_number("+15555550003");

        assert!(f.manager.handle_event(&case_assigned()).await.is_err());

        assert_eq!(f.sms.sent().len(), 1);
        assert!(f.sends.is_empty());
    }

    #[tokio::test]
    async fn test_provider_push_carries_pending_work_badge() {
        let f = fixture();
        f.directory
            .upsert_push_config(&PushConfig {
                device_token: "tok".to_string(),
                account_id: AccountId(3),
                push_endpoint: "ep-doc".to_string(),
                platform: Platform::Ios,
                platform_version: "17.0".to_string(),
                app_type: "doctor".to_string(),
                app_environment: "prod".to_string(),
                app_version: "2.0".to_string(),
                device: "Phone".to_string(),
                device_model: "iPhone".to_string(),
                device_id: "dev-1".to_string(),
                created: Utc::now(),
            })
            .await
            .unwrap();
        f.directory
            .set_communication_preference(AccountId(3), Channel::Push)
            .await
            .unwrap();

        let event = DomainEvent::VisitSubmitted(VisitSubmitted {
            patient_id: 1,
            doctor_id: 30,
            visit_id: 2,
            case_id: 3,
        });
        let delivery = f.manager.handle_event(&event).await.unwrap().unwrap();

        assert!(delivery.delivered);
        let published = f.push.published();
        assert_eq!(published.len(), 1);
        let payload: serde_json::Value = serde_json::from_str(&published[0].payload).unwrap();
        let apns: serde_json::Value =
            serde_json::from_str(payload["APNS"].as_str().unwrap()).unwrap();
        assert_eq!(apns["badge"], 4);
        assert_eq!(apns["alert"], "You have a new patient visit waiting.");
    }

    #[tokio::test]
    async fn test_unknown_recipient_is_error() {
        let f = fixture();
        let event = DomainEvent::CaseAssigned(CaseAssigned {
            case_id: 1,
            doctor_id: 999,
        });
        let err = f.manager.handle_event(&event).await.unwrap_err();
        assert_eq!(err.error_code(), "NOT_FOUND");
    }

    #[tokio::test]
    async fn test_unsuitable_visit_goes_to_support() {
        let f = fixture();
        let event = DomainEvent::VisitMarkedUnsuitable(VisitMarkedUnsuitable {
            patient_id: 1,
            doctor_id: 30,
            visit_id: 12,
            case_id: 5,
        });

        f.dispatcher.publish(&event).await;

        let sent = f.templates.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].template_name, "visit_unsuitable");
        assert_eq!(
            sent[0].message.recipient_emails(),
            vec!["support@telehealth.dev"]
        );
        assert!(f.sends.is_empty());
    }
}
