//! Template email delivery
//!
//! Recipients are resolved through the directory (optionally filtered for
//! opt-outs and prior sends), then filtered through the environment
//! whitelist, then submitted to the template provider in a single call.

use crate::channels::ChannelInfo;
use crate::config::{EmailSettings, LiveConfig};
use crate::directory::{Directory, EmailRecipient};
use crate::dispatch::Dispatcher;
use crate::error::Result;
use crate::metrics::DispatchMetrics;
use crate::providers::mandrill::MERGE_LANGUAGE_HANDLEBARS;
use crate::providers::{MergeVar, Message, Recipient, SendResult, TemplateProvider, Var};
use chrono::Utc;
use parking_lot::RwLock;
use regex::Regex;
use std::collections::BTreeMap;
use std::ops::{BitOr, BitOrAssign};
use std::sync::Arc;
use std::time::Duration;
use telehealth_shared::{AccountId, Channel, DomainEvent, Environment, SendEvent};
use tracing::{debug, info, warn};

/// Send options, combined with `|`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EmailOptions(u8);

impl EmailOptions {
    pub const NONE: EmailOptions = EmailOptions(0);
    /// Drop recipients opted out of the type or out of all mail
    pub const CAN_OPT_OUT: EmailOptions = EmailOptions(1);
    /// Drop recipients with a prior send of the type. Applies with `CAN_OPT_OUT`.
    pub const ONLY_ONCE: EmailOptions = EmailOptions(1 << 1);
    /// Ask the provider for asynchronous delivery
    pub const ASYNC: EmailOptions = EmailOptions(1 << 2);

    pub fn contains(self, other: EmailOptions) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for EmailOptions {
    type Output = EmailOptions;

    fn bitor(self, rhs: EmailOptions) -> EmailOptions {
        EmailOptions(self.0 | rhs.0)
    }
}

impl BitOrAssign for EmailOptions {
    fn bitor_assign(&mut self, rhs: EmailOptions) {
        self.0 |= rhs.0;
    }
}

/// Per-recipient template variables keyed by account
pub type RecipientVars = BTreeMap<AccountId, Vec<Var>>;

/// Compiled whitelist for one raw config value
#[derive(Debug, Default)]
struct Whitelist {
    raw: String,
    patterns: Vec<Regex>,
}

impl Whitelist {
    fn compile(raw: &str) -> Self {
        let patterns = raw
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .filter_map(|line| match Regex::new(line) {
                Ok(pattern) => Some(pattern),
                Err(e) => {
                    warn!(pattern = line, error = %e, "Skipping malformed whitelist pattern");
                    None
                }
            })
            .collect();
        Self {
            raw: raw.to_string(),
            patterns,
        }
    }

    fn allows(&self, email: &str) -> bool {
        self.patterns.is_empty() || self.patterns.iter().any(|p| p.is_match(email))
    }
}

/// Accounts actually submitted and the provider's per-address results
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EmailOutcome {
    pub recipients: Vec<AccountId>,
    pub results: Vec<SendResult>,
}

pub struct EmailSender {
    directory: Arc<dyn Directory>,
    provider: Arc<dyn TemplateProvider>,
    live: Arc<LiveConfig>,
    dispatcher: Arc<Dispatcher>,
    environment: Environment,
    settings: EmailSettings,
    timeout: Duration,
    metrics: DispatchMetrics,
    whitelist: RwLock<Arc<Whitelist>>,
}

impl EmailSender {
    pub fn new(
        directory: Arc<dyn Directory>,
        provider: Arc<dyn TemplateProvider>,
        live: Arc<LiveConfig>,
        dispatcher: Arc<Dispatcher>,
        environment: Environment,
        settings: &EmailSettings,
        metrics: DispatchMetrics,
    ) -> Self {
        info!("Initializing email channel");
        Self {
            directory,
            provider,
            live,
            dispatcher,
            environment,
            timeout: Duration::from_secs(settings.timeout_seconds),
            settings: settings.clone(),
            metrics,
            whitelist: RwLock::new(Arc::new(Whitelist::default())),
        }
    }

    pub fn channel_info(&self) -> ChannelInfo {
        ChannelInfo {
            name: "email".to_string(),
            provider: format!("{:?}", self.settings.provider).to_lowercase(),
            enabled: self.settings.enabled,
            timeout_seconds: self.timeout.as_secs(),
        }
    }

    pub fn support_email(&self) -> &str {
        &self.settings.support_email
    }

    /// Current compiled whitelist, recompiled when the raw value changed.
    fn whitelist(&self, raw: &str) -> Arc<Whitelist> {
        let current = self.whitelist.read().clone();
        if current.raw == raw {
            return current;
        }
        let compiled = Arc::new(Whitelist::compile(raw));
        *self.whitelist.write() = compiled.clone();
        compiled
    }

    /// Send template `email_type` to `accounts`.
    pub async fn send(
        &self,
        accounts: &[AccountId],
        email_type: &str,
        vars: Option<&RecipientVars>,
        message: Message,
        options: EmailOptions,
    ) -> Result<EmailOutcome> {
        let recipients = if options.contains(EmailOptions::CAN_OPT_OUT) {
            self.directory
                .email_recipients_with_opt_out(
                    accounts,
                    email_type,
                    options.contains(EmailOptions::ONLY_ONCE),
                )
                .await?
        } else {
            self.directory.email_recipients(accounts).await?
        };

        if recipients.is_empty() {
            debug!(email_type = email_type, "No eligible recipients");
            return Ok(EmailOutcome::default());
        }

        self.send_to_recipients(recipients, email_type, vars, message, options)
            .await
    }

    /// Send to already-resolved recipients. Only the whitelist applies.
    pub async fn send_to_recipients(
        &self,
        recipients: Vec<EmailRecipient>,
        email_type: &str,
        vars: Option<&RecipientVars>,
        mut message: Message,
        options: EmailOptions,
    ) -> Result<EmailOutcome> {
        if !self.settings.enabled {
            debug!(email_type = email_type, "Email disabled, skipping");
            return Ok(EmailOutcome::default());
        }

        let whitelist = self.whitelist(&self.live.snapshot().email_whitelist);
        let recipients: Vec<EmailRecipient> = recipients
            .into_iter()
            .filter(|recipient| {
                let allowed = whitelist.allows(&recipient.email);
                if !allowed {
                    debug!(email = %recipient.email, "Recipient not whitelisted");
                }
                allowed
            })
            .collect();
        if recipients.is_empty() {
            return Ok(EmailOutcome::default());
        }

        message
            .merge_language
            .get_or_insert_with(|| MERGE_LANGUAGE_HANDLEBARS.to_string());
        message
            .global_merge_vars
            .push(Var::new("Env", self.environment.as_str()));
        message
            .from_email
            .get_or_insert_with(|| self.settings.from_email.clone());
        message
            .from_name
            .get_or_insert_with(|| self.settings.from_name.clone());

        for recipient in &recipients {
            message.to.push(Recipient {
                email: recipient.email.clone(),
                name: Some(recipient.name.clone()).filter(|name| !name.is_empty()),
                kind: None,
            });
            if let Some(account_vars) = vars.and_then(|vars| vars.get(&recipient.account_id)) {
                message.merge_vars.push(MergeVar {
                    rcpt: recipient.email.clone(),
                    vars: account_vars.clone(),
                });
            }
        }

        message
            .view_content_link
            .get_or_insert(!self.environment.is_prod());
        message.preserve_recipients.get_or_insert(false);

        let submitted = match tokio::time::timeout(
            self.timeout,
            self.provider.send_message_template(
                email_type,
                None,
                &message,
                options.contains(EmailOptions::ASYNC),
            ),
        )
        .await
        {
            Ok(result) => result,
            Err(elapsed) => Err(elapsed.into()),
        };

        let count = recipients.len() as u64;
        let results = match submitted {
            Ok(results) => results,
            Err(e) => {
                self.metrics.email_failed.inc_by(count);
                warn!(email_type = email_type, error = %e, "Template send failed");
                return Err(e);
            }
        };
        self.metrics.email_sent.inc_by(count);

        let accounts: Vec<AccountId> = recipients.iter().map(|r| r.account_id).collect();
        for account in accounts.iter().filter(|a| **a != AccountId::SYSTEM) {
            self.dispatcher
                .publish_async(DomainEvent::Send(SendEvent {
                    account_id: *account,
                    channel: Channel::Email,
                    cause: email_type.to_string(),
                    sent_at: Utc::now(),
                }))
                .await;
        }

        Ok(EmailOutcome {
            recipients: accounts,
            results,
        })
    }
}
