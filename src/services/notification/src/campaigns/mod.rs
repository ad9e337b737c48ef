//! Scheduled and event-driven email campaigns
//!
//! A [`Campaign`] inspects the directory and returns who should get which
//! email. The [`CampaignRunner`] runs every registered campaign once per
//! interval while holding the coordination lock, adds a signed opt-out link
//! for each recipient and sends once-only mail through the email sender.

pub mod abandoned_visit;
pub mod listeners;
pub mod optout;

pub use abandoned_visit::AbandonedVisit;
pub use listeners::CampaignListeners;
pub use optout::OptOutSigner;

use crate::channels::{EmailOptions, EmailSender, RecipientVars};
use crate::config::{CampaignSettings, LiveConfig, RuntimeSettings};
use crate::directory::Directory;
use crate::error::{NotificationError, Result};
use crate::lock::Lock;
use crate::metrics::DispatchMetrics;
use crate::providers::{Message, Var};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use telehealth_shared::AccountId;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Result of one campaign evaluation
#[derive(Debug, Clone, Default)]
pub struct CampaignInfo {
    pub email_type: String,
    /// Per-recipient template vars
    pub accounts: RecipientVars,
    /// Base message; subject and sender default from config when absent
    pub message: Option<Message>,
}

#[async_trait]
pub trait Campaign: Send + Sync {
    fn key(&self) -> &str;

    /// `Ok(None)` skips this run.
    async fn run(&self, settings: &RuntimeSettings, now: DateTime<Utc>)
        -> Result<Option<CampaignInfo>>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CampaignReport {
    pub campaign: String,
    pub email_type: Option<String>,
    /// Accounts the provider accepted mail for
    pub recipients: Vec<AccountId>,
    pub error: Option<String>,
}

impl CampaignReport {
    fn skipped(campaign: &str) -> Self {
        Self {
            campaign: campaign.to_string(),
            email_type: None,
            recipients: Vec::new(),
            error: None,
        }
    }
}

pub struct CampaignRunner {
    campaigns: Vec<Arc<dyn Campaign>>,
    directory: Arc<dyn Directory>,
    email: Arc<EmailSender>,
    live: Arc<LiveConfig>,
    lock: Arc<dyn Lock>,
    signer: Option<OptOutSigner>,
    web_domain: String,
    interval: Duration,
    metrics: DispatchMetrics,
    running: AtomicBool,
}

impl CampaignRunner {
    pub fn new(
        directory: Arc<dyn Directory>,
        email: Arc<EmailSender>,
        live: Arc<LiveConfig>,
        lock: Arc<dyn Lock>,
        settings: &CampaignSettings,
        metrics: DispatchMetrics,
    ) -> Self {
        let signer = if settings.optout_signing_key.is_empty() {
            warn!("No opt-out signing key configured, campaign mail will carry no opt-out link");
            None
        } else {
            Some(OptOutSigner::new(&settings.optout_signing_key))
        };
        Self {
            campaigns: Vec::new(),
            directory,
            email,
            live,
            lock,
            signer,
            web_domain: settings.web_domain.clone(),
            interval: Duration::from_secs(settings.interval_seconds),
            metrics,
            running: AtomicBool::new(false),
        }
    }

    pub fn register(&mut self, campaign: Arc<dyn Campaign>) {
        info!(campaign = campaign.key(), "Registered campaign");
        self.campaigns.push(campaign);
    }

    pub fn keys(&self) -> Vec<String> {
        self.campaigns.iter().map(|c| c.key().to_string()).collect()
    }

    pub fn lock(&self) -> &Arc<dyn Lock> {
        &self.lock
    }

    /// Run the loop on its own task until `cancel` fires. The lock is
    /// released on exit.
    pub fn start(self: Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            info!(
                interval_seconds = self.interval.as_secs(),
                campaigns = self.campaigns.len(),
                "Campaign runner started"
            );

            loop {
                if !self.lock.wait().await {
                    break;
                }
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                self.tick(Utc::now()).await;
            }

            self.lock.release().await;
            info!("Campaign runner stopped");
        })
    }

    /// One scheduled pass. Skipped if the previous pass is still running.
    pub async fn tick(&self, now: DateTime<Utc>) -> Option<Vec<CampaignReport>> {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("Previous campaign pass still running, skipping tick");
            return None;
        }
        let reports = self.run_once(now).await;
        self.running.store(false, Ordering::SeqCst);
        Some(reports)
    }

    /// Run every campaign once. A failing campaign never stops the others.
    pub async fn run_once(&self, now: DateTime<Utc>) -> Vec<CampaignReport> {
        let mut reports = Vec::with_capacity(self.campaigns.len());
        for campaign in &self.campaigns {
            reports.push(self.run_and_count(campaign.as_ref(), now).await);
        }
        reports
    }

    /// Run one campaign by key. Unknown keys are a `NotFound` error.
    pub async fn run_campaign(&self, key: &str, now: DateTime<Utc>) -> Result<CampaignReport> {
        let campaign = self
            .campaigns
            .iter()
            .find(|c| c.key() == key)
            .ok_or_else(|| NotificationError::not_found(format!("campaign {}", key)))?;
        Ok(self.run_and_count(campaign.as_ref(), now).await)
    }

    async fn run_and_count(&self, campaign: &dyn Campaign, now: DateTime<Utc>) -> CampaignReport {
        match self.execute(campaign, now).await {
            Ok(report) => {
                self.metrics.campaign_succeeded.inc();
                report
            }
            Err(e) => {
                self.metrics.campaign_failed.inc();
                error!(campaign = campaign.key(), error = %e, "Campaign failed");
                CampaignReport {
                    error: Some(e.to_string()),
                    ..CampaignReport::skipped(campaign.key())
                }
            }
        }
    }

    async fn execute(&self, campaign: &dyn Campaign, now: DateTime<Utc>) -> Result<CampaignReport> {
        let settings = self.live.snapshot();
        let Some(info) = campaign.run(&settings, now).await? else {
            debug!(campaign = campaign.key(), "Campaign skipped");
            return Ok(CampaignReport::skipped(campaign.key()));
        };

        let mut report = CampaignReport {
            email_type: Some(info.email_type.clone()),
            ..CampaignReport::skipped(campaign.key())
        };
        if info.accounts.is_empty() {
            debug!(campaign = campaign.key(), "Campaign found no recipients");
            return Ok(report);
        }

        let mut vars = info.accounts;
        if let Some(signer) = &self.signer {
            for (account, account_vars) in vars.iter_mut() {
                match signer.opt_out_url(&self.web_domain, &info.email_type, *account) {
                    Ok(link) => account_vars.push(Var::new("OptoutURL", link)),
                    Err(e) => warn!(
                        campaign = campaign.key(),
                        account_id = %account,
                        error = %e,
                        "Failed to sign opt-out link"
                    ),
                }
            }
        }

        let accounts: Vec<AccountId> = vars.keys().copied().collect();
        let outcome = self
            .email
            .send(
                &accounts,
                &info.email_type,
                Some(&vars),
                info.message.unwrap_or_default(),
                EmailOptions::CAN_OPT_OUT | EmailOptions::ASYNC | EmailOptions::ONLY_ONCE,
            )
            .await?;

        if !outcome.recipients.is_empty() {
            self.directory
                .email_record_send(&outcome.recipients, &info.email_type)
                .await?;
        }
        info!(
            campaign = campaign.key(),
            email_type = %info.email_type,
            candidates = accounts.len(),
            sent = outcome.recipients.len(),
            "Campaign run complete"
        );

        report.recipients = outcome.recipients;
        Ok(report)
    }
}
