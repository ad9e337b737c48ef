//! Reminder for visits left open
//!
//! Each run picks up open visits whose last transition falls between the
//! stored watermark and `now - after`, then moves the watermark forward.
//! Recipients under 18, or without a date of birth, are dropped.

use super::{Campaign, CampaignInfo};
use crate::channels::RecipientVars;
use crate::config::RuntimeSettings;
use crate::directory::{Directory, VisitStatus};
use crate::error::Result;
use crate::providers::Var;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

pub const ABANDONED_VISIT: &str = "abandoned-visit";

/// Lookback for the very first run, when no watermark is stored yet
const FIRST_RUN_WINDOW_HOURS: i64 = 24;

const ADULT_AGE: u32 = 18;

#[derive(Debug, Default, Serialize, Deserialize)]
struct State {
    end_time: Option<DateTime<Utc>>,
}

pub struct AbandonedVisit {
    directory: Arc<dyn Directory>,
}

impl AbandonedVisit {
    pub fn new(directory: Arc<dyn Directory>) -> Self {
        Self { directory }
    }

    async fn load_state(&self) -> Result<State> {
        let Some(raw) = self.directory.campaign_state(ABANDONED_VISIT).await? else {
            return Ok(State::default());
        };
        match serde_json::from_slice(&raw) {
            Ok(state) => Ok(state),
            Err(e) => {
                warn!(campaign = ABANDONED_VISIT, error = %e, "Discarding unreadable campaign state");
                Ok(State::default())
            }
        }
    }
}

#[async_trait]
impl Campaign for AbandonedVisit {
    fn key(&self) -> &str {
        ABANDONED_VISIT
    }

    async fn run(
        &self,
        settings: &RuntimeSettings,
        now: DateTime<Utc>,
    ) -> Result<Option<CampaignInfo>> {
        let Some(after) = settings.abandoned_visit_after() else {
            return Ok(None);
        };

        let Some(end) = now.checked_sub_signed(after) else {
            warn!(campaign = ABANDONED_VISIT, "Delay reaches before the earliest timestamp");
            return Ok(None);
        };
        let state = self.load_state().await?;
        let start = match state.end_time {
            Some(start) => start,
            None => end
                .checked_sub_signed(Duration::hours(FIRST_RUN_WINDOW_HOURS))
                .unwrap_or(DateTime::<Utc>::MIN_UTC),
        };
        if start >= end {
            return Ok(None);
        }

        let visits = self
            .directory
            .visits_in_status(VisitStatus::Open, start, end)
            .await?;
        let next = serde_json::to_vec(&State {
            end_time: Some(end),
        })?;
        self.directory
            .set_campaign_state(ABANDONED_VISIT, &next)
            .await?;

        let today = now.date_naive();
        let mut accounts = RecipientVars::new();
        for visit in visits {
            let account = visit.patient_account_id;
            if accounts.contains_key(&account) {
                continue;
            }
            let adult = self
                .directory
                .person_for_account(account)
                .await?
                .and_then(|person| person.age_on(today))
                .map(|age| age >= ADULT_AGE)
                .unwrap_or(false);
            if !adult {
                debug!(campaign = ABANDONED_VISIT, account_id = %account, "Skipping minor or unknown age");
                continue;
            }
            accounts.insert(account, vec![Var::new("CaseName", visit.case_name)]);
        }

        Ok(Some(CampaignInfo {
            email_type: ABANDONED_VISIT.to_string(),
            accounts,
            message: None,
        }))
    }
}
