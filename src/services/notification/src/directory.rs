//! Storage port consumed by the dispatcher
//!
//! Identity, device registrations, communication preferences, opt-outs,
//! email-send history, campaign state and the visit index all sit behind one
//! [`Directory`] trait. Every mutation is a single keyed upsert or delete so
//! implementations can serialise writes at the row level.

use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Datelike, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use telehealth_shared::{
    AccountId, Channel, PersonRef, PhoneNumber, Platform, PromptStatus, Role,
};

/// A registered device. Keyed on `device_token`, which maps to at most one
/// account at a time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushConfig {
    pub device_token: String,
    pub account_id: AccountId,
    /// Endpoint returned by the push provider for this token
    pub push_endpoint: String,
    pub platform: Platform,
    pub platform_version: String,
    pub app_type: String,
    pub app_environment: String,
    pub app_version: String,
    pub device: String,
    pub device_model: String,
    pub device_id: String,
    pub created: DateTime<Utc>,
}

/// A person as the dispatcher needs to see them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Person {
    pub account_id: AccountId,
    pub role: Role,
    /// Role-scoped id (doctor id or patient id)
    pub person_id: i64,
    pub first_name: String,
    pub last_name: String,
    pub email: String,
    pub date_of_birth: Option<NaiveDate>,
}

impl Person {
    pub fn full_name(&self) -> String {
        format!("{} {}", self.first_name, self.last_name)
            .trim()
            .to_string()
    }

    pub fn person_ref(&self) -> PersonRef {
        PersonRef {
            role: self.role,
            id: self.person_id,
        }
    }

    /// Age in whole years on `today`, if the date of birth is known.
    pub fn age_on(&self, today: NaiveDate) -> Option<u32> {
        let dob = self.date_of_birth?;
        let mut age = today.year() - dob.year();
        if (today.month(), today.day()) < (dob.month(), dob.day()) {
            age -= 1;
        }
        u32::try_from(age).ok()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmailRecipient {
    pub account_id: AccountId,
    pub email: String,
    pub name: String,
    /// When the recipient opted out of the requested type, if they did
    pub opted_out_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmailSendRecord {
    pub account_id: AccountId,
    pub email_type: String,
    pub sent_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VisitStatus {
    Open,
    Submitted,
    Routed,
    Reviewing,
    Triaged,
    Treated,
    Abandoned,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VisitSummary {
    pub visit_id: i64,
    pub patient_account_id: AccountId,
    pub case_name: String,
    pub status: VisitStatus,
    /// Time of the most recent status transition
    pub last_transition: DateTime<Utc>,
}

#[async_trait]
pub trait Directory: Send + Sync {
    // -- identity -------------------------------------------------------------

    async fn person(&self, who: PersonRef) -> Result<Option<Person>>;

    async fn person_for_account(&self, account: AccountId) -> Result<Option<Person>>;

    async fn phone_numbers(&self, account: AccountId) -> Result<Vec<PhoneNumber>>;

    /// Number of items waiting in a provider's queue; drives the push badge.
    async fn pending_work_count(&self, doctor_id: i64) -> Result<i64>;

    /// Parent patient id linked to a minor through parental consent.
    async fn parent_of(&self, patient_id: i64) -> Result<Option<i64>>;

    // -- devices --------------------------------------------------------------

    async fn push_config_for_token(&self, device_token: &str) -> Result<Option<PushConfig>>;

    async fn push_configs_for_account(&self, account: AccountId) -> Result<Vec<PushConfig>>;

    async fn upsert_push_config(&self, config: &PushConfig) -> Result<()>;

    async fn delete_push_config(&self, device_token: &str) -> Result<bool>;

    async fn delete_push_configs_for_account(&self, account: AccountId) -> Result<usize>;

    /// Removes every row registered from the device and returns them.
    async fn delete_push_configs_for_device_id(&self, device_id: &str) -> Result<Vec<PushConfig>>;

    // -- preferences ----------------------------------------------------------

    async fn communication_preferences(&self, account: AccountId) -> Result<Vec<Channel>>;

    async fn set_communication_preference(&self, account: AccountId, channel: Channel)
        -> Result<()>;

    async fn delete_communication_preference(
        &self,
        account: AccountId,
        channel: Channel,
    ) -> Result<()>;

    async fn push_prompt_status(&self, account: AccountId) -> Result<PromptStatus>;

    async fn set_push_prompt_status(&self, account: AccountId, status: PromptStatus)
        -> Result<()>;

    // -- email ----------------------------------------------------------------

    async fn email_recipients(&self, accounts: &[AccountId]) -> Result<Vec<EmailRecipient>>;

    /// Recipients minus anyone opted out of `email_type` or out of all mail.
    /// With `only_once`, also minus anyone with a send record for the type.
    async fn email_recipients_with_opt_out(
        &self,
        accounts: &[AccountId],
        email_type: &str,
        only_once: bool,
    ) -> Result<Vec<EmailRecipient>>;

    async fn email_record_send(&self, accounts: &[AccountId], email_type: &str) -> Result<()>;

    // -- campaigns ------------------------------------------------------------

    async fn campaign_state(&self, key: &str) -> Result<Option<Vec<u8>>>;

    async fn set_campaign_state(&self, key: &str, state: &[u8]) -> Result<()>;

    /// Visits in `status` whose last transition falls in `[from, to)`.
    async fn visits_in_status(
        &self,
        status: VisitStatus,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<VisitSummary>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn born(date: Option<NaiveDate>) -> Person {
        Person {
            account_id: AccountId(1),
            role: Role::Patient,
            person_id: 1,
            first_name: "Pat".to_string(),
            last_name: String::new(),
            email: "pat@example.test".to_string(),
            date_of_birth: date,
        }
    }

    #[test]
    fn test_age_turns_over_on_birthday() {
        let person = born(NaiveDate::from_ymd_opt(2008, 6, 15));
        let before = NaiveDate::from_ymd_opt(2026, 6, 14).unwrap();
        let on = NaiveDate::from_ymd_opt(2026, 6, 15).unwrap();
        assert_eq!(person.age_on(before), Some(17));
        assert_eq!(person.age_on(on), Some(18));
    }

    #[test]
    fn test_age_unknown_without_birth_date() {
        let today = NaiveDate::from_ymd_opt(2026, 1, 1).unwrap();
        assert_eq!(born(None).age_on(today), None);
        assert_eq!(born(None).full_name(), "Pat");
    }
}
