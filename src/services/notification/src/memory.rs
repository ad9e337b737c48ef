//! In-memory [`Directory`] implementation
//!
//! Backs the admin tool (optionally persisted as a JSON snapshot file) and
//! every test. All state sits behind one lock that is never held across an
//! await point.

use crate::directory::{
    Directory, EmailRecipient, EmailSendRecord, Person, PushConfig, VisitStatus, VisitSummary,
};
use crate::error::{NotificationError, Result};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use telehealth_shared::{
    AccountId, Channel, PersonRef, PhoneNumber, PromptStatus, Role,
};

/// Opt-out key covering every email type
pub const OPT_OUT_ALL: &str = "*";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountRecord {
    pub account_id: AccountId,
    pub role: Role,
    pub person_id: i64,
    #[serde(default)]
    pub first_name: String,
    #[serde(default)]
    pub last_name: String,
    pub email: String,
    #[serde(default)]
    pub date_of_birth: Option<NaiveDate>,
    #[serde(default)]
    pub phone_numbers: Vec<PhoneNumber>,
    #[serde(default)]
    pub pending_work: i64,
    #[serde(default)]
    pub parent_patient_id: Option<i64>,
}

impl AccountRecord {
    pub fn new(account_id: i64, role: Role, person_id: i64, email: &str) -> Self {
        Self {
            account_id: AccountId(account_id),
            role,
            person_id,
            first_name: String::new(),
            last_name: String::new(),
            email: email.to_string(),
            date_of_birth: None,
            phone_numbers: Vec::new(),
            pending_work: 0,
            parent_patient_id: None,
        }
    }

    pub fn patient(account_id: i64, patient_id: i64, email: &str) -> Self {
        Self::new(account_id, Role::Patient, patient_id, email)
    }

    pub fn doctor(account_id: i64, doctor_id: i64, email: &str) -> Self {
        Self::new(account_id, Role::Doctor, doctor_id, email)
    }

    pub fn named(mut self, first: &str, last: &str) -> Self {
        self.first_name = first.to_string();
        self.last_name = last.to_string();
        self
    }

    pub fn born(mut self, date_of_birth: NaiveDate) -> Self {
        self.date_of_birth = Some(date_of_birth);
        self
    }

    pub fn with_phone(mut self, phone: PhoneNumber) -> Self {
        self.phone_numbers.push(phone);
        self
    }

    pub fn with_parent(mut self, parent_patient_id: i64) -> Self {
        self.parent_patient_id = Some(parent_patient_id);
        self
    }

    fn person(&self) -> Person {
        Person {
            account_id: self.account_id,
            role: self.role,
            person_id: self.person_id,
            first_name: self.first_name.clone(),
            last_name: self.last_name.clone(),
            email: self.email.clone(),
            date_of_birth: self.date_of_birth,
        }
    }

    fn recipient(&self) -> EmailRecipient {
        EmailRecipient {
            account_id: self.account_id,
            email: self.email.clone(),
            name: format!("{} {}", self.first_name, self.last_name)
                .trim()
                .to_string(),
            opted_out_at: None,
        }
    }

    fn is(&self, who: PersonRef) -> bool {
        let role_matches = match who.role {
            Role::Patient => self.role == Role::Patient,
            Role::Doctor | Role::Cc => self.role.is_provider(),
        };
        role_matches && self.person_id == who.id
    }
}

/// Serializable state of a [`MemoryDirectory`]
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DirectorySnapshot {
    pub accounts: BTreeMap<AccountId, AccountRecord>,
    pub devices: BTreeMap<String, PushConfig>,
    pub preferences: BTreeMap<AccountId, BTreeSet<Channel>>,
    pub prompt_status: BTreeMap<AccountId, PromptStatus>,
    pub opt_outs: BTreeMap<AccountId, BTreeMap<String, DateTime<Utc>>>,
    pub send_history: Vec<EmailSendRecord>,
    pub campaign_state: BTreeMap<String, Vec<u8>>,
    pub visits: Vec<VisitSummary>,
}

#[derive(Debug, Default)]
pub struct MemoryDirectory {
    state: RwLock<DirectorySnapshot>,
}

impl MemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_snapshot(snapshot: DirectorySnapshot) -> Self {
        Self {
            state: RwLock::new(snapshot),
        }
    }

    /// Load a snapshot file. A missing file yields an empty directory.
    pub async fn load(path: &Path) -> Result<Self> {
        match tokio::fs::read(path).await {
            Ok(bytes) => {
                let snapshot: DirectorySnapshot = serde_json::from_slice(&bytes)?;
                Ok(Self::from_snapshot(snapshot))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::new()),
            Err(e) => Err(NotificationError::directory(format!(
                "Failed to read {}: {}",
                path.display(),
                e
            ))),
        }
    }

    pub async fn save(&self, path: &Path) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(&self.snapshot())?;
        tokio::fs::write(path, bytes).await.map_err(|e| {
            NotificationError::directory(format!("Failed to write {}: {}", path.display(), e))
        })
    }

    pub fn snapshot(&self) -> DirectorySnapshot {
        self.state.read().clone()
    }

    pub fn add_account(&self, record: AccountRecord) {
        self.state.write().accounts.insert(record.account_id, record);
    }

    pub fn set_pending_work(&self, account: AccountId, count: i64) {
        if let Some(record) = self.state.write().accounts.get_mut(&account) {
            record.pending_work = count;
        }
    }

    pub fn opt_out(&self, account: AccountId, email_type: &str) {
        self.state
            .write()
            .opt_outs
            .entry(account)
            .or_default()
            .insert(email_type.to_string(), Utc::now());
    }

    pub fn add_visit(&self, visit: VisitSummary) {
        self.state.write().visits.push(visit);
    }

    pub fn send_history(&self) -> Vec<EmailSendRecord> {
        self.state.read().send_history.clone()
    }
}

#[async_trait]
impl Directory for MemoryDirectory {
    async fn person(&self, who: PersonRef) -> Result<Option<Person>> {
        Ok(self
            .state
            .read()
            .accounts
            .values()
            .find(|record| record.is(who))
            .map(AccountRecord::person))
    }

    async fn person_for_account(&self, account: AccountId) -> Result<Option<Person>> {
        Ok(self
            .state
            .read()
            .accounts
            .get(&account)
            .map(AccountRecord::person))
    }

    async fn phone_numbers(&self, account: AccountId) -> Result<Vec<PhoneNumber>> {
        Ok(self
            .state
            .read()
            .accounts
            .get(&account)
            .map(|record| record.phone_numbers.clone())
            .unwrap_or_default())
    }

    async fn pending_work_count(&self, doctor_id: i64) -> Result<i64> {
        Ok(self
            .state
            .read()
            .accounts
            .values()
            .find(|record| record.is(PersonRef::doctor(doctor_id)))
            .map(|record| record.pending_work)
            .unwrap_or(0))
    }

    async fn parent_of(&self, patient_id: i64) -> Result<Option<i64>> {
        Ok(self
            .state
            .read()
            .accounts
            .values()
            .find(|record| record.is(PersonRef::patient(patient_id)))
            .and_then(|record| record.parent_patient_id))
    }

    async fn push_config_for_token(&self, device_token: &str) -> Result<Option<PushConfig>> {
        Ok(self.state.read().devices.get(device_token).cloned())
    }

    async fn push_configs_for_account(&self, account: AccountId) -> Result<Vec<PushConfig>> {
        let mut devices: Vec<PushConfig> = self
            .state
            .read()
            .devices
            .values()
            .filter(|device| device.account_id == account)
            .cloned()
            .collect();
        devices.sort_by(|a, b| {
            a.created
                .cmp(&b.created)
                .then_with(|| a.device_token.cmp(&b.device_token))
        });
        Ok(devices)
    }

    async fn upsert_push_config(&self, config: &PushConfig) -> Result<()> {
        self.state
            .write()
            .devices
            .insert(config.device_token.clone(), config.clone());
        Ok(())
    }

    async fn delete_push_config(&self, device_token: &str) -> Result<bool> {
        Ok(self.state.write().devices.remove(device_token).is_some())
    }

    async fn delete_push_configs_for_account(&self, account: AccountId) -> Result<usize> {
        let mut state = self.state.write();
        let before = state.devices.len();
        state.devices.retain(|_, device| device.account_id != account);
        Ok(before - state.devices.len())
    }

    async fn delete_push_configs_for_device_id(&self, device_id: &str) -> Result<Vec<PushConfig>> {
        let mut state = self.state.write();
        let removed: Vec<PushConfig> = state
            .devices
            .values()
            .filter(|device| device.device_id == device_id)
            .cloned()
            .collect();
        for device in &removed {
            state.devices.remove(&device.device_token);
        }
        Ok(removed)
    }

    async fn communication_preferences(&self, account: AccountId) -> Result<Vec<Channel>> {
        Ok(self
            .state
            .read()
            .preferences
            .get(&account)
            .map(|channels| channels.iter().copied().collect())
            .unwrap_or_default())
    }

    async fn set_communication_preference(
        &self,
        account: AccountId,
        channel: Channel,
    ) -> Result<()> {
        self.state
            .write()
            .preferences
            .entry(account)
            .or_default()
            .insert(channel);
        Ok(())
    }

    async fn delete_communication_preference(
        &self,
        account: AccountId,
        channel: Channel,
    ) -> Result<()> {
        let mut state = self.state.write();
        if let Some(channels) = state.preferences.get_mut(&account) {
            channels.remove(&channel);
            if channels.is_empty() {
                state.preferences.remove(&account);
            }
        }
        Ok(())
    }

    async fn push_prompt_status(&self, account: AccountId) -> Result<PromptStatus> {
        Ok(self
            .state
            .read()
            .prompt_status
            .get(&account)
            .copied()
            .unwrap_or_default())
    }

    async fn set_push_prompt_status(
        &self,
        account: AccountId,
        status: PromptStatus,
    ) -> Result<()> {
        self.state.write().prompt_status.insert(account, status);
        Ok(())
    }

    async fn email_recipients(&self, accounts: &[AccountId]) -> Result<Vec<EmailRecipient>> {
        let state = self.state.read();
        Ok(accounts
            .iter()
            .filter_map(|account| state.accounts.get(account))
            .map(AccountRecord::recipient)
            .collect())
    }

    async fn email_recipients_with_opt_out(
        &self,
        accounts: &[AccountId],
        email_type: &str,
        only_once: bool,
    ) -> Result<Vec<EmailRecipient>> {
        let state = self.state.read();
        let opted_out = |account: &AccountId| {
            state
                .opt_outs
                .get(account)
                .map(|types| types.contains_key(email_type) || types.contains_key(OPT_OUT_ALL))
                .unwrap_or(false)
        };
        let already_sent = |account: &AccountId| {
            state
                .send_history
                .iter()
                .any(|record| record.account_id == *account && record.email_type == email_type)
        };

        Ok(accounts
            .iter()
            .filter(|account| !opted_out(*account))
            .filter(|account| !(only_once && already_sent(*account)))
            .filter_map(|account| state.accounts.get(account))
            .map(AccountRecord::recipient)
            .collect())
    }

    async fn email_record_send(&self, accounts: &[AccountId], email_type: &str) -> Result<()> {
        let now = Utc::now();
        let mut state = self.state.write();
        state
            .send_history
            .extend(accounts.iter().map(|account| EmailSendRecord {
                account_id: *account,
                email_type: email_type.to_string(),
                sent_at: now,
            }));
        Ok(())
    }

    async fn campaign_state(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.state.read().campaign_state.get(key).cloned())
    }

    async fn set_campaign_state(&self, key: &str, state: &[u8]) -> Result<()> {
        self.state
            .write()
            .campaign_state
            .insert(key.to_string(), state.to_vec());
        Ok(())
    }

    async fn visits_in_status(
        &self,
        status: VisitStatus,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<VisitSummary>> {
        Ok(self
            .state
            .read()
            .visits
            .iter()
            .filter(|visit| visit.status == status)
            .filter(|visit| visit.last_transition >= from && visit.last_transition < to)
            .cloned()
            .collect())
    }
}
