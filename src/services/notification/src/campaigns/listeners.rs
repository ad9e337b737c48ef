//! Email campaigns triggered by bus events
//!
//! Signup welcome mail and the parent-facing mails for minors under
//! parental consent. Each is toggled by a runtime setting and honors
//! opt-outs.

use crate::channels::{EmailOptions, EmailSender, RecipientVars};
use crate::config::LiveConfig;
use crate::directory::{Directory, Person};
use crate::dispatch::{Dispatcher, EventHandler};
use crate::error::Result;
use crate::providers::{Message, Var};
use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use telehealth_shared::{AccountId, DomainEvent, EventKind, PersonRef};
use tracing::debug;

pub const WELCOME: &str = "welcome";
pub const WELCOME_UNDER_18: &str = "welcome-under-18";
pub const MINOR_TREATMENT_PLAN_ISSUED: &str = "minor-treatment-plan-issued";
pub const MINOR_TRIAGED: &str = "minor-triaged";
pub const PARENT_WELCOME: &str = "parent-welcome";

const ADULT_AGE: u32 = 18;

pub struct CampaignListeners {
    directory: Arc<dyn Directory>,
    email: Arc<EmailSender>,
    live: Arc<LiveConfig>,
    web_domain: String,
}

impl CampaignListeners {
    pub fn new(
        directory: Arc<dyn Directory>,
        email: Arc<EmailSender>,
        live: Arc<LiveConfig>,
        web_domain: &str,
    ) -> Self {
        Self {
            directory,
            email,
            live,
            web_domain: web_domain.to_string(),
        }
    }

    pub fn register(self: &Arc<Self>, dispatcher: &Dispatcher) {
        for kind in [
            EventKind::PatientSignedUp,
            EventKind::TreatmentPlanActivated,
            EventKind::VisitMarkedUnsuitable,
            EventKind::ParentalConsentCompleted,
        ] {
            dispatcher.subscribe(kind, self.clone());
        }
    }

    fn is_minor(person: &Person) -> bool {
        person
            .age_on(Utc::now().date_naive())
            .map(|age| age < ADULT_AGE)
            .unwrap_or(false)
    }

    fn parent_vars(&self, parent: &Person, child: &Person) -> Vec<Var> {
        vec![
            Var::new("ParentFirstName", parent.first_name.as_str()),
            Var::new("PatientFirstName", child.first_name.as_str()),
            Var::new(
                "ParentFAQURL",
                format!("https://{}/parent/faq", self.web_domain),
            ),
            Var::new(
                "PatientMedicalRecordURL",
                format!(
                    "https://{}/parent/patient/{}/medrecord",
                    self.web_domain, child.person_id
                ),
            ),
        ]
    }

    async fn send(
        &self,
        person: &Person,
        email_type: &str,
        vars: Option<Vec<Var>>,
        once: bool,
    ) -> Result<()> {
        let mut options = EmailOptions::CAN_OPT_OUT | EmailOptions::ASYNC;
        if once {
            options |= EmailOptions::ONLY_ONCE;
        }
        let vars: Option<RecipientVars> =
            vars.map(|vars| [(person.account_id, vars)].into_iter().collect());
        let outcome = self
            .email
            .send(
                &[person.account_id],
                email_type,
                vars.as_ref(),
                Message::default(),
                options,
            )
            .await?;
        if once && !outcome.recipients.is_empty() {
            self.directory
                .email_record_send(&outcome.recipients, email_type)
                .await?;
        }
        Ok(())
    }

    async fn welcome(&self, account: AccountId) -> Result<()> {
        let Some(person) = self.directory.person_for_account(account).await? else {
            debug!(account_id = %account, "Signup for unknown account");
            return Ok(());
        };
        let email_type = if Self::is_minor(&person) {
            WELCOME_UNDER_18
        } else {
            WELCOME
        };
        self.send(&person, email_type, None, true).await
    }

    /// Mail the consenting parent of a minor patient. Adults and minors
    /// without a linked parent are ignored.
    async fn mail_parent_of_minor(&self, patient_id: i64, email_type: &str) -> Result<()> {
        let Some(child) = self.directory.person(PersonRef::patient(patient_id)).await? else {
            return Ok(());
        };
        if !Self::is_minor(&child) {
            return Ok(());
        }
        let Some(parent_id) = self.directory.parent_of(patient_id).await? else {
            debug!(patient_id = patient_id, email_type = email_type, "Minor has no consenting parent");
            return Ok(());
        };
        self.mail_parent(parent_id, &child, email_type, false).await
    }

    async fn mail_parent(
        &self,
        parent_id: i64,
        child: &Person,
        email_type: &str,
        once: bool,
    ) -> Result<()> {
        let Some(parent) = self.directory.person(PersonRef::patient(parent_id)).await? else {
            return Ok(());
        };
        let vars = self.parent_vars(&parent, child);
        self.send(&parent, email_type, Some(vars), once).await
    }
}

#[async_trait]
impl EventHandler for CampaignListeners {
    async fn handle(&self, event: &DomainEvent) -> Result<()> {
        let settings = self.live.snapshot();
        match event {
            DomainEvent::PatientSignedUp(e) if settings.welcome_email_enabled => {
                self.welcome(e.account_id).await
            }
            DomainEvent::TreatmentPlanActivated(e)
                if settings.minor_treatment_plan_issued_email_enabled =>
            {
                self.mail_parent_of_minor(e.patient_id, MINOR_TREATMENT_PLAN_ISSUED)
                    .await
            }
            DomainEvent::VisitMarkedUnsuitable(e) if settings.minor_triaged_email_enabled => {
                self.mail_parent_of_minor(e.patient_id, MINOR_TRIAGED).await
            }
            DomainEvent::ParentalConsentCompleted(e) if settings.parent_welcome_email_enabled => {
                let Some(child) = self
                    .directory
                    .person(PersonRef::patient(e.child_patient_id))
                    .await?
                else {
                    return Ok(());
                };
                self.mail_parent(e.parent_patient_id, &child, PARENT_WELCOME, true)
                    .await
            }
            _ => Ok(()),
        }
    }

    fn name(&self) -> &str {
        "campaign-listeners"
    }
}
