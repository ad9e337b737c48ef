//! Domain events published on the in-process bus
//!
//! Every variant carries the identifiers needed to resolve its recipient. The
//! `Send` variant is emitted by the notification service itself after each
//! successful delivery and is consumed by analytics subscribers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::core::{AccountId, Channel, ParseError, PersonRef};

// =============================================================================
// Event kinds
// =============================================================================

/// Discriminant used to key subscriptions and view registrations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    VisitSubmitted,
    VisitRouted,
    TreatmentPlanActivated,
    NewMessagePosted,
    CaseAssigned,
    RefillRequestCreated,
    RxTransmissionError,
    VisitMarkedUnsuitable,
    PatientSignedUp,
    ParentalConsentCompleted,
    Send,
}

impl EventKind {
    pub const ALL: [EventKind; 11] = [
        EventKind::VisitSubmitted,
        EventKind::VisitRouted,
        EventKind::TreatmentPlanActivated,
        EventKind::NewMessagePosted,
        EventKind::CaseAssigned,
        EventKind::RefillRequestCreated,
        EventKind::RxTransmissionError,
        EventKind::VisitMarkedUnsuitable,
        EventKind::PatientSignedUp,
        EventKind::ParentalConsentCompleted,
        EventKind::Send,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::VisitSubmitted => "visit_submitted",
            EventKind::VisitRouted => "visit_routed",
            EventKind::TreatmentPlanActivated => "treatment_plan_activated",
            EventKind::NewMessagePosted => "new_message_posted",
            EventKind::CaseAssigned => "case_assigned",
            EventKind::RefillRequestCreated => "refill_request_created",
            EventKind::RxTransmissionError => "rx_transmission_error",
            EventKind::VisitMarkedUnsuitable => "visit_marked_unsuitable",
            EventKind::PatientSignedUp => "patient_signed_up",
            EventKind::ParentalConsentCompleted => "parental_consent_completed",
            EventKind::Send => "send",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventKind {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase();
        EventKind::ALL
            .iter()
            .copied()
            .find(|kind| kind.as_str() == wanted)
            .ok_or(ParseError {
                kind: "event kind",
                value: s.to_string(),
            })
    }
}

// =============================================================================
// Event payloads
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VisitSubmitted {
    pub patient_id: i64,
    pub doctor_id: i64,
    pub visit_id: i64,
    pub case_id: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VisitRouted {
    pub patient_id: i64,
    pub doctor_id: i64,
    pub visit_id: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreatmentPlanActivated {
    pub patient_id: i64,
    pub doctor_id: i64,
    pub treatment_plan_id: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewMessagePosted {
    pub case_id: i64,
    pub message_id: i64,
    pub sender: PersonRef,
    pub recipient: PersonRef,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaseAssigned {
    pub case_id: i64,
    pub doctor_id: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefillRequestCreated {
    pub refill_request_id: i64,
    pub patient_id: i64,
    pub doctor_id: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RxTransmissionError {
    pub item_id: i64,
    pub patient_id: i64,
    pub doctor_id: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VisitMarkedUnsuitable {
    pub patient_id: i64,
    pub doctor_id: i64,
    pub visit_id: i64,
    pub case_id: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatientSignedUp {
    pub account_id: AccountId,
    pub patient_id: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParentalConsentCompleted {
    pub child_patient_id: i64,
    pub parent_patient_id: i64,
}

/// Record of one successful delivery to one account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendEvent {
    pub account_id: AccountId,
    pub channel: Channel,
    /// Kind of the event that caused the delivery, or the email type for
    /// campaign and listener mail.
    pub cause: String,
    pub sent_at: DateTime<Utc>,
}

// =============================================================================
// Domain event envelope
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event_type", content = "data", rename_all = "snake_case")]
pub enum DomainEvent {
    VisitSubmitted(VisitSubmitted),
    VisitRouted(VisitRouted),
    TreatmentPlanActivated(TreatmentPlanActivated),
    NewMessagePosted(NewMessagePosted),
    CaseAssigned(CaseAssigned),
    RefillRequestCreated(RefillRequestCreated),
    RxTransmissionError(RxTransmissionError),
    VisitMarkedUnsuitable(VisitMarkedUnsuitable),
    PatientSignedUp(PatientSignedUp),
    ParentalConsentCompleted(ParentalConsentCompleted),
    Send(SendEvent),
}

impl DomainEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            DomainEvent::VisitSubmitted(_) => EventKind::VisitSubmitted,
            DomainEvent::VisitRouted(_) => EventKind::VisitRouted,
            DomainEvent::TreatmentPlanActivated(_) => EventKind::TreatmentPlanActivated,
            DomainEvent::NewMessagePosted(_) => EventKind::NewMessagePosted,
            DomainEvent::CaseAssigned(_) => EventKind::CaseAssigned,
            DomainEvent::RefillRequestCreated(_) => EventKind::RefillRequestCreated,
            DomainEvent::RxTransmissionError(_) => EventKind::RxTransmissionError,
            DomainEvent::VisitMarkedUnsuitable(_) => EventKind::VisitMarkedUnsuitable,
            DomainEvent::PatientSignedUp(_) => EventKind::PatientSignedUp,
            DomainEvent::ParentalConsentCompleted(_) => EventKind::ParentalConsentCompleted,
            DomainEvent::Send(_) => EventKind::Send,
        }
    }

    /// The person a user-facing notification for this event is addressed to.
    pub fn recipient(&self) -> Option<PersonRef> {
        match self {
            DomainEvent::VisitSubmitted(e) => Some(PersonRef::doctor(e.doctor_id)),
            DomainEvent::VisitRouted(e) => Some(PersonRef::doctor(e.doctor_id)),
            DomainEvent::TreatmentPlanActivated(e) => Some(PersonRef::patient(e.patient_id)),
            DomainEvent::NewMessagePosted(e) => Some(e.recipient),
            DomainEvent::CaseAssigned(e) => Some(PersonRef::doctor(e.doctor_id)),
            DomainEvent::RefillRequestCreated(e) => Some(PersonRef::doctor(e.doctor_id)),
            DomainEvent::RxTransmissionError(e) => Some(PersonRef::doctor(e.doctor_id)),
            DomainEvent::VisitMarkedUnsuitable(_)
            | DomainEvent::PatientSignedUp(_)
            | DomainEvent::ParentalConsentCompleted(_)
            | DomainEvent::Send(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::core::Role;

    #[test]
    fn test_event_kind_parses_its_own_name() {
        for kind in EventKind::ALL {
            assert_eq!(kind.as_str().parse::<EventKind>().unwrap(), kind);
        }
        assert!("visit_exploded".parse::<EventKind>().is_err());
    }

    #[test]
    fn test_message_recipient_is_carried_by_event() {
        let event = DomainEvent::NewMessagePosted(NewMessagePosted {
            case_id: 1,
            message_id: 2,
            sender: PersonRef::doctor(3),
            recipient: PersonRef::patient(4),
        });
        let recipient = event.recipient().unwrap();
        assert_eq!(recipient.role, Role::Patient);
        assert_eq!(recipient.id, 4);
    }

    #[test]
    fn test_tagged_serialization() {
        let event = DomainEvent::CaseAssigned(CaseAssigned {
            case_id: 10,
            doctor_id: 3,
        });
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event_type"], "case_assigned");
        assert_eq!(json["data"]["doctor_id"], 3);
    }
}
