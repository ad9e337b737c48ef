//! Event to view registry
//!
//! Each user-facing event kind has exactly one [`NotificationView`] that
//! renders the push, SMS and email forms for a recipient role. Internal
//! views render support-addressed mail for events that never reach a user.
//! Registering a second view for a kind is a startup error.

use crate::error::{NotificationError, Result};
use crate::providers::Var;
use std::collections::HashMap;
use std::sync::Arc;
use telehealth_shared::{DomainEvent, EventKind, Role};

/// Rendered push content before the per-platform envelope is applied
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushMessage {
    pub short_message: String,
}

impl PushMessage {
    pub fn new(short_message: impl Into<String>) -> Self {
        Self {
            short_message: short_message.into(),
        }
    }
}

/// Template key plus the global template context
#[derive(Debug, Clone, PartialEq)]
pub struct EmailRendering {
    pub email_type: String,
    pub context: Vec<Var>,
}

pub trait NotificationView: Send + Sync {
    fn render_push(&self, role: Role) -> PushMessage {
        PushMessage::new(self.render_sms(role))
    }

    fn render_sms(&self, role: Role) -> String;

    fn render_email(&self, event: &DomainEvent, role: Role) -> EmailRendering;
}

pub trait InternalView: Send + Sync {
    fn render_email(&self, event: &DomainEvent) -> EmailRendering;
}

#[derive(Default, Clone)]
pub struct ViewRegistry {
    views: HashMap<EventKind, Arc<dyn NotificationView>>,
    internal: HashMap<EventKind, Arc<dyn InternalView>>,
}

impl ViewRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every built-in view.
    pub fn builtin() -> Result<Self> {
        let mut registry = Self::new();
        for (kind, view) in builtin_views() {
            registry.register(kind, Arc::new(view))?;
        }
        registry.register_internal(EventKind::VisitMarkedUnsuitable, Arc::new(VisitUnsuitableView))?;
        Ok(registry)
    }

    pub fn register(&mut self, kind: EventKind, view: Arc<dyn NotificationView>) -> Result<()> {
        if self.views.contains_key(&kind) {
            return Err(NotificationError::DuplicateView {
                kind: kind.to_string(),
            });
        }
        self.views.insert(kind, view);
        Ok(())
    }

    pub fn register_internal(&mut self, kind: EventKind, view: Arc<dyn InternalView>) -> Result<()> {
        if self.internal.contains_key(&kind) {
            return Err(NotificationError::DuplicateView {
                kind: kind.to_string(),
            });
        }
        self.internal.insert(kind, view);
        Ok(())
    }

    pub fn view(&self, kind: EventKind) -> Option<Arc<dyn NotificationView>> {
        self.views.get(&kind).cloned()
    }

    pub fn internal_view(&self, kind: EventKind) -> Option<Arc<dyn InternalView>> {
        self.internal.get(&kind).cloned()
    }

    pub fn kinds(&self) -> Vec<EventKind> {
        let mut kinds: Vec<EventKind> = self.views.keys().copied().collect();
        kinds.sort();
        kinds
    }

    pub fn internal_kinds(&self) -> Vec<EventKind> {
        let mut kinds: Vec<EventKind> = self.internal.keys().copied().collect();
        kinds.sort();
        kinds
    }
}

// =============================================================================
// Built-in views
// =============================================================================

/// View with fixed wording and a per-event template context. The email type
/// is the base key suffixed with the recipient role.
struct StaticView {
    email_base: &'static str,
    wording: fn(Role) -> &'static str,
}

impl NotificationView for StaticView {
    fn render_sms(&self, role: Role) -> String {
        (self.wording)(role).to_string()
    }

    fn render_email(&self, event: &DomainEvent, role: Role) -> EmailRendering {
        EmailRendering {
            email_type: format!("{}_{}", self.email_base, role.email_suffix()),
            context: event_context(event),
        }
    }
}

fn builtin_views() -> Vec<(EventKind, StaticView)> {
    vec![
        (
            EventKind::VisitSubmitted,
            StaticView {
                email_base: "visit_submitted",
                wording: |_| "You have a new patient visit waiting.",
            },
        ),
        (
            EventKind::VisitRouted,
            StaticView {
                email_base: "visit_routed",
                wording: |_| "A patient has submitted a visit.",
            },
        ),
        (
            EventKind::TreatmentPlanActivated,
            StaticView {
                email_base: "treatment_plan_activated",
                wording: |role| match role {
                    Role::Patient => "Your doctor has reviewed your case.",
                    Role::Doctor | Role::Cc => "A treatment plan was created for a patient.",
                },
            },
        ),
        (
            EventKind::NewMessagePosted,
            StaticView {
                email_base: "new_message",
                wording: |_| "You have a new message.",
            },
        ),
        (
            EventKind::CaseAssigned,
            StaticView {
                email_base: "case_assigned",
                wording: |_| "A patient case has been assigned to you.",
            },
        ),
        (
            EventKind::RefillRequestCreated,
            StaticView {
                email_base: "refill_request_created",
                wording: |_| "You have a new refill request from a patient",
            },
        ),
        (
            EventKind::RxTransmissionError,
            StaticView {
                email_base: "rx_transmission_error",
                wording: |_| "There was an error routing prescription to pharmacy",
            },
        ),
    ]
}

/// Identifiers templates use to build deep links. Never account data.
fn event_context(event: &DomainEvent) -> Vec<Var> {
    match event {
        DomainEvent::VisitSubmitted(e) => {
            vec![Var::new("VisitID", e.visit_id), Var::new("CaseID", e.case_id)]
        }
        DomainEvent::VisitRouted(e) => vec![Var::new("VisitID", e.visit_id)],
        DomainEvent::TreatmentPlanActivated(e) => {
            vec![Var::new("TreatmentPlanID", e.treatment_plan_id)]
        }
        DomainEvent::NewMessagePosted(e) => vec![Var::new("CaseID", e.case_id)],
        DomainEvent::CaseAssigned(e) => vec![Var::new("CaseID", e.case_id)],
        DomainEvent::RefillRequestCreated(e) => {
            vec![Var::new("RefillRequestID", e.refill_request_id)]
        }
        DomainEvent::RxTransmissionError(_)
        | DomainEvent::VisitMarkedUnsuitable(_)
        | DomainEvent::PatientSignedUp(_)
        | DomainEvent::ParentalConsentCompleted(_)
        | DomainEvent::Send(_) => Vec::new(),
    }
}

struct VisitUnsuitableView;

impl InternalView for VisitUnsuitableView {
    fn render_email(&self, event: &DomainEvent) -> EmailRendering {
        let context = match event {
            DomainEvent::VisitMarkedUnsuitable(e) => vec![
                Var::new("PatientVisitID", e.visit_id),
                Var::new("CaseID", e.case_id),
                Var::new("DoctorID", e.doctor_id),
            ],
            _ => Vec::new(),
        };
        EmailRendering {
            email_type: "visit_unsuitable".to_string(),
            context,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use telehealth_shared::events::{TreatmentPlanActivated, VisitMarkedUnsuitable, VisitSubmitted};

    #[test]
    fn test_builtin_sms_texts() {
        let registry = ViewRegistry::builtin().unwrap();
        let cases = [
            (EventKind::VisitSubmitted, Role::Doctor, "You have a new patient visit waiting."),
            (EventKind::TreatmentPlanActivated, Role::Patient, "Your doctor has reviewed your case."),
            (EventKind::NewMessagePosted, Role::Patient, "You have a new message."),
            (EventKind::CaseAssigned, Role::Doctor, "A patient case has been assigned to you."),
            (
                EventKind::RefillRequestCreated,
                Role::Doctor,
                "You have a new refill request from a patient",
            ),
            (
                EventKind::RxTransmissionError,
                Role::Doctor,
                "There was an error routing prescription to pharmacy",
            ),
        ];
        for (kind, role, text) in cases {
            let view = registry.view(kind).unwrap();
            assert_eq!(view.render_sms(role), text, "{kind}");
            assert_eq!(view.render_push(role).short_message, text, "{kind}");
        }
    }

    #[test]
    fn test_treatment_plan_wording_depends_on_role() {
        let view = ViewRegistry::builtin()
            .unwrap()
            .view(EventKind::TreatmentPlanActivated)
            .unwrap();
        assert_eq!(
            view.render_sms(Role::Doctor),
            "A treatment plan was created for a patient."
        );
        let event = DomainEvent::TreatmentPlanActivated(TreatmentPlanActivated {
            patient_id: 1,
            doctor_id: 2,
            treatment_plan_id: 3,
        });
        assert_eq!(
            view.render_email(&event, Role::Patient).email_type,
            "treatment_plan_activated_patient"
        );
    }

    #[test]
    fn test_email_type_is_suffixed_with_role() {
        let registry = ViewRegistry::builtin().unwrap();
        let event = DomainEvent::VisitSubmitted(VisitSubmitted {
            patient_id: 1,
            doctor_id: 3,
            visit_id: 9,
            case_id: 4,
        });
        let rendering = registry
            .view(EventKind::VisitSubmitted)
            .unwrap()
            .render_email(&event, Role::Doctor);
        assert_eq!(rendering.email_type, "visit_submitted_doctor");
        assert_eq!(
            rendering.context,
            vec![Var::new("VisitID", 9), Var::new("CaseID", 4)]
        );
    }

    #[test]
    fn test_duplicate_registration_fails() {
        let mut registry = ViewRegistry::builtin().unwrap();
        let err = registry
            .register(
                EventKind::CaseAssigned,
                Arc::new(StaticView {
                    email_base: "case_assigned",
                    wording: |_| "again",
                }),
            )
            .unwrap_err();
        assert_eq!(err.error_code(), "DUPLICATE_VIEW");

        let err = registry
            .register_internal(EventKind::VisitMarkedUnsuitable, Arc::new(VisitUnsuitableView))
            .unwrap_err();
        assert_eq!(err.error_code(), "DUPLICATE_VIEW");
    }

    #[test]
    fn test_internal_view_for_unsuitable_visit() {
        let registry = ViewRegistry::builtin().unwrap();
        assert!(registry.view(EventKind::VisitMarkedUnsuitable).is_none());
        let event = DomainEvent::VisitMarkedUnsuitable(VisitMarkedUnsuitable {
            patient_id: 1,
            doctor_id: 2,
            visit_id: 77,
            case_id: 5,
        });
        let rendering = registry
            .internal_view(EventKind::VisitMarkedUnsuitable)
            .unwrap()
            .render_email(&event);
        assert_eq!(rendering.email_type, "visit_unsuitable");
        assert_eq!(rendering.context[0], Var::new("PatientVisitID", 77));
    }

    #[test]
    fn test_registered_kinds() {
        let registry = ViewRegistry::builtin().unwrap();
        assert_eq!(registry.kinds().len(), 7);
        assert_eq!(registry.internal_kinds(), vec![EventKind::VisitMarkedUnsuitable]);
    }
}
