//! Shared type definitions
//!
//! `core` holds identities and contact data, `events` the domain events that
//! drive notifications and campaigns, `api` the client-facing request shapes.

pub mod api;
pub mod core;
pub mod events;

pub use api::{ClientDevice, ClientOs, ClientVersion, DeviceTokenForm, PromptStatus, PromptStatusForm};
pub use core::{
    AccountId, Channel, ParseError, PersonRef, PhoneNumber, PhoneType, Platform, Role,
};
pub use events::{DomainEvent, EventKind, SendEvent};
