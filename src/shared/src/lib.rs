//! Shared types for the telehealth notification services
//!
//! Identities, communication channels, the domain events published on the
//! in-process bus and the HTTP request shapes used by device registration.

pub mod config;
pub mod types;

pub use config::{Environment, ServerConfig};
pub use types::*;
