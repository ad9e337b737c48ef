//! Per-channel senders
//!
//! - Push: fans one message out across every registered device
//! - SMS: first cell number on file
//! - Email: template sends with whitelist, opt-out and once-only filtering

use serde::Serialize;

pub mod email;
pub mod push;
pub mod sms;

pub use email::{EmailOptions, EmailOutcome, EmailSender, RecipientVars};
pub use push::{PushReport, PushSender};
pub use sms::SmsSender;

/// Information about a delivery channel, reported by the health endpoint
#[derive(Debug, Clone, Serialize)]
pub struct ChannelInfo {
    pub name: String,
    pub provider: String,
    pub enabled: bool,
    pub timeout_seconds: u64,
}
