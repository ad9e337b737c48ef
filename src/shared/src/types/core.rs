//! Core identity and contact types

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

// =============================================================================
// Parse errors
// =============================================================================

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("invalid {kind}: {value:?}")]
pub struct ParseError {
    pub kind: &'static str,
    pub value: String,
}

impl ParseError {
    fn new(kind: &'static str, value: &str) -> Self {
        Self {
            kind,
            value: value.to_string(),
        }
    }
}

// =============================================================================
// Identities
// =============================================================================

/// Opaque account identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AccountId(pub i64);

impl AccountId {
    /// Reserved id used for system-addressed mail such as support alerts.
    pub const SYSTEM: AccountId = AccountId(0);
}

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for AccountId {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim()
            .parse::<i64>()
            .ok()
            .filter(|id| *id > 0)
            .map(AccountId)
            .ok_or_else(|| ParseError::new("account id", s))
    }
}

impl From<i64> for AccountId {
    fn from(id: i64) -> Self {
        AccountId(id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Role {
    Patient,
    Doctor,
    /// Care coordinator, shown to clients as "MA".
    #[serde(rename = "MA")]
    Cc,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Patient => "PATIENT",
            Role::Doctor => "DOCTOR",
            Role::Cc => "MA",
        }
    }

    /// Lowercase suffix appended to email types rendered for this role.
    pub fn email_suffix(&self) -> &'static str {
        match self {
            Role::Patient => "patient",
            Role::Doctor => "doctor",
            Role::Cc => "ma",
        }
    }

    pub fn is_provider(&self) -> bool {
        matches!(self, Role::Doctor | Role::Cc)
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "PATIENT" => Ok(Role::Patient),
            "DOCTOR" => Ok(Role::Doctor),
            "MA" | "CC" => Ok(Role::Cc),
            _ => Err(ParseError::new("role", s)),
        }
    }
}

/// Reference to a person in a given role. Person ids are scoped by role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PersonRef {
    pub role: Role,
    pub id: i64,
}

impl PersonRef {
    pub fn patient(id: i64) -> Self {
        Self {
            role: Role::Patient,
            id,
        }
    }

    pub fn doctor(id: i64) -> Self {
        Self {
            role: Role::Doctor,
            id,
        }
    }
}

// =============================================================================
// Devices and channels
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Platform {
    #[serde(rename = "iOS")]
    Ios,
    #[serde(rename = "Android")]
    Android,
}

impl Platform {
    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Ios => "iOS",
            Platform::Android => "Android",
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Platform {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ios" => Ok(Platform::Ios),
            "android" => Ok(Platform::Android),
            _ => Err(ParseError::new("platform", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Channel {
    Email,
    Sms,
    Push,
}

impl Channel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Email => "EMAIL",
            Channel::Sms => "SMS",
            Channel::Push => "PUSH",
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Channel {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "EMAIL" => Ok(Channel::Email),
            "SMS" => Ok(Channel::Sms),
            "PUSH" => Ok(Channel::Push),
            _ => Err(ParseError::new("channel", s)),
        }
    }
}

// =============================================================================
// Contact data
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhoneType {
    Cell,
    Home,
    Work,
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhoneNumber {
    pub phone: String,
    pub phone_type: PhoneType,
    #[serde(default)]
    pub verified: bool,
}

impl PhoneNumber {
    pub fn cell(phone: impl Into<String>) -> Self {
        Self {
            phone: phone.into(),
            phone_type: PhoneType::Cell,
            verified: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_platform_parsing_is_case_insensitive() {
        assert_eq!("iOS".parse::<Platform>().unwrap(), Platform::Ios);
        assert_eq!("ANDROID".parse::<Platform>().unwrap(), Platform::Android);
        assert!("blackberry".parse::<Platform>().is_err());
    }

    #[test]
    fn test_account_id_rejects_non_positive() {
        assert_eq!("42".parse::<AccountId>().unwrap(), AccountId(42));
        assert!("0".parse::<AccountId>().is_err());
        assert!("abc".parse::<AccountId>().is_err());
    }

    #[test]
    fn test_role_serialization() {
        assert_eq!(serde_json::to_string(&Role::Cc).unwrap(), "\"MA\"");
        assert_eq!(serde_json::to_string(&Role::Doctor).unwrap(), "\"DOCTOR\"");
        assert_eq!(Role::Doctor.email_suffix(), "doctor");
    }

    #[test]
    fn test_channel_round_trip_through_str() {
        for channel in [Channel::Email, Channel::Sms, Channel::Push] {
            assert_eq!(channel.as_str().parse::<Channel>().unwrap(), channel);
        }
    }
}
