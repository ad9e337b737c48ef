//! Client-facing request shapes for device registration

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::core::{ParseError, Platform};

/// Parsed `S-Version` header: `App;Type;Version;Build`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientVersion {
    pub app_type: String,
    pub app_environment: String,
    pub version: String,
    pub build: String,
}

impl FromStr for ClientVersion {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split(';').map(str::trim).collect();
        match parts.as_slice() {
            [app, env, version, build, ..] if !app.is_empty() && !env.is_empty() => Ok(Self {
                app_type: app.to_string(),
                app_environment: env.to_string(),
                version: version.to_string(),
                build: build.to_string(),
            }),
            [app, env] if !app.is_empty() && !env.is_empty() => Ok(Self {
                app_type: app.to_string(),
                app_environment: env.to_string(),
                version: String::new(),
                build: String::new(),
            }),
            _ => Err(ParseError {
                kind: "client version",
                value: s.to_string(),
            }),
        }
    }
}

/// Parsed `S-OS` header: `Platform;Version`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientOs {
    pub platform: Platform,
    pub version: String,
}

impl FromStr for ClientOs {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split(';').map(str::trim);
        let platform = parts.next().unwrap_or_default().parse::<Platform>()?;
        Ok(Self {
            platform,
            version: parts.next().unwrap_or_default().to_string(),
        })
    }
}

/// Parsed `S-Device` header: `Form;Model;Width;Height;Scale`. Only the form
/// factor and model are kept.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientDevice {
    pub form: String,
    pub model: String,
}

impl FromStr for ClientDevice {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split(';').map(str::trim);
        let form = parts.next().unwrap_or_default();
        if form.is_empty() {
            return Err(ParseError {
                kind: "client device",
                value: s.to_string(),
            });
        }
        Ok(Self {
            form: form.to_string(),
            model: parts.next().unwrap_or_default().to_string(),
        })
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DeviceTokenForm {
    pub device_token: String,
}

/// Whether the client has shown the OS push permission prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PromptStatus {
    #[default]
    Unprompted,
    Declined,
    Accepted,
}

impl fmt::Display for PromptStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PromptStatus::Unprompted => "UNPROMPTED",
            PromptStatus::Declined => "DECLINED",
            PromptStatus::Accepted => "ACCEPTED",
        };
        f.write_str(s)
    }
}

impl FromStr for PromptStatus {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "UNPROMPTED" => Ok(PromptStatus::Unprompted),
            "DECLINED" => Ok(PromptStatus::Declined),
            "ACCEPTED" => Ok(PromptStatus::Accepted),
            _ => Err(ParseError {
                kind: "prompt status",
                value: s.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PromptStatusForm {
    pub prompt_status: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_parse_client_headers() {
        let version: ClientVersion = "Patient;Feature;0.9.0;000105".parse().unwrap();
        assert_eq!(version.app_type, "Patient");
        assert_eq!(version.app_environment, "Feature");
        assert_eq!(version.build, "000105");

        let os: ClientOs = "iOS;7.1.1".parse().unwrap();
        assert_eq!(os.platform, Platform::Ios);

        let device: ClientDevice = "Phone;iPhone6,1;640;1136;2.0".parse().unwrap();
        assert_eq!(device.model, "iPhone6,1");
    }

    #[test]
    fn test_incomplete_headers_are_rejected() {
        assert!("Patient".parse::<ClientVersion>().is_err());
        assert!(";Feature;1.0;1".parse::<ClientVersion>().is_err());
        assert!("Windows;11".parse::<ClientOs>().is_err());
        assert!("".parse::<ClientDevice>().is_err());
    }

    #[test]
    fn test_prompt_status_parsing() {
        assert_eq!("accepted".parse::<PromptStatus>().unwrap(), PromptStatus::Accepted);
        assert!("maybe".parse::<PromptStatus>().is_err());
    }
}
