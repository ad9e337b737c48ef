//! Error handling for the notification service
//!
//! Every fallible operation in the crate returns [`NotificationError`]. HTTP
//! handlers convert it into a JSON envelope with a stable error code.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use telehealth_shared::{ParseError, Platform};
use thiserror::Error;

/// Result type alias for notification service operations
pub type Result<T> = std::result::Result<T, NotificationError>;

/// Main error type for the notification service
#[derive(Error, Debug)]
pub enum NotificationError {
    /// Directory (storage) failures
    #[error("Directory error: {message}")]
    Directory { message: String },

    /// Coordination lock failures
    #[error("Lock error: {message}")]
    Lock { message: String },

    /// Email delivery errors
    #[error("Email error: {message}")]
    Email { message: String },

    /// Error body returned by the email template provider
    #[error("Template provider error: {status} {code} {name}: {message}")]
    TemplateProvider {
        status: String,
        code: i64,
        name: String,
        message: String,
    },

    /// SMS delivery errors
    #[error("SMS error: {message}")]
    Sms { message: String },

    /// Push notification errors
    #[error("Push notification error: {message}")]
    Push { message: String },

    /// The push provider reports the endpoint as disabled
    #[error("Push endpoint disabled: {endpoint}")]
    EndpointDisabled { endpoint: String },

    /// No application is configured for the device's platform and app
    #[error("No notification config for {platform} {app_type} {app_environment}")]
    UnknownNotificationConfig {
        platform: Platform,
        app_type: String,
        app_environment: String,
    },

    /// A view was registered twice for the same event kind
    #[error("Duplicate view registered for event kind {kind}")]
    DuplicateView { kind: String },

    /// Configuration errors
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// Validation errors
    #[error("Validation error: {field}: {message}")]
    Validation { field: String, message: String },

    /// Missing or invalid caller identity
    #[error("Authentication error: {message}")]
    Auth { message: String },

    /// Not found errors
    #[error("Resource not found: {resource}")]
    NotFound { resource: String },

    /// Timeout errors
    #[error("Operation timed out: {operation}")]
    Timeout { operation: String },

    /// Network/connection errors
    #[error("Network error: {message}")]
    Network { message: String },

    /// Serialization/deserialization errors
    #[error("Serialization error: {message}")]
    Serialization { message: String },

    /// Opt-out link signing errors
    #[error("Signing error: {message}")]
    Signing { message: String },

    /// Internal service errors
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl NotificationError {
    /// Get the HTTP status code that should be returned for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            NotificationError::Validation { .. } => StatusCode::BAD_REQUEST,
            NotificationError::Auth { .. } => StatusCode::UNAUTHORIZED,
            NotificationError::NotFound { .. } => StatusCode::NOT_FOUND,
            NotificationError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            NotificationError::Email { .. }
            | NotificationError::TemplateProvider { .. }
            | NotificationError::Sms { .. }
            | NotificationError::Push { .. }
            | NotificationError::EndpointDisabled { .. }
            | NotificationError::Network { .. } => StatusCode::BAD_GATEWAY,
            NotificationError::Directory { .. }
            | NotificationError::Lock { .. }
            | NotificationError::UnknownNotificationConfig { .. }
            | NotificationError::DuplicateView { .. }
            | NotificationError::Config { .. }
            | NotificationError::Serialization { .. }
            | NotificationError::Signing { .. }
            | NotificationError::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get the error code for API responses
    pub fn error_code(&self) -> &'static str {
        match self {
            NotificationError::Directory { .. } => "DIRECTORY_ERROR",
            NotificationError::Lock { .. } => "LOCK_ERROR",
            NotificationError::Email { .. } => "EMAIL_ERROR",
            NotificationError::TemplateProvider { .. } => "TEMPLATE_PROVIDER_ERROR",
            NotificationError::Sms { .. } => "SMS_ERROR",
            NotificationError::Push { .. } => "PUSH_ERROR",
            NotificationError::EndpointDisabled { .. } => "ENDPOINT_DISABLED",
            NotificationError::UnknownNotificationConfig { .. } => "UNKNOWN_NOTIFICATION_CONFIG",
            NotificationError::DuplicateView { .. } => "DUPLICATE_VIEW",
            NotificationError::Config { .. } => "CONFIG_ERROR",
            NotificationError::Validation { .. } => "VALIDATION_ERROR",
            NotificationError::Auth { .. } => "AUTH_ERROR",
            NotificationError::NotFound { .. } => "NOT_FOUND",
            NotificationError::Timeout { .. } => "TIMEOUT",
            NotificationError::Network { .. } => "NETWORK_ERROR",
            NotificationError::Serialization { .. } => "SERIALIZATION_ERROR",
            NotificationError::Signing { .. } => "SIGNING_ERROR",
            NotificationError::Internal { .. } => "INTERNAL_ERROR",
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            NotificationError::Directory { .. }
                | NotificationError::Lock { .. }
                | NotificationError::Email { .. }
                | NotificationError::Sms { .. }
                | NotificationError::Push { .. }
                | NotificationError::Timeout { .. }
                | NotificationError::Network { .. }
        )
    }
}

impl IntoResponse for NotificationError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let error_code = self.error_code();
        let message = self.to_string();

        if status.is_server_error() {
            tracing::error!(code = error_code, "{}", message);
        }

        let body = Json(json!({
            "error": {
                "code": error_code,
                "message": message,
                "status": status.as_u16()
            }
        }));

        (status, body).into_response()
    }
}

// Conversion implementations for external error types

impl From<redis::RedisError> for NotificationError {
    fn from(err: redis::RedisError) -> Self {
        NotificationError::Lock {
            message: err.to_string(),
        }
    }
}

impl From<reqwest::Error> for NotificationError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            NotificationError::Timeout {
                operation: "HTTP request".to_string(),
            }
        } else {
            NotificationError::Network {
                message: err.to_string(),
            }
        }
    }
}

impl From<serde_json::Error> for NotificationError {
    fn from(err: serde_json::Error) -> Self {
        NotificationError::Serialization {
            message: err.to_string(),
        }
    }
}

impl From<config::ConfigError> for NotificationError {
    fn from(err: config::ConfigError) -> Self {
        NotificationError::Config {
            message: err.to_string(),
        }
    }
}

impl From<tokio::time::error::Elapsed> for NotificationError {
    fn from(err: tokio::time::error::Elapsed) -> Self {
        NotificationError::Timeout {
            operation: err.to_string(),
        }
    }
}

impl From<ParseError> for NotificationError {
    fn from(err: ParseError) -> Self {
        NotificationError::Validation {
            field: err.kind.to_string(),
            message: err.to_string(),
        }
    }
}

impl From<url::ParseError> for NotificationError {
    fn from(err: url::ParseError) -> Self {
        NotificationError::Config {
            message: format!("invalid url: {}", err),
        }
    }
}

// Utility functions for creating specific error types

impl NotificationError {
    pub fn directory<S: Into<String>>(message: S) -> Self {
        Self::Directory {
            message: message.into(),
        }
    }

    pub fn email<S: Into<String>>(message: S) -> Self {
        Self::Email {
            message: message.into(),
        }
    }

    pub fn sms<S: Into<String>>(message: S) -> Self {
        Self::Sms {
            message: message.into(),
        }
    }

    pub fn push<S: Into<String>>(message: S) -> Self {
        Self::Push {
            message: message.into(),
        }
    }

    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    pub fn validation<F: Into<String>, S: Into<String>>(field: F, message: S) -> Self {
        Self::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    pub fn auth<S: Into<String>>(message: S) -> Self {
        Self::Auth {
            message: message.into(),
        }
    }

    pub fn not_found<S: Into<String>>(resource: S) -> Self {
        Self::NotFound {
            resource: resource.into(),
        }
    }

    pub fn timeout<S: Into<String>>(operation: S) -> Self {
        Self::Timeout {
            operation: operation.into(),
        }
    }

    pub fn signing<S: Into<String>>(message: S) -> Self {
        Self::Signing {
            message: message.into(),
        }
    }

    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_status_codes() {
        assert_eq!(
            NotificationError::validation("device_token", "missing").status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            NotificationError::UnknownNotificationConfig {
                platform: Platform::Ios,
                app_type: "patient".into(),
                app_environment: "demo".into(),
            }
            .status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            NotificationError::auth("no account").status_code(),
            StatusCode::UNAUTHORIZED
        );
    }

    #[test]
    fn test_retryable_errors() {
        assert!(NotificationError::sms("gateway down").is_retryable());
        assert!(!NotificationError::validation("f", "bad").is_retryable());
        assert!(!NotificationError::EndpointDisabled {
            endpoint: "ep".into()
        }
        .is_retryable());
    }

    #[test]
    fn test_parse_error_becomes_validation() {
        let err: NotificationError = "windows".parse::<Platform>().unwrap_err().into();
        assert_eq!(err.error_code(), "VALIDATION_ERROR");
    }
}
