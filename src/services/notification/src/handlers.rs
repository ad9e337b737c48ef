//! Request handlers for the notification service
//!
//! - Device registration and push prompt status
//! - Device and account sign-out
//! - Health and metrics

use crate::devices::DeviceHeaders;
use crate::error::{NotificationError, Result};
use crate::NotificationService;
use telehealth_shared::{AccountId, DeviceTokenForm, PromptStatus, PromptStatusForm};

use axum::{
    async_trait,
    extract::{rejection::FormRejection, FromRequestParts, Path, State},
    http::{header, request::Parts, HeaderMap},
    response::IntoResponse,
    Form, Json,
};
use serde_json::json;
use tracing::{error, info};

/// Set by the API gateway after authenticating the caller
pub const ACCOUNT_HEADER: &str = "X-Account-ID";
pub const VERSION_HEADER: &str = "S-Version";
pub const OS_HEADER: &str = "S-OS";
pub const DEVICE_HEADER: &str = "S-Device";
pub const DEVICE_ID_HEADER: &str = "S-Device-ID";

#[derive(Clone)]
pub struct AppState {
    pub service: NotificationService,
}

/// Account of the authenticated caller
#[derive(Debug, Clone, Copy)]
pub struct AuthenticatedAccount(pub AccountId);

#[async_trait]
impl<S> FromRequestParts<S> for AuthenticatedAccount
where
    S: Send + Sync,
{
    type Rejection = NotificationError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self> {
        let value = parts
            .headers
            .get(ACCOUNT_HEADER)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| NotificationError::auth("missing account"))?;
        let account = value
            .parse::<AccountId>()
            .map_err(|_| NotificationError::auth("invalid account"))?;
        Ok(Self(account))
    }
}

fn header_value<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn form_error(field: &str, rejection: FormRejection) -> NotificationError {
    NotificationError::validation(field, rejection.body_text())
}

pub mod devices_handler {
    use super::*;

    /// Register the caller's device token for push
    pub async fn register_device(
        State(state): State<AppState>,
        AuthenticatedAccount(account): AuthenticatedAccount,
        headers: HeaderMap,
        form: std::result::Result<Form<DeviceTokenForm>, FormRejection>,
    ) -> Result<impl IntoResponse> {
        let device_headers = DeviceHeaders::parse(
            header_value(&headers, VERSION_HEADER),
            header_value(&headers, OS_HEADER),
            header_value(&headers, DEVICE_HEADER),
            header_value(&headers, DEVICE_ID_HEADER),
        )?;
        let Form(form) = form.map_err(|e| form_error("device_token", e))?;

        match state
            .service
            .devices()
            .register(account, &device_headers, &form.device_token)
            .await
        {
            Ok(config) => {
                info!(
                    account_id = %account,
                    device_token = %config.device_token,
                    platform = %config.platform,
                    "Device registered"
                );
                Ok(Json(json!({ "success": true })))
            }
            Err(e) => {
                error!(account_id = %account, error = %e, "Device registration failed");
                Err(e)
            }
        }
    }

    /// Record whether the caller has seen the push permission prompt
    pub async fn set_prompt_status(
        State(state): State<AppState>,
        AuthenticatedAccount(account): AuthenticatedAccount,
        form: std::result::Result<Form<PromptStatusForm>, FormRejection>,
    ) -> Result<impl IntoResponse> {
        let Form(form) = form.map_err(|e| form_error("prompt_status", e))?;
        let status: PromptStatus = form.prompt_status.parse()?;

        state
            .service
            .devices()
            .set_prompt_status(account, status)
            .await?;
        Ok(Json(json!({ "success": true, "prompt_status": status })))
    }

    /// Remove every registration made from one physical device
    pub async fn remove_device(
        State(state): State<AppState>,
        AuthenticatedAccount(account): AuthenticatedAccount,
        Path(device_id): Path<String>,
    ) -> Result<impl IntoResponse> {
        let removed = state
            .service
            .devices()
            .remove_for_device_id(&device_id)
            .await?;
        info!(account_id = %account, device_id = %device_id, removed, "Device signed out");
        Ok(Json(json!({ "success": true, "removed": removed })))
    }

    /// Sign the caller out of push on every device
    pub async fn logout(
        State(state): State<AppState>,
        AuthenticatedAccount(account): AuthenticatedAccount,
    ) -> Result<impl IntoResponse> {
        let removed = state
            .service
            .devices()
            .remove_all_for_account(account)
            .await?;
        info!(account_id = %account, removed, "Account logged out");
        Ok(Json(json!({ "success": true, "removed": removed })))
    }
}

/// Health check handler
pub async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let service = &state.service;
    Json(json!({
        "status": "healthy",
        "service": "notification",
        "version": env!("CARGO_PKG_VERSION"),
        "environment": service.config().environment,
        "channels": service.channel_info(),
        "campaigns": {
            "enabled": service.config().campaigns.enabled,
            "lock_held": service.campaigns().lock().locked(),
        },
    }))
}

/// Prometheus text exposition of the delivery counters
pub async fn metrics_handler(State(state): State<AppState>) -> Result<impl IntoResponse> {
    let body = state.service.metrics().export_metrics()?;
    Ok((
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        body,
    ))
}
