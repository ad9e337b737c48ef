//! HTTP routes for the notification service
//!
//! - Device registration, prompt status and sign-out under `/v1`
//! - Health and metrics endpoints

use crate::handlers::{devices_handler, health_handler, metrics_handler, AppState};
use crate::NotificationService;

use axum::{
    routing::{delete, get, post, put},
    Router,
};
use std::time::Duration;
use tower::ServiceBuilder;
use tower_http::{
    compression::CompressionLayer, cors::CorsLayer, timeout::TimeoutLayer, trace::TraceLayer,
};

/// Build the main router for the notification service
pub fn create_router(service: NotificationService) -> Router {
    let timeout = Duration::from_secs(service.config().server.timeout_seconds);
    let state = AppState { service };

    Router::new()
        .merge(create_api_router())
        .merge(create_health_router())
        .with_state(state)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive())
                .layer(CompressionLayer::new())
                .layer(TimeoutLayer::new(timeout))
                .into_inner(),
        )
}

fn create_api_router() -> Router<AppState> {
    Router::new()
        .route(
            "/v1/notification/token",
            post(devices_handler::register_device),
        )
        .route(
            "/v1/notification/prompt_status",
            put(devices_handler::set_prompt_status),
        )
        .route(
            "/v1/notification/device/:device_id",
            delete(devices_handler::remove_device),
        )
        .route("/v1/logout", post(devices_handler::logout))
}

fn create_health_router() -> Router<AppState> {
    Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::{
        ACCOUNT_HEADER, DEVICE_HEADER, DEVICE_ID_HEADER, OS_HEADER, VERSION_HEADER,
    };
    use crate::directory::Directory;
    use crate::lock::LocalLock;
    use crate::memory::{AccountRecord, MemoryDirectory};
    use crate::{DispatcherConfig, NotificationConfig, Providers};
    use axum::body::Body;
    use axum::http::{header, Method, Request, StatusCode};
    use std::sync::Arc;
    use telehealth_shared::{AccountId, Platform, PromptStatus};
    use tokio_util::sync::CancellationToken;
    use tower::ServiceExt;

    fn service(directory: Arc<MemoryDirectory>) -> NotificationService {
        let mut config = DispatcherConfig::default();
        config.push.applications.push(NotificationConfig {
            platform: Platform::Ios,
            app_type: "patient".to_string(),
            app_environment: "prod".to_string(),
            application_endpoint: "arn:patient".to_string(),
            sandbox: false,
        });
        NotificationService::with_parts(
            config,
            directory,
            Providers::recording(),
            Arc::new(LocalLock::new(CancellationToken::new())),
        )
        .unwrap()
    }

    fn register_request(account: Option<&str>, app: &str, token: &str) -> Request<Body> {
        let mut builder = Request::builder()
            .method(Method::POST)
            .uri("/v1/notification/token")
            .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
            .header(VERSION_HEADER, format!("{};prod;1.2.0;301", app))
            .header(OS_HEADER, "iOS;17.2")
            .header(DEVICE_HEADER, "Phone;iPhone15,2;1179;2556;3")
            .header(DEVICE_ID_HEADER, "device-1");
        if let Some(account) = account {
            builder = builder.header(ACCOUNT_HEADER, account);
        }
        builder
            .body(Body::from(format!("device_token={}", token)))
            .unwrap()
    }

    #[tokio::test]
    async fn test_register_device() {
        let directory = Arc::new(MemoryDirectory::new());
        directory.add_account(AccountRecord::patient(1, 10, "p@example.test"));
        let app = create_router(service(directory.clone()));

        let response = app
            .oneshot(register_request(Some("1"), "patient", "abc"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let devices = directory.push_configs_for_account(AccountId(1)).await.unwrap();
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].device_token, "abc");
        assert_eq!(devices[0].push_endpoint, "arn:patient/endpoint/abc");
    }

    #[tokio::test]
    async fn test_register_rejects_bad_requests() {
        let directory = Arc::new(MemoryDirectory::new());
        let app = create_router(service(directory));

        let unauthenticated = app
            .clone()
            .oneshot(register_request(None, "patient", "abc"))
            .await
            .unwrap();
        assert_eq!(unauthenticated.status(), StatusCode::UNAUTHORIZED);

        let empty_token = app
            .clone()
            .oneshot(register_request(Some("1"), "patient", ""))
            .await
            .unwrap();
        assert_eq!(empty_token.status(), StatusCode::BAD_REQUEST);

        let unknown_app = app
            .oneshot(register_request(Some("1"), "doctor", "abc"))
            .await
            .unwrap();
        assert_eq!(unknown_app.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn test_missing_device_header() {
        let app = create_router(service(Arc::new(MemoryDirectory::new())));
        let request = Request::builder()
            .method(Method::POST)
            .uri("/v1/notification/token")
            .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
            .header(ACCOUNT_HEADER, "1")
            .header(VERSION_HEADER, "patient;prod;1.0;1")
            .body(Body::from("device_token=abc"))
            .unwrap();

        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_prompt_status() {
        let directory = Arc::new(MemoryDirectory::new());
        let app = create_router(service(directory.clone()));
        let request = |status: &str| {
            Request::builder()
                .method(Method::PUT)
                .uri("/v1/notification/prompt_status")
                .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
                .header(ACCOUNT_HEADER, "4")
                .body(Body::from(format!("prompt_status={}", status)))
                .unwrap()
        };

        let ok = app.clone().oneshot(request("ACCEPTED")).await.unwrap();
        assert_eq!(ok.status(), StatusCode::OK);
        assert_eq!(
            directory.push_prompt_status(AccountId(4)).await.unwrap(),
            PromptStatus::Accepted
        );

        let bad = app.oneshot(request("MAYBE")).await.unwrap();
        assert_eq!(bad.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_logout_removes_devices() {
        let directory = Arc::new(MemoryDirectory::new());
        let app = create_router(service(directory.clone()));
        app.clone()
            .oneshot(register_request(Some("1"), "patient", "abc"))
            .await
            .unwrap();

        let response = app
            .oneshot(
                Request::builder()
                    .method(Method::POST)
                    .uri("/v1/logout")
                    .header(ACCOUNT_HEADER, "1")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert!(directory
            .push_configs_for_account(AccountId(1))
            .await
            .unwrap()
            .is_empty());
        assert!(directory
            .communication_preferences(AccountId(1))
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_health_and_metrics() {
        let app = create_router(service(Arc::new(MemoryDirectory::new())));

        let health = app
            .clone()
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(health.status(), StatusCode::OK);

        let metrics = app
            .oneshot(Request::get("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(metrics.status(), StatusCode::OK);
        let body = axum::body::to_bytes(metrics.into_body(), usize::MAX)
            .await
            .unwrap();
        let text = String::from_utf8(body.to_vec()).unwrap();
        assert!(text.contains("notification_push_sent_total 0"));
    }
}
