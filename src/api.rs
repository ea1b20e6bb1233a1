//! HTTP surface of the relay server.
//!
//! - `GET /health`: settings store reachability
//! - `GET /settings`: resolved relay settings (password omitted)
//! - `POST /settings`: write one admin setting (`key`, `value` form fields)
//! - `POST /api/v1/events`: forward a host event description to the listener
//!
//! Everything but `/health` requires `Authorization: Bearer <api key>`.

use crate::inspect::DynamicObject;
use crate::listener::DispatchListener;
use crate::settings::{is_admin_key, ConfigResolver};
use crate::APP_ID;
use axum::{
    extract::{Request, State},
    http::{header, HeaderMap, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Form, Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{error, info, warn};

/// Header carrying the acting user of a forwarded event
pub const USER_ID_HEADER: &str = "X-User-Id";

/// Shared state for all handlers.
#[derive(Clone)]
pub struct ApiState {
    pub config: ConfigResolver,
    pub listener: DispatchListener,
    pub api_key: String,
}

/// Form body for `POST /settings`.
#[derive(Debug, Deserialize)]
pub struct SettingForm {
    #[serde(default)]
    pub key: String,
    #[serde(default)]
    pub value: String,
}

/// Build the HTTP router.
pub fn router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/settings", get(get_settings).post(save_setting))
        .route("/api/v1/events", post(ingest_event))
        .layer(middleware::from_fn_with_state(state.clone(), auth_middleware))
        .with_state(state)
}

async fn auth_middleware(
    State(state): State<Arc<ApiState>>,
    req: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    if req.uri().path() == "/health" {
        return Ok(next.run(req).await);
    }

    let auth_header = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|header| header.to_str().ok());

    match auth_header.and_then(|h| h.strip_prefix("Bearer ")) {
        Some(token) if token == state.api_key => Ok(next.run(req).await),
        Some(_) => {
            warn!("Invalid API Key attempt");
            Err(StatusCode::UNAUTHORIZED)
        }
        None => {
            warn!("Missing or malformed Authorization header");
            Err(StatusCode::UNAUTHORIZED)
        }
    }
}

async fn health_check(State(state): State<Arc<ApiState>>) -> (StatusCode, Json<Value>) {
    match state.config.is_enabled().await {
        Ok(enabled) => (
            StatusCode::OK,
            Json(json!({ "status": "ok", "settings": "reachable", "enabled": enabled })),
        ),
        Err(e) => {
            error!(error = %e, "Health check could not read settings");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({ "status": "error", "settings": "unreachable" })),
            )
        }
    }
}

async fn get_settings(State(state): State<Arc<ApiState>>) -> Response {
    match state.config.snapshot().await {
        Ok(settings) => (StatusCode::OK, Json(settings)).into_response(),
        Err(e) => {
            error!(error = %e, "Failed to read settings");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "status": "error", "message": "settings unavailable" })),
            )
                .into_response()
        }
    }
}

async fn save_setting(
    State(state): State<Arc<ApiState>>,
    Form(form): Form<SettingForm>,
) -> (StatusCode, Json<Value>) {
    if !is_admin_key(&form.key) {
        warn!(key = %form.key, "Rejected setting write");
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "status": "error", "message": "invalid key" })),
        );
    }

    match state
        .config
        .store()
        .set_value(APP_ID, &form.key, &form.value)
        .await
    {
        Ok(()) => {
            info!(key = %form.key, "Setting updated");
            (StatusCode::OK, Json(json!({ "status": "ok" })))
        }
        Err(e) => {
            error!(error = %e, key = %form.key, "Failed to store setting");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "status": "error", "message": "settings unavailable" })),
            )
        }
    }
}

async fn ingest_event(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
    Json(description): Json<Value>,
) -> (StatusCode, Json<Value>) {
    let Some(event) = DynamicObject::from_description(&description) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "status": "error", "message": "missing event class" })),
        );
    };

    let principal = headers
        .get(USER_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(|v| v.to_string());

    state.listener.on_event_as(&event, &principal).await;

    (StatusCode::ACCEPTED, Json(json!({ "status": "accepted" })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::MemoryJobQueue;
    use crate::settings::{MemorySettingStore, SettingStore};
    use axum::body::Body;
    use axum::http::Request;
    use std::collections::HashMap;
    use tower::ServiceExt; // for `oneshot`

    const API_KEY: &str = "test-key";

    fn test_app() -> (Router, Arc<MemorySettingStore>, Arc<MemoryJobQueue>) {
        let store = Arc::new(MemorySettingStore::new());
        let queue = Arc::new(MemoryJobQueue::new());
        let config =
            ConfigResolver::with_env(store.clone(), Arc::new(HashMap::<String, String>::new()));
        let state = Arc::new(ApiState {
            listener: DispatchListener::new(config.clone(), queue.clone()),
            config,
            api_key: API_KEY.to_string(),
        });
        (router(state), store, queue)
    }

    fn form_request(body: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/settings")
            .header(header::AUTHORIZATION, format!("Bearer {}", API_KEY))
            .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn json_body(response: Response) -> Value {
        let body = axum::body::to_bytes(response.into_body(), 1024 * 1024)
            .await
            .unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    #[tokio::test]
    async fn test_health_needs_no_auth() {
        let (app, _, _) = test_app();

        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await["status"], "ok");
    }

    #[tokio::test]
    async fn test_settings_require_auth() {
        let (app, _, _) = test_app();

        let response = app
            .oneshot(Request::builder().uri("/settings").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_save_allowed_setting() {
        let (app, store, _) = test_app();

        let response = app.oneshot(form_request("key=port&value=5673")).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await, json!({"status": "ok"}));
        assert_eq!(
            store.get_value(APP_ID, "port").await.unwrap(),
            Some("5673".to_string())
        );
    }

    #[tokio::test]
    async fn test_enabled_keys_are_rejected() {
        for body in ["key=enabled&value=0", "key=publish_enabled&value=0", "value=1"] {
            let (app, store, _) = test_app();

            let response = app.oneshot(form_request(body)).await.unwrap();

            assert_eq!(response.status(), StatusCode::BAD_REQUEST);
            assert_eq!(
                json_body(response).await,
                json!({"status": "error", "message": "invalid key"})
            );
            assert_eq!(store.get_value(APP_ID, "publish_enabled").await.unwrap(), None);
        }
    }

    #[tokio::test]
    async fn test_get_settings_omits_password() {
        let (app, _, _) = test_app();

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/settings")
                    .header(header::AUTHORIZATION, format!("Bearer {}", API_KEY))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        let body = json_body(response).await;
        assert_eq!(body["exchange"], "nextcloud.events");
        assert_eq!(body["port"], 5672);
        assert!(body.get("password").is_none());
    }

    #[tokio::test]
    async fn test_ingest_event_is_queued() {
        let (app, _, queue) = test_app();
        let description = json!({
            "class": "OCP\\User\\Events\\UserCreatedEvent",
            "interfaces": ["OCP\\EventDispatcher\\Event"],
            "values": {"getUid": "u123", "stopPropagation": null}
        });

        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/v1/events")
                    .header(header::AUTHORIZATION, format!("Bearer {}", API_KEY))
                    .header(header::CONTENT_TYPE, "application/json")
                    .header(USER_ID_HEADER, "admin")
                    .body(Body::from(description.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::ACCEPTED);

        let jobs = queue.drain();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].argument["meta"]["currentUserId"], "admin");
        assert!(jobs[0].argument["event"]["values"].get("stopPropagation").is_none());
    }

    #[tokio::test]
    async fn test_ingest_rejects_missing_class() {
        let (app, _, queue) = test_app();

        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/v1/events")
                    .header(header::AUTHORIZATION, format!("Bearer {}", API_KEY))
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(r#"{"values": {}}"#))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(queue.is_empty());
    }
}
