//! Webhook intake.
//!
//! - `ANY /{id}` and `ANY /{id}/{*rest}` — hand the request body to the
//!   session that claimed `{id}`
//!
//! The identifier is looked up before the body is read, so requests for
//! unknown identifiers are rejected without buffering anything. Bodies are
//! capped at `http.max_payload_bytes` and the enqueue waits at most
//! `http.delivery_timeout_ms` for a slow session.

use std::time::SystemTime;

use axum::{
    body::Body,
    extract::{Path, State},
    http::{header, HeaderMap, Method, StatusCode},
    response::{IntoResponse, Response},
};
use bytes::Bytes;
use http_body_util::{BodyExt, LengthLimitError, Limited};
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::relay::{DeliveryError, Payload};
use crate::AppState;

/// Path parameters; `rest` is empty for the bare `/{id}` route.
#[derive(Deserialize)]
pub struct WebhookPath {
    pub id: String,
    #[serde(default)]
    pub rest: String,
}

/// Client-visible failures, rendered as plain text.
#[derive(Debug, thiserror::Error)]
pub enum WebhookError {
    /// `400` — nobody holds this identifier (never claimed or already released).
    #[error("client id not found")]
    UnknownId,
    /// `413` — body larger than `http.max_payload_bytes`.
    #[error("payload exceeds {0} bytes")]
    PayloadTooLarge(usize),
    /// `400` — the body stream failed mid-read.
    #[error("failed to read request body: {0}")]
    UnreadableBody(String),
    /// `503` — the session did not drain its queue in time. Safe to retry.
    #[error("delivery timed out: the session is not reading")]
    DeliveryTimeout,
}

impl From<DeliveryError> for WebhookError {
    fn from(e: DeliveryError) -> Self {
        match e {
            // A release racing this request looks the same to the caller as
            // an identifier that never existed.
            DeliveryError::NotFound | DeliveryError::Closed => Self::UnknownId,
            DeliveryError::Timeout(_) => Self::DeliveryTimeout,
        }
    }
}

impl IntoResponse for WebhookError {
    fn into_response(self) -> Response {
        let status = match self {
            Self::UnknownId | Self::UnreadableBody(_) => StatusCode::BAD_REQUEST,
            Self::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            Self::DeliveryTimeout => StatusCode::SERVICE_UNAVAILABLE,
        };
        (status, self.to_string()).into_response()
    }
}

/// `ANY /{id}[/{*rest}]` — deliver the request body to the session.
///
/// # Errors
///
/// - `400 Bad Request` — unknown identifier, or unreadable body
/// - `413 Payload Too Large` — body over the configured cap
/// - `503 Service Unavailable` — session queue stayed full past the timeout
pub async fn webhook(
    State(state): State<AppState>,
    Path(path): Path<WebhookPath>,
    method: Method,
    headers: HeaderMap,
    body: Body,
) -> Result<StatusCode, WebhookError> {
    let Ok(channel) = state.registry.lookup(&path.id) else {
        debug!(id = %path.id, "Webhook for unknown identifier");
        return Err(WebhookError::UnknownId);
    };

    let body = read_body(&headers, body, state.config.http.max_payload_bytes).await?;
    let payload = Payload {
        body,
        method: method.to_string(),
        path: path.rest,
        content_type: headers
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string),
        received_at: SystemTime::now(),
    };
    let bytes = payload.len();

    match channel
        .deliver(payload, state.config.http.delivery_timeout())
        .await
    {
        Ok(()) => {
            info!(id = %path.id, bytes, %method, "Webhook delivered");
            Ok(StatusCode::OK)
        }
        Err(e) => {
            warn!(id = %path.id, bytes, "Webhook delivery failed: {e}");
            Err(e.into())
        }
    }
}

/// Collect at most `limit` bytes, rejecting early on a too-large
/// `Content-Length`.
async fn read_body(headers: &HeaderMap, body: Body, limit: usize) -> Result<Bytes, WebhookError> {
    let declared = headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<usize>().ok());
    if declared.is_some_and(|len| len > limit) {
        return Err(WebhookError::PayloadTooLarge(limit));
    }

    match Limited::new(body, limit).collect().await {
        Ok(collected) => Ok(collected.to_bytes()),
        Err(e) if e.is::<LengthLimitError>() => Err(WebhookError::PayloadTooLarge(limit)),
        Err(e) => Err(WebhookError::UnreadableBody(e.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use axum::http::Request;
    use axum::Router;
    use tower::ServiceExt;

    use super::*;
    use crate::config::Config;
    use crate::relay::{Identifier, Registry};
    use crate::routes::router;

    fn app(registry: &Registry, config: Config) -> Router {
        router(AppState::new(Arc::new(config), registry.clone()))
    }

    async fn call(app: Router, method: Method, uri: &str, body: &'static str) -> (StatusCode, String) {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body))
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        (status, String::from_utf8_lossy(&bytes).into_owned())
    }

    #[tokio::test]
    async fn test_unknown_id_is_400() {
        let registry = Registry::new(8);
        let (status, body) = call(
            app(&registry, Config::default()),
            Method::POST,
            "/unknown-id",
            "{}",
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body, "client id not found");
    }

    #[tokio::test]
    async fn test_delivers_body_with_metadata() {
        let registry = Registry::new(8);
        let mut inbox = registry.register(Identifier::from("abc123")).unwrap();

        let (status, _) = call(
            app(&registry, Config::default()),
            Method::POST,
            "/abc123/github/push",
            "{\"x\":1}",
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let payload = inbox.recv().await.unwrap();
        assert_eq!(payload.body, Bytes::from_static(b"{\"x\":1}"));
        assert_eq!(payload.method, "POST");
        assert_eq!(payload.path, "github/push");
        assert_eq!(payload.content_type.as_deref(), Some("application/json"));
    }

    #[tokio::test]
    async fn test_any_method_on_bare_id() {
        let registry = Registry::new(8);
        let mut inbox = registry.register(Identifier::from("abc123")).unwrap();

        let (status, _) = call(
            app(&registry, Config::default()),
            Method::PUT,
            "/abc123",
            "hello",
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let payload = inbox.recv().await.unwrap();
        assert_eq!(payload.method, "PUT");
        assert!(payload.path.is_empty());
    }

    #[tokio::test]
    async fn test_released_id_is_400() {
        let registry = Registry::new(8);
        registry
            .register(Identifier::from("abc123"))
            .unwrap()
            .release();

        let (status, body) = call(
            app(&registry, Config::default()),
            Method::POST,
            "/abc123",
            "{}",
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body, "client id not found");
    }

    #[tokio::test]
    async fn test_oversized_body_is_413() {
        let registry = Registry::new(8);
        let mut inbox = registry.register(Identifier::from("abc123")).unwrap();
        let mut config = Config::default();
        config.http.max_payload_bytes = 8;

        let (status, _) = call(
            app(&registry, config),
            Method::POST,
            "/abc123",
            "this body is longer than eight bytes",
        )
        .await;
        assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
        let nothing = tokio::time::timeout(Duration::from_millis(50), inbox.recv()).await;
        assert!(nothing.is_err(), "oversized body must not be delivered");
    }

    #[tokio::test]
    async fn test_slow_session_times_out_with_503() {
        let registry = Registry::new(1);
        let _inbox = registry.register(Identifier::from("slow")).unwrap();
        registry
            .deliver("slow", Payload::new("backlog"), Duration::from_secs(1))
            .await
            .unwrap();
        let mut config = Config::default();
        config.http.delivery_timeout_ms = 50;

        let (status, body) = tokio::time::timeout(
            Duration::from_secs(2),
            call(app(&registry, config), Method::POST, "/slow", "{}"),
        )
        .await
        .expect("handler must not hang");
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert!(body.contains("timed out"));
    }

    #[tokio::test]
    async fn test_health_reports_identifiers() {
        let registry = Registry::new(8);
        let _inbox = registry.register(Identifier::from("abc123")).unwrap();

        let (status, body) = call(
            app(&registry, Config::default()),
            Method::GET,
            "/api/health",
            "",
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let json: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(json["status"], "ok");
        assert_eq!(json["identifiers"], 1);
    }
}
