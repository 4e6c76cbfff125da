//! HTTP route handlers.
//!
//! - [`health`] — `GET /api/health`
//! - [`webhook`] — any method on `/{id}` and `/{id}/{*rest}`

pub mod health;
pub mod webhook;

use axum::{
    routing::{any, get},
    Router,
};
use tower_http::trace::TraceLayer;

use crate::AppState;

/// Build the public router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(health::health))
        .route("/{id}", any(webhook::webhook))
        .route("/{id}/{*rest}", any(webhook::webhook))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
