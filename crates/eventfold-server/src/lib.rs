//! eventfold server library logic.

pub mod api;
pub mod api_events;
pub mod config;

use axum::{extract::DefaultBodyLimit, routing::get, Extension, Json, Router};
use eventfold_store::EventStore;
use serde_json::{json, Value};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

/// Application state shared across all request handlers.
///
/// Built once at startup and handed to [`app`]; there is no process-wide
/// store handle.
#[derive(Clone)]
pub struct AppState {
    /// The event store engine.
    pub store: EventStore,
}

impl AppState {
    pub fn new(store: EventStore) -> Self {
        Self { store }
    }
}

/// Maximum request body size (2 MiB).
const MAX_REQUEST_BODY_BYTES: usize = 2 * 1024 * 1024;

/// Health check handler.
async fn health() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// Liveness probe for load balancers and older clients.
async fn ping() -> Json<Value> {
    Json(json!({ "message": "pong" }))
}

/// Builds the application router with all routes.
pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/ping", get(ping))
        .route(
            "/events",
            get(api_events::list_events_handler).post(api_events::create_event_handler),
        )
        .route("/events/{id}", get(api_events::get_event_handler))
        .layer(DefaultBodyLimit::max(MAX_REQUEST_BODY_BYTES))
        .layer(TraceLayer::new_for_http())
        .layer(Extension(Arc::new(state)))
}
