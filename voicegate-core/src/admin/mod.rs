//! Admin HTTP surface.
//!
//! A thin axum adapter over the orchestrator: call CRUD, media, DTMF,
//! transfer, bridge and recording management, endpoint discovery, allowlist
//! administration, and the `/events` WebSocket carrying the call event
//! stream. Handlers delegate to the orchestrator; error mapping lives in
//! [`error`].

mod error;
mod handlers;

pub use error::ApiError;

use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tracing::info;

use crate::orchestrator::Orchestrator;

/// State shared across all handlers.
#[derive(Clone)]
pub struct AdminState {
    pub orchestrator: Arc<Orchestrator>,
    pub api_key: Option<String>,
}

/// Optional `x-api-key` gate for every route.
async fn require_api_key(
    State(state): State<AdminState>,
    request: Request,
    next: Next,
) -> Response {
    if let Some(expected) = &state.api_key {
        let provided = request
            .headers()
            .get("x-api-key")
            .and_then(|v| v.to_str().ok());
        if provided != Some(expected.as_str()) {
            return (
                StatusCode::UNAUTHORIZED,
                Json(serde_json::json!({ "error": "missing or invalid API key" })),
            )
                .into_response();
        }
    }
    next.run(request).await
}

pub fn router(state: AdminState) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        // Calls
        .route("/calls", get(handlers::list_calls).post(handlers::originate))
        .route(
            "/calls/{id}",
            get(handlers::get_call).delete(handlers::hangup),
        )
        .route("/calls/{id}/play", post(handlers::play))
        .route("/calls/{id}/speak", post(handlers::speak))
        .route("/calls/{id}/dtmf", post(handlers::send_dtmf))
        .route("/calls/{id}/record", post(handlers::record))
        .route("/calls/{id}/transfer", post(handlers::transfer))
        .route(
            "/calls/{id}/capture",
            post(handlers::start_capture).delete(handlers::stop_capture),
        )
        // Bridges
        .route("/bridges", get(handlers::list_bridges))
        .route(
            "/bridges/{id}",
            get(handlers::get_bridge).delete(handlers::destroy_bridge),
        )
        // Stored recordings
        .route("/recordings", get(handlers::list_recordings))
        .route(
            "/recordings/{name}",
            get(handlers::get_recording).delete(handlers::delete_recording),
        )
        .route("/recordings/{name}/file", get(handlers::get_recording_file))
        .route("/recordings/{name}/copy", post(handlers::copy_recording))
        // Endpoints
        .route("/endpoints", get(handlers::list_endpoints))
        .route(
            "/endpoints/{technology}/{resource}",
            get(handlers::get_endpoint),
        )
        // Allowlist
        .route("/allowlist", get(handlers::get_allowlist))
        .route("/allowlist/reload", post(handlers::reload_allowlist))
        // Event stream
        .route("/events", get(handlers::events_ws))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            require_api_key,
        ))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

pub async fn serve(state: AdminState, addr: SocketAddr) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("admin surface listening on http://{addr}");
    axum::serve(listener, router(state)).await
}
