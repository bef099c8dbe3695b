//! Route handlers. Each one is a thin translation layer between HTTP DTOs
//! and orchestrator operations.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::Json;
use serde::Deserialize;
use std::collections::HashMap;
use tracing::{debug, warn};

use crate::admin::{AdminState, ApiError};
use crate::call::{CallId, CallSnapshot};
use crate::capture::CaptureInfo;
use crate::orchestrator::{OriginateRequest, SpeakOutcome, TransferRequest, TransferResult};
use crate::tts::SpeakRequest;

type ApiResult<T> = Result<Json<T>, ApiError>;

pub async fn health(State(state): State<AdminState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "switchConnected": state.orchestrator.switch().connected(),
    }))
}

// ----------------------------------------------------------------------
// Calls
// ----------------------------------------------------------------------

pub async fn list_calls(State(state): State<AdminState>) -> ApiResult<Vec<CallSnapshot>> {
    Ok(Json(state.orchestrator.registry().snapshots().await))
}

pub async fn get_call(
    State(state): State<AdminState>,
    Path(id): Path<String>,
) -> ApiResult<CallSnapshot> {
    let call = state
        .orchestrator
        .registry()
        .get(&CallId(id.clone()))
        .await
        .ok_or_else(|| ApiError(crate::error::Error::not_found("call", id)))?;
    let snapshot = call.read().await.snapshot();
    Ok(Json(snapshot))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OriginateBody {
    pub endpoint: String,
    #[serde(rename = "callerID")]
    pub caller_id: Option<String>,
    pub timeout_secs: Option<u32>,
    #[serde(default)]
    pub variables: HashMap<String, String>,
}

pub async fn originate(
    State(state): State<AdminState>,
    Json(body): Json<OriginateBody>,
) -> Result<(StatusCode, Json<CallSnapshot>), ApiError> {
    let snapshot = state
        .orchestrator
        .originate(OriginateRequest {
            endpoint: body.endpoint,
            caller_id: body.caller_id,
            timeout_secs: body.timeout_secs,
            variables: body.variables,
        })
        .await?;
    Ok((StatusCode::CREATED, Json(snapshot)))
}

#[derive(Deserialize)]
pub struct HangupQuery {
    pub reason: Option<String>,
}

pub async fn hangup(
    State(state): State<AdminState>,
    Path(id): Path<String>,
    Query(query): Query<HangupQuery>,
) -> ApiResult<serde_json::Value> {
    state
        .orchestrator
        .hangup(&CallId(id), query.reason)
        .await?;
    Ok(Json(serde_json::json!({ "status": "ended" })))
}

#[derive(Deserialize)]
pub struct PlayBody {
    pub media: MediaField,
}

/// A single URI or a fail-fast sequence.
#[derive(Deserialize)]
#[serde(untagged)]
pub enum MediaField {
    One(String),
    Many(Vec<String>),
}

impl MediaField {
    fn into_vec(self) -> Vec<String> {
        match self {
            MediaField::One(uri) => vec![uri],
            MediaField::Many(uris) => uris,
        }
    }
}

pub async fn play(
    State(state): State<AdminState>,
    Path(id): Path<String>,
    Json(body): Json<PlayBody>,
) -> ApiResult<serde_json::Value> {
    state
        .orchestrator
        .play_media(&CallId(id), body.media.into_vec())
        .await?;
    Ok(Json(serde_json::json!({ "status": "finished" })))
}

#[derive(Deserialize)]
pub struct SpeakBody {
    pub text: String,
    pub voice: Option<String>,
    pub language: Option<String>,
    pub speed: Option<f32>,
}

pub async fn speak(
    State(state): State<AdminState>,
    Path(id): Path<String>,
    Json(body): Json<SpeakBody>,
) -> ApiResult<SpeakOutcome> {
    if body.text.trim().is_empty() {
        return Err(ApiError(crate::error::Error::Validation(
            "text must not be empty".into(),
        )));
    }
    let outcome = state
        .orchestrator
        .speak(
            &CallId(id),
            SpeakRequest {
                text: body.text,
                voice: body.voice,
                language: body.language,
                speed: body.speed,
            },
        )
        .await?;
    Ok(Json(outcome))
}

#[derive(Deserialize)]
pub struct DtmfBody {
    pub digits: String,
}

pub async fn send_dtmf(
    State(state): State<AdminState>,
    Path(id): Path<String>,
    Json(body): Json<DtmfBody>,
) -> ApiResult<serde_json::Value> {
    state.orchestrator.send_dtmf(&CallId(id), &body.digits).await?;
    Ok(Json(serde_json::json!({ "status": "sent" })))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferBody {
    pub endpoint: String,
    #[serde(rename = "callerID")]
    pub caller_id: Option<String>,
    pub timeout_secs: Option<u32>,
}

pub async fn transfer(
    State(state): State<AdminState>,
    Path(id): Path<String>,
    Json(body): Json<TransferBody>,
) -> ApiResult<TransferResult> {
    let result = state
        .orchestrator
        .transfer(
            &CallId(id),
            TransferRequest {
                endpoint: body.endpoint,
                caller_id: body.caller_id,
                timeout_secs: body.timeout_secs,
            },
        )
        .await?;
    Ok(Json(result))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordBody {
    pub name: Option<String>,
    pub format: Option<String>,
    pub max_seconds: Option<u32>,
}

pub async fn record(
    State(state): State<AdminState>,
    Path(id): Path<String>,
    Json(body): Json<RecordBody>,
) -> ApiResult<crate::orchestrator::RecordingOutcome> {
    Ok(Json(
        state
            .orchestrator
            .record(&CallId(id), body.name, body.format, body.max_seconds)
            .await?,
    ))
}

pub async fn start_capture(
    State(state): State<AdminState>,
    Path(id): Path<String>,
) -> ApiResult<CaptureInfo> {
    Ok(Json(state.orchestrator.start_capture(&CallId(id)).await?))
}

pub async fn stop_capture(
    State(state): State<AdminState>,
    Path(id): Path<String>,
) -> ApiResult<serde_json::Value> {
    state.orchestrator.stop_capture(&CallId(id)).await?;
    Ok(Json(serde_json::json!({ "status": "stopped" })))
}

// ----------------------------------------------------------------------
// Bridges
// ----------------------------------------------------------------------

pub async fn list_bridges(
    State(state): State<AdminState>,
) -> ApiResult<Vec<crate::call::BridgeRecord>> {
    Ok(Json(state.orchestrator.bridge_registry().list()))
}

pub async fn get_bridge(
    State(state): State<AdminState>,
    Path(id): Path<String>,
) -> ApiResult<serde_json::Value> {
    if let Some(record) = state.orchestrator.bridge_registry().get(&id) {
        return Ok(Json(serde_json::to_value(record).unwrap_or_default()));
    }
    // Not in the administrative registry (e.g. created before a restart);
    // ask the switch directly.
    let bridge = state.orchestrator.switch().get_bridge(&id).await?;
    Ok(Json(serde_json::json!({
        "id": bridge.id,
        "name": bridge.name,
        "channelIDs": bridge.channels,
    })))
}

pub async fn destroy_bridge(
    State(state): State<AdminState>,
    Path(id): Path<String>,
) -> ApiResult<serde_json::Value> {
    state.orchestrator.switch().destroy_bridge(&id).await?;
    Ok(Json(serde_json::json!({ "status": "destroyed" })))
}

// ----------------------------------------------------------------------
// Stored recordings
// ----------------------------------------------------------------------

pub async fn list_recordings(
    State(state): State<AdminState>,
) -> ApiResult<Vec<crate::switch::StoredRecording>> {
    Ok(Json(state.orchestrator.switch().list_recordings().await?))
}

pub async fn get_recording(
    State(state): State<AdminState>,
    Path(name): Path<String>,
) -> ApiResult<crate::switch::StoredRecording> {
    Ok(Json(state.orchestrator.switch().get_recording(&name).await?))
}

pub async fn get_recording_file(
    State(state): State<AdminState>,
    Path(name): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let bytes = state
        .orchestrator
        .switch()
        .get_recording_bytes(&name)
        .await?;
    Ok((
        StatusCode::OK,
        [(header::CONTENT_TYPE, "application/octet-stream")],
        bytes,
    ))
}

pub async fn delete_recording(
    State(state): State<AdminState>,
    Path(name): Path<String>,
) -> ApiResult<serde_json::Value> {
    state.orchestrator.switch().delete_recording(&name).await?;
    Ok(Json(serde_json::json!({ "status": "deleted" })))
}

#[derive(Deserialize)]
pub struct CopyBody {
    pub destination: String,
}

pub async fn copy_recording(
    State(state): State<AdminState>,
    Path(name): Path<String>,
    Json(body): Json<CopyBody>,
) -> ApiResult<crate::switch::StoredRecording> {
    Ok(Json(
        state
            .orchestrator
            .switch()
            .copy_recording(&name, &body.destination)
            .await?,
    ))
}

// ----------------------------------------------------------------------
// Endpoints and allowlist
// ----------------------------------------------------------------------

pub async fn list_endpoints(
    State(state): State<AdminState>,
) -> ApiResult<Vec<crate::switch::Endpoint>> {
    Ok(Json(state.orchestrator.switch().list_endpoints().await?))
}

pub async fn get_endpoint(
    State(state): State<AdminState>,
    Path((technology, resource)): Path<(String, String)>,
) -> ApiResult<crate::switch::Endpoint> {
    Ok(Json(
        state
            .orchestrator
            .switch()
            .get_endpoint(&technology, &resource)
            .await?,
    ))
}

pub async fn get_allowlist(
    State(state): State<AdminState>,
) -> ApiResult<crate::allowlist::AllowlistRules> {
    Ok(Json(state.orchestrator.allowlist().rules()))
}

pub async fn reload_allowlist(
    State(state): State<AdminState>,
) -> ApiResult<crate::allowlist::AllowlistRules> {
    state.orchestrator.allowlist().reload();
    Ok(Json(state.orchestrator.allowlist().rules()))
}

// ----------------------------------------------------------------------
// Event stream
// ----------------------------------------------------------------------

/// Subscriber stream: a snapshot of all active calls first, then the live
/// event feed.
pub async fn events_ws(
    ws: WebSocketUpgrade,
    State(state): State<AdminState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_events_ws(socket, state))
}

async fn handle_events_ws(mut socket: WebSocket, state: AdminState) {
    // Subscribe before snapshotting so nothing falls in the gap.
    let mut events = state.orchestrator.bus().subscribe();
    let snapshot = state.orchestrator.registry().snapshots().await;
    let hello = serde_json::json!({
        "type": "snapshot",
        "timestamp": chrono::Utc::now(),
        "data": { "calls": snapshot },
    });
    if socket.send(Message::Text(hello.to_string().into())).await.is_err() {
        return;
    }

    loop {
        tokio::select! {
            event = events.recv() => {
                match event {
                    Ok(event) => {
                        let Ok(payload) = serde_json::to_string(&event) else {
                            continue;
                        };
                        if socket.send(Message::Text(payload.into())).await.is_err() {
                            break;
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                        warn!("event subscriber lagged, dropped {missed} events");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        debug!("event subscriber socket error: {e}");
                        break;
                    }
                }
            }
        }
    }
    debug!("event subscriber disconnected");
}
