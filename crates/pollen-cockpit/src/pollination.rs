//! `/api/pollination/*` handlers: link management and direct actuator
//! commands.

use axum::Json;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::StatusCode;
use pollen_runtime::{DetectionRequest, DetectionResponse};
use pollen_types::{CommandOutcome, PollenError};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tracing::{info, warn};

use crate::error::ApiError;
use crate::state::AppState;

#[derive(Debug, Default, Deserialize)]
pub struct ConnectRequest {
    pub port: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PollinateRequest {
    pub strokes: u8,
    /// Refuse when the device reports a distance beyond this many cm.
    pub distance: Option<f64>,
}

impl Default for PollinateRequest {
    fn default() -> Self {
        Self {
            strokes: 1,
            distance: None,
        }
    }
}

/// Parse an optional JSON body; an empty body yields `T::default()`.
fn optional_json<T: DeserializeOwned + Default>(body: &Bytes) -> Result<T, ApiError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    serde_json::from_slice(body).map_err(|e| ApiError::bad_request(format!("Invalid JSON body: {e}")))
}

fn require_connected(state: &AppState) -> Result<(), ApiError> {
    if state.device.is_connected() {
        Ok(())
    } else {
        Err(PollenError::NotConnected.into())
    }
}

pub async fn connect(State(state): State<AppState>, body: Bytes) -> Result<Json<Value>, ApiError> {
    let request: ConnectRequest = optional_json(&body)?;
    match state.channel.connect(request.port.as_deref()).await {
        Ok(port) => {
            info!(%port, "pollinator connected via API");
            Ok(Json(json!({
                "success": true,
                "message": "Connected to pollinator",
                "port": port,
                "deviceReady": state.channel.is_device_ready(),
            })))
        }
        Err(e) => {
            warn!(error = %e, "connect request failed");
            Err(ApiError::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Failed to connect: {e}"),
            ))
        }
    }
}

pub async fn disconnect(State(state): State<AppState>) -> Json<Value> {
    state.channel.disconnect().await;
    Json(json!({ "success": true, "message": "Disconnected from pollinator" }))
}

pub async fn status(State(state): State<AppState>) -> Json<Value> {
    if !state.device.is_connected() {
        return Json(json!({
            "connected": false,
            "state": state.channel.state(),
            "message": "Pollinator not connected",
        }));
    }

    let mut body = json!({ "connected": true, "port": state.channel.port() });
    if let Ok(Value::Object(report)) = serde_json::to_value(state.device.status().await)
        && let Some(fields) = body.as_object_mut()
    {
        fields.extend(report);
    }
    Json(body)
}

pub async fn pollinate(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<CommandOutcome>, ApiError> {
    let request: PollinateRequest = optional_json(&body)?;
    if request.strokes == 0 {
        return Err(ApiError::bad_request("strokes must be at least 1"));
    }
    let outcome = state
        .pipeline
        .manual_pollinate(request.strokes, request.distance)
        .await?;
    Ok(Json(outcome))
}

pub async fn detect(
    State(state): State<AppState>,
    Json(request): Json<DetectionRequest>,
) -> Result<Json<DetectionResponse>, ApiError> {
    Ok(Json(state.pipeline.handle_detection(request).await?))
}

pub async fn home(State(state): State<AppState>) -> Result<Json<CommandOutcome>, ApiError> {
    require_connected(&state)?;
    Ok(Json(state.device.home().await))
}

pub async fn self_test(State(state): State<AppState>) -> Result<Json<CommandOutcome>, ApiError> {
    require_connected(&state)?;
    Ok(Json(state.device.self_test().await))
}
