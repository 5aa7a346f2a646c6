//! `/api/camera/*` handlers.
//!
//! Frames arrive as `multipart/form-data` with an `image` file part and
//! optional `width`, `height` and `droneId` text parts.

use axum::Json;
use axum::body::Bytes;
use axum::extract::{Multipart, State};
use axum::extract::multipart::MultipartError;
use axum::http::StatusCode;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use chrono::{DateTime, Utc};
use pollen_perception::ClassificationGateway as _;
use pollen_runtime::{FrameReport, FrameSubmission};
use serde::Serialize;
use serde_json::{Value, json};
use tracing::debug;

use crate::error::ApiError;
use crate::state::AppState;

/// Largest accepted image part.
pub const MAX_IMAGE_BYTES: usize = 5 * 1024 * 1024;

struct UploadedFrame {
    bytes: Bytes,
    mimetype: String,
    width: Option<u32>,
    height: Option<u32>,
    drone_id: Option<String>,
}

fn multipart_error(e: MultipartError) -> ApiError {
    ApiError::new(e.status(), e.body_text())
}

/// Unparseable dimensions are treated as absent.
fn parse_dimension(text: &str) -> Option<u32> {
    text.trim().parse().ok()
}

async fn read_upload(mut multipart: Multipart) -> Result<UploadedFrame, ApiError> {
    let mut image = None;
    let mut width = None;
    let mut height = None;
    let mut drone_id = None;

    while let Some(field) = multipart.next_field().await.map_err(multipart_error)? {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "image" => {
                let mimetype = field
                    .content_type()
                    .unwrap_or("application/octet-stream")
                    .to_string();
                if !mimetype.starts_with("image/") {
                    return Err(ApiError::bad_request("Only image files are allowed"));
                }
                let bytes = field.bytes().await.map_err(multipart_error)?;
                if bytes.len() > MAX_IMAGE_BYTES {
                    return Err(ApiError::new(
                        StatusCode::PAYLOAD_TOO_LARGE,
                        format!("Image exceeds {MAX_IMAGE_BYTES} bytes"),
                    ));
                }
                image = Some((bytes, mimetype));
            }
            "width" => width = parse_dimension(&field.text().await.map_err(multipart_error)?),
            "height" => height = parse_dimension(&field.text().await.map_err(multipart_error)?),
            "droneId" => {
                let text = field.text().await.map_err(multipart_error)?;
                drone_id = Some(text.trim().to_string()).filter(|id| !id.is_empty());
            }
            other => debug!(field = other, "ignoring unknown multipart field"),
        }
    }

    let (bytes, mimetype) = image.ok_or_else(|| ApiError::bad_request("No image file provided"))?;
    Ok(UploadedFrame {
        bytes,
        mimetype,
        width,
        height,
        drone_id,
    })
}

#[derive(Debug, Serialize)]
pub struct ProcessResponse {
    pub success: bool,
    pub message: &'static str,
    #[serde(flatten)]
    pub report: FrameReport,
}

pub async fn process_frame(
    State(state): State<AppState>,
    multipart: Multipart,
) -> Result<Json<ProcessResponse>, ApiError> {
    let upload = read_upload(multipart).await?;
    let report = state
        .pipeline
        .process_frame(FrameSubmission {
            image: upload.bytes.to_vec(),
            width: upload.width,
            height: upload.height,
            drone_id: upload.drone_id,
        })
        .await;

    let message = if report.flower_detected {
        "Frame processed - Flower detected!"
    } else {
        "Frame processed"
    };
    Ok(Json(ProcessResponse {
        success: true,
        message,
        report,
    }))
}

#[derive(Debug, Serialize)]
pub struct FrameInfo {
    pub timestamp: DateTime<Utc>,
    pub size: usize,
    pub mimetype: String,
    pub width: Option<u32>,
    pub height: Option<u32>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FrameAck {
    pub success: bool,
    pub message: &'static str,
    pub frame: FrameInfo,
    pub image_data_url: String,
}

/// Acknowledge a frame without classifying it.
pub async fn receive_frame(multipart: Multipart) -> Result<Json<FrameAck>, ApiError> {
    let upload = read_upload(multipart).await?;
    let image_data_url = format!(
        "data:{};base64,{}",
        upload.mimetype,
        BASE64_STANDARD.encode(&upload.bytes)
    );
    Ok(Json(FrameAck {
        success: true,
        message: "Frame received",
        frame: FrameInfo {
            timestamp: Utc::now(),
            size: upload.bytes.len(),
            mimetype: upload.mimetype,
            width: upload.width,
            height: upload.height,
        },
        image_data_url,
    }))
}

pub async fn camera_status(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "active": true,
        "message": "Camera feed endpoint ready",
        "classifierAvailable": state.pipeline.classifier().is_available().await,
        "endpoints": {
            "receiveFrame": "POST /api/camera/frame",
            "processFrame": "POST /api/camera/process",
        },
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dimensions_parse_leniently() {
        assert_eq!(parse_dimension("640"), Some(640));
        assert_eq!(parse_dimension(" 480 \r\n"), Some(480));
        assert_eq!(parse_dimension("wide"), None);
        assert_eq!(parse_dimension("-3"), None);
    }
}
