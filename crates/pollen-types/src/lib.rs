use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Lifecycle of the single serial link to the pollinator controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkState {
    Disconnected,
    /// A port is being opened or the ready banner is being awaited.
    Connecting,
    Connected,
    /// The transport reported an error or closed underneath us.
    Faulted,
}

/// Verdict returned by the external image classifier for one frame.
///
/// Field names follow the classifier's JSON contract
/// (`{"isFlower": .., "confidence": .., "class": .., "score": ..}`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassificationResult {
    pub is_flower: bool,
    /// Probability of the reported class, in `[0, 1]`.
    pub confidence: f64,
    #[serde(rename = "class")]
    pub class_name: String,
    /// Raw model output before thresholding.
    #[serde(default)]
    pub score: f64,
}

/// Per-frame range decision derived from a [`ClassificationResult`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DetectionDecision {
    /// Estimated distance to the flower in centimetres, one decimal place.
    pub distance_cm: f64,
    /// `true` when `distance_cm` is at or below the configured threshold.
    pub within_range: bool,
    /// Number of pollination strokes warranted by the classifier confidence.
    pub stroke_count: u8,
}

/// Result of a single actuator command (`POLL`, `HOME`, `TEST`).
///
/// Device failures never escape as errors past the device facade; they are
/// folded into `success: false` with the error text in `message`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandOutcome {
    pub success: bool,
    pub message: String,
    /// Distance token (`DIST:<n>`) embedded in the device reply, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub distance: Option<u32>,
}

impl CommandOutcome {
    /// Build a failed outcome from any displayable error.
    pub fn failed(error: impl std::fmt::Display) -> Self {
        Self {
            success: false,
            message: error.to_string(),
            distance: None,
        }
    }
}

/// Snapshot returned by the controller in reply to `STATUS`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceStatus {
    pub distance: Option<u32>,
    /// `false` only when the reply literally reports `READY:0`.
    pub ready: bool,
    pub raw: String,
}

/// Status query outcome: either a device snapshot or the reason none was
/// obtained.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StatusReport {
    Snapshot(DeviceStatus),
    Unavailable { error: String },
}

impl StatusReport {
    /// Distance carried by a successful snapshot.
    pub fn distance(&self) -> Option<u32> {
        match self {
            StatusReport::Snapshot(status) => status.distance,
            StatusReport::Unavailable { .. } => None,
        }
    }
}

/// Unified event wrapper for the telemetry bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    /// e.g., "pollen-hal::channel"
    pub source: String,
    pub payload: EventPayload,
}

impl Event {
    /// Stamp a new event with a fresh id and the current time.
    pub fn new(source: impl Into<String>, payload: EventPayload) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            source: source.into(),
            payload,
        }
    }
}

/// Variants of data routed over the telemetry bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum EventPayload {
    /// A raw line received from the controller.
    DeviceLine(String),
    /// The serial link changed state.
    LinkState {
        state: LinkState,
        port: Option<String>,
    },
    /// Completion of a fire-and-forget pollination dispatched by the
    /// trigger pipeline.
    Actuation {
        outcome: CommandOutcome,
        strokes: u8,
        drone_id: Option<String>,
    },
    HardwareFault {
        component: String,
        message: String,
    },
}

/// Workspace error type spanning the serial link, the classifier, and the
/// API surface.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PollenError {
    #[error("Device Not Found: {0}")]
    DeviceNotFound(String),

    #[error("Not Connected: the pollinator link is not open")]
    NotConnected,

    #[error("Command Timeout: no reply to '{command}' within {timeout_ms} ms")]
    CommandTimeout { command: String, timeout_ms: u64 },

    #[error("Link Error: {0}")]
    Link(String),

    #[error("Classifier Unavailable: {0}")]
    ClassifierUnavailable(String),

    #[error("Classifier Error: {0}")]
    Classifier(String),

    #[error("Protocol Error: {0}")]
    Protocol(String),

    #[error("Event Bus Error: {0}")]
    Channel(String),

    #[error("Invalid Request: {0}")]
    InvalidRequest(String),

    #[error("I/O Error: {0}")]
    Io(String),
}
