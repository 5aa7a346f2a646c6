//! [`TriggerPipeline`] – from camera frame to pollination stroke.
//!
//! Per frame:
//!
//! ```text
//! Received ─► Classifying ─┬─► ClassificationFailed
//!                          ├─► NoFlower
//!                          └─► Detected ─┬─► OutOfRange
//!                                        ├─► OnCooldown
//!                                        └─► Actuating (background task)
//! ```
//!
//! Every branch is terminal and the frame response never waits on the
//! actuator.  Classifier failures are folded into the report as
//! `classificationError`; actuation results surface only in logs and on the
//! [`Topic::Actuation`] bus topic.
//!
//! The pipeline also serves explicit detection reports
//! ([`TriggerPipeline::handle_detection`]) and manual pollinate requests
//! ([`TriggerPipeline::manual_pollinate`]); both await the device before
//! answering and bypass the cooldown.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use pollen_hal::Pollinator;
use pollen_kernel::{ActuationGate, CooldownGate, GateVerdict, RangeRule};
use pollen_middleware::{EventBus, Topic};
use pollen_perception::{ClassificationGateway, range};
use pollen_types::{ClassificationResult, CommandOutcome, Event, EventPayload, PollenError};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{info, instrument, warn};

const EVENT_SOURCE: &str = "pollen-runtime::trigger_pipeline";

/// Thresholds and timing for a [`TriggerPipeline`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PipelineConfig {
    /// Automatic trigger range for camera frames.
    pub frame_range_cm: f64,
    /// Range accepted by [`TriggerPipeline::handle_detection`].
    pub detection_range_cm: f64,
    pub cooldown: Duration,
    /// Strokes dispatched for an automatic trigger.
    pub frame_strokes: u8,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            frame_range_cm: 25.0,
            detection_range_cm: 40.0,
            cooldown: Duration::from_millis(3000),
            frame_strokes: 1,
        }
    }
}

/// One camera frame submitted for processing.
#[derive(Debug, Clone, Default)]
pub struct FrameSubmission {
    pub image: Vec<u8>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub drone_id: Option<String>,
}

/// Terminal state a frame reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FrameStage {
    ClassificationFailed,
    NoFlower,
    OutOfRange,
    OnCooldown,
    Actuating,
}

/// What happened to the actuator for an in-range frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ActuationDispatch {
    /// A pollinate command was handed to a background task.
    Dispatched { strokes: u8 },
    /// The cooldown gate held; nothing was sent.
    #[serde(rename_all = "camelCase")]
    Suppressed { cooldown_remaining_ms: u64 },
}

/// Response to one processed frame.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FrameReport {
    pub stage: FrameStage,
    pub classification: Option<ClassificationResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub classification_error: Option<String>,
    pub flower_detected: bool,
    pub distance: Option<f64>,
    pub ultrasonic_active: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub actuation: Option<ActuationDispatch>,
    pub drone_id: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl FrameReport {
    fn new(stage: FrameStage, drone_id: Option<String>) -> Self {
        Self {
            stage,
            classification: None,
            classification_error: None,
            flower_detected: false,
            distance: None,
            ultrasonic_active: false,
            actuation: None,
            drone_id,
            timestamp: Utc::now(),
        }
    }

    fn classification_failed(error: String, drone_id: Option<String>) -> Self {
        Self {
            classification_error: Some(error),
            ..Self::new(FrameStage::ClassificationFailed, drone_id)
        }
    }
}

/// Three-axis position reported alongside a detection.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

/// A detection reported by a caller that already knows distance and
/// confidence.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DetectionRequest {
    #[serde(default)]
    pub flower_detected: bool,
    pub position: Option<Position>,
    pub distance: Option<f64>,
    pub confidence: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DetectionResponse {
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub distance: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub required_distance: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub strokes: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub position: Option<Position>,
}

impl DetectionResponse {
    fn refused(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            distance: None,
            required_distance: None,
            strokes: None,
            confidence: None,
            position: None,
        }
    }
}

pub struct TriggerPipeline {
    classifier: Arc<dyn ClassificationGateway>,
    device: Arc<dyn Pollinator>,
    gate: ActuationGate,
    detection_range: RangeRule,
    frame_strokes: u8,
    bus: Option<EventBus>,
}

impl TriggerPipeline {
    pub fn new(
        classifier: Arc<dyn ClassificationGateway>,
        device: Arc<dyn Pollinator>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            classifier,
            device,
            gate: ActuationGate::new(
                RangeRule::new(config.frame_range_cm),
                CooldownGate::new(config.cooldown),
            ),
            detection_range: RangeRule::new(config.detection_range_cm),
            frame_strokes: config.frame_strokes,
            bus: None,
        }
    }

    /// Publish background actuation outcomes on `bus`.
    pub fn with_bus(mut self, bus: EventBus) -> Self {
        self.bus = Some(bus);
        self
    }

    pub fn gate(&self) -> &ActuationGate {
        &self.gate
    }

    pub fn device(&self) -> &Arc<dyn Pollinator> {
        &self.device
    }

    pub fn classifier(&self) -> &Arc<dyn ClassificationGateway> {
        &self.classifier
    }

    /// Run one frame through the pipeline.
    #[instrument(skip_all, fields(drone = frame.drone_id.as_deref().unwrap_or("-"), bytes = frame.image.len()))]
    pub async fn process_frame(&self, frame: FrameSubmission) -> FrameReport {
        let FrameSubmission {
            image,
            width,
            height,
            drone_id,
        } = frame;

        if !self.classifier.is_available().await {
            warn!("classifier unavailable; frame left unclassified");
            return FrameReport::classification_failed(
                "no classification available: classifier unavailable".into(),
                drone_id,
            );
        }

        let classification = match self.classifier.classify(&image).await {
            Ok(result) => result,
            Err(e) => {
                warn!(error = %e, "frame classification failed");
                return FrameReport::classification_failed(e.to_string(), drone_id);
            }
        };

        if !classification.is_flower {
            info!(class = %classification.class_name, confidence = classification.confidence, "no flower in frame");
            return FrameReport {
                classification: Some(classification),
                ..FrameReport::new(FrameStage::NoFlower, drone_id)
            };
        }

        let decision = range::decide(
            &classification,
            width,
            height,
            self.gate.range().max_distance_cm,
        );
        let mut report = FrameReport {
            classification: Some(classification),
            flower_detected: true,
            distance: Some(decision.distance_cm),
            ..FrameReport::new(FrameStage::OutOfRange, drone_id.clone())
        };

        match self.gate.evaluate(decision.distance_cm) {
            GateVerdict::OutOfRange { distance_cm, limit_cm } => {
                info!(distance_cm, limit_cm, "flower detected out of range");
            }
            GateVerdict::Cooling { remaining } => {
                let remaining_ms = remaining.as_millis() as u64;
                info!(distance_cm = decision.distance_cm, remaining_ms, "flower in range; cooldown active");
                report.stage = FrameStage::OnCooldown;
                report.ultrasonic_active = true;
                report.actuation = Some(ActuationDispatch::Suppressed {
                    cooldown_remaining_ms: remaining_ms,
                });
            }
            GateVerdict::Fire => {
                let strokes = self.frame_strokes;
                info!(distance_cm = decision.distance_cm, strokes, "flower in range; triggering pollination");
                self.dispatch(strokes, drone_id);
                report.stage = FrameStage::Actuating;
                report.ultrasonic_active = true;
                report.actuation = Some(ActuationDispatch::Dispatched { strokes });
            }
        }
        report
    }

    /// Fire-and-forget pollination.  The outcome is logged and published;
    /// the handle is returned for callers that want to observe it.
    pub fn dispatch(&self, strokes: u8, drone_id: Option<String>) -> JoinHandle<CommandOutcome> {
        let device = Arc::clone(&self.device);
        let bus = self.bus.clone();
        tokio::spawn(async move {
            let outcome = device.pollinate(strokes).await;
            if outcome.success {
                info!(strokes, reply = %outcome.message, "pollination completed");
            } else {
                warn!(strokes, reason = %outcome.message, "pollination failed");
            }
            if let Some(bus) = bus {
                bus.publish_to(
                    Topic::Actuation,
                    Event::new(
                        EVENT_SOURCE,
                        EventPayload::Actuation {
                            outcome: outcome.clone(),
                            strokes,
                            drone_id,
                        },
                    ),
                );
            }
            outcome
        })
    }

    /// Decide and actuate for a caller-supplied detection, awaiting the
    /// device.
    ///
    /// The device's own distance reading takes precedence over the one in
    /// the request.  A detection with no distance at all is not range
    /// checked.
    ///
    /// # Errors
    ///
    /// [`PollenError::NotConnected`] when the device link is down.
    #[instrument(skip_all, fields(flower = request.flower_detected))]
    pub async fn handle_detection(
        &self,
        request: DetectionRequest,
    ) -> Result<DetectionResponse, PollenError> {
        if !self.device.is_connected() {
            return Err(PollenError::NotConnected);
        }
        if !request.flower_detected {
            return Ok(DetectionResponse::refused("No flower detected"));
        }

        let status = self.device.status().await;
        let distance = status
            .distance()
            .filter(|d| *d > 0)
            .map(f64::from)
            .or(request.distance);

        if let Some(d) = distance
            && !self.detection_range.admits(d)
        {
            info!(distance_cm = d, limit_cm = self.detection_range.max_distance_cm, "detection out of range");
            return Ok(DetectionResponse {
                distance: Some(d),
                required_distance: Some(self.detection_range.max_distance_cm),
                ..DetectionResponse::refused("Flower too far away")
            });
        }

        let strokes = range::strokes_for_confidence(request.confidence.unwrap_or(0.0));
        let outcome = self.device.pollinate(strokes).await;
        Ok(DetectionResponse {
            success: outcome.success,
            message: outcome.message,
            distance,
            required_distance: None,
            strokes: Some(strokes),
            confidence: request.confidence,
            position: request.position,
        })
    }

    /// Operator-requested pollination.  With `max_distance_cm`, the device
    /// status is read first and the request refused when the reported
    /// distance exceeds it.
    ///
    /// # Errors
    ///
    /// [`PollenError::NotConnected`] when the device link is down.
    pub async fn manual_pollinate(
        &self,
        strokes: u8,
        max_distance_cm: Option<f64>,
    ) -> Result<CommandOutcome, PollenError> {
        if !self.device.is_connected() {
            return Err(PollenError::NotConnected);
        }
        if let Some(limit) = max_distance_cm
            && let Some(current) = self.device.status().await.distance()
            && f64::from(current) > limit
        {
            warn!(current, limit, "manual pollination refused: too far");
            return Ok(CommandOutcome {
                success: false,
                message: "Too far from flower".into(),
                distance: Some(current),
            });
        }
        Ok(self.device.pollinate(strokes).await)
    }
}
