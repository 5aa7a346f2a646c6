//! Distance heuristic.
//!
//! There is no depth sensor on the camera path, so distance is inferred: a
//! confident detection is assumed to be close, and a frame larger than the
//! 640×480 reference is assumed to show the flower larger (closer).
//!
//! ```text
//! base        = 100 - confidence * 80
//! size_factor = min(width * height / (640 * 480), 1.5)
//! distance    = clamp(base / size_factor, 10, 100), rounded to 0.1 cm
//! ```

use pollen_types::{ClassificationResult, DetectionDecision};

const REFERENCE_AREA: f64 = 640.0 * 480.0;
const MAX_SIZE_FACTOR: f64 = 1.5;

pub const MIN_DISTANCE_CM: f64 = 10.0;
pub const MAX_DISTANCE_CM: f64 = 100.0;

/// Confidence above which a detection earns a double stroke.
pub const DOUBLE_STROKE_CONFIDENCE: f64 = 0.8;

/// Estimate the distance to a detected flower in centimetres.
///
/// Missing or zero dimensions are treated as the reference frame size.
/// `confidence` is clamped to `[0, 1]`.
pub fn estimate_distance_cm(confidence: f64, width: Option<u32>, height: Option<u32>) -> f64 {
    let confidence = confidence.clamp(0.0, 1.0);
    let base = 100.0 - confidence * 80.0;
    let distance = (base / size_factor(width, height)).clamp(MIN_DISTANCE_CM, MAX_DISTANCE_CM);
    (distance * 10.0).round() / 10.0
}

fn size_factor(width: Option<u32>, height: Option<u32>) -> f64 {
    match (width, height) {
        (Some(w), Some(h)) if w > 0 && h > 0 => {
            (f64::from(w) * f64::from(h) / REFERENCE_AREA).min(MAX_SIZE_FACTOR)
        }
        _ => 1.0,
    }
}

/// Two strokes for a confident detection, otherwise one.
pub fn strokes_for_confidence(confidence: f64) -> u8 {
    if confidence > DOUBLE_STROKE_CONFIDENCE { 2 } else { 1 }
}

/// Combine the distance estimate, the range threshold and the stroke count
/// for one classified frame.
pub fn decide(
    result: &ClassificationResult,
    width: Option<u32>,
    height: Option<u32>,
    threshold_cm: f64,
) -> DetectionDecision {
    let distance_cm = estimate_distance_cm(result.confidence, width, height);
    DetectionDecision {
        distance_cm,
        within_range: distance_cm <= threshold_cm,
        stroke_count: strokes_for_confidence(result.confidence),
    }
}
