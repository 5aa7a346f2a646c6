//! `pollen-perception` – turning camera frames into actuation decisions.
//!
//! # Modules
//!
//! - [`classifier`] – [`ClassificationGateway`][classifier::ClassificationGateway]:
//!   the seam to the external flower classifier, and
//!   [`ProcessClassifier`][classifier::ProcessClassifier], which runs the
//!   classifier script as a short-lived child process per frame.
//! - [`range`] – heuristic distance estimation from classifier confidence and
//!   frame size, plus the stroke count a detection warrants.

pub mod classifier;
pub mod range;

pub use classifier::{ClassificationGateway, ProcessClassifier, ProcessClassifierConfig};
pub use range::{decide, estimate_distance_cm, strokes_for_confidence};
