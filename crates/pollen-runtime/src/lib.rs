//! `pollen-runtime` – the detection-to-actuation loop.
//!
//! # Modules
//!
//! - [`trigger_pipeline`] – [`TriggerPipeline`][trigger_pipeline::TriggerPipeline]:
//!   classifies camera frames, estimates distance, consults the
//!   [`ActuationGate`] and dispatches pollination.  Also serves explicit
//!   detection reports and manual pollinate requests.
//! - [`telemetry`] – [`init_tracing`][telemetry::init_tracing]:
//!   initialises the global `tracing` subscriber with an optional OTLP span
//!   exporter.
//!
//! # Actuation gating
//!
//! Every automatic pollination triggered by a camera frame **must** pass
//! through [`ActuationGate::evaluate`] first.  The gate is re-exported here so
//! orchestration code does not need a direct dependency on `pollen-kernel`.

pub mod telemetry;
pub mod trigger_pipeline;

pub use pollen_kernel::{ActuationGate, GateVerdict};
pub use trigger_pipeline::{
    ActuationDispatch, DetectionRequest, DetectionResponse, FrameReport, FrameStage,
    FrameSubmission, PipelineConfig, Position, TriggerPipeline,
};
