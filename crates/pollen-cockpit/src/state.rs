use std::sync::Arc;

use pollen_hal::{Pollinator, SerialChannel};
use pollen_middleware::EventBus;
use pollen_runtime::TriggerPipeline;

/// Handles every request handler needs.  Cheap to clone.
#[derive(Clone)]
pub struct AppState {
    pub channel: Arc<SerialChannel>,
    pub device: Arc<dyn Pollinator>,
    pub pipeline: Arc<TriggerPipeline>,
    pub bus: EventBus,
}

impl AppState {
    /// The device facade is taken from `pipeline` so both paths drive the
    /// same actuator.
    pub fn new(channel: Arc<SerialChannel>, pipeline: Arc<TriggerPipeline>, bus: EventBus) -> Self {
        Self {
            device: Arc::clone(pipeline.device()),
            channel,
            pipeline,
            bus,
        }
    }
}
