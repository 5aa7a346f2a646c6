//! `pollen-cockpit` – HTTP and WebSocket surface of the pollination service.
//!
//! # Modules
//!
//! - [`server`] – [`CockpitServer`][server::CockpitServer] and the axum
//!   [`router`][server::router]; the `/api/events` WebSocket bridges the
//!   [`EventBus`][pollen_middleware::EventBus] to connected clients.
//! - [`camera`] – frame upload endpoints feeding the trigger pipeline.
//! - [`pollination`] – connection management and direct actuator commands.
//! - [`state`] – [`AppState`][state::AppState] shared by every handler.
//! - [`error`] – [`ApiError`][error::ApiError]: `{success: false, message}`
//!   responses with a status code derived from the error.

pub mod camera;
pub mod error;
pub mod pollination;
pub mod server;
pub mod state;

pub use error::ApiError;
pub use server::{CockpitServer, DEFAULT_PORT, router};
pub use state::AppState;
