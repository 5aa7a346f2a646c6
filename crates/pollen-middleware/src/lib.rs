//! `pollen-middleware` – telemetry plumbing
//!
//! Routes device lines, link-state changes, and fire-and-forget actuation
//! outcomes to whoever is listening (logs, the cockpit WebSocket) without the
//! producers caring whether anyone is.
//!
//! # Modules
//!
//! - [`bus`] – topic-based broadcast event bus built on Tokio broadcast
//!   channels.

pub mod bus;

pub use bus::{EventBus, Topic, TopicReceiver};
