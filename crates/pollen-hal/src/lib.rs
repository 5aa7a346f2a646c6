//! `pollen-hal` – Hardware Abstraction Layer for the pollinator controller
//!
//! Owns the one serial link to the microcontroller and exposes it to the
//! rest of the system as typed actuator operations.
//!
//! # Modules
//!
//! - [`transport`] – [`PortProvider`][transport::PortProvider]: the pluggable
//!   seam for enumerating and opening serial ports, plus the controller
//!   auto-discovery ordering.
//! - [`reply`] – classification of controller reply lines and `DIST:<n>`
//!   extraction.
//! - [`channel`] – [`SerialChannel`][channel::SerialChannel]: line-oriented
//!   request/response exchange over the shared link, one exchange in flight
//!   at a time.
//! - [`pollinator`] – the [`Pollinator`][pollinator::Pollinator] trait the
//!   trigger pipeline and the API talk to.
//! - [`device`] – [`SerialPollinator`][device::SerialPollinator]: the
//!   [`Pollinator`][pollinator::Pollinator] driver backed by a
//!   [`SerialChannel`][channel::SerialChannel].
//! - [`sim`] – an in-process simulated controller for running the whole
//!   stack without hardware.

pub mod channel;
pub mod device;
pub mod pollinator;
pub mod reply;
pub mod sim;
pub mod transport;

pub use channel::{ChannelConfig, SerialChannel};
pub use device::SerialPollinator;
pub use pollinator::Pollinator;
pub use sim::{SimController, SimPorts};
pub use transport::{PortInfo, PortProvider, SystemPorts};
