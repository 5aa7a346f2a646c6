//! `pollen-kernel` – Actuation Safety
//!
//! Decides whether a detected flower may trigger the pollination head.  It
//! does not talk to hardware; it only answers "fire or not".
//!
//! # Modules
//!
//! - [`cooldown`] – [`CooldownGate`][cooldown::CooldownGate]: atomic
//!   check-and-set of the last-fire timestamp so at most one trigger passes
//!   per cooldown window.
//! - [`actuation_gate`] – [`ActuationGate`][actuation_gate::ActuationGate]:
//!   the single interception point the trigger pipeline passes through.
//!   Runs the range check, then the cooldown check.

pub mod actuation_gate;
pub mod cooldown;

pub use actuation_gate::{ActuationGate, GateVerdict, RangeRule};
pub use cooldown::{CooldownDecision, CooldownGate};
