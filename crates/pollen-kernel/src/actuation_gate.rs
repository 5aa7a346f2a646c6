//! [`ActuationGate`] – single interception point between perception and the
//! pollination head.
//!
//! Before the trigger pipeline dispatches an automatic pollination it must
//! pass [`ActuationGate::evaluate`].  Two checks run in order:
//!
//! 1. **Range check** ([`RangeRule`]): the estimated distance must be at or
//!    below the limit.  A flower out of range never touches the cooldown.
//! 2. **Cooldown check** ([`CooldownGate`]): at most one trigger per window.
//!    Passing this check records the trigger time.
//!
//! Only a [`GateVerdict::Fire`] permits the caller to actuate.
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//! use pollen_kernel::{ActuationGate, CooldownGate, GateVerdict, RangeRule};
//!
//! let gate = ActuationGate::new(RangeRule::new(25.0), CooldownGate::new(Duration::from_secs(3)));
//!
//! assert!(matches!(gate.evaluate(28.0), GateVerdict::OutOfRange { .. }));
//! assert_eq!(gate.evaluate(24.0), GateVerdict::Fire);
//! assert!(matches!(gate.evaluate(20.8), GateVerdict::Cooling { .. }));
//! ```

use std::time::{Duration, Instant};

use crate::cooldown::{CooldownDecision, CooldownGate};

/// Default automatic trigger range for camera frames.
pub const DEFAULT_FRAME_RANGE_CM: f64 = 25.0;

/// Maximum distance at which actuation is allowed.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RangeRule {
    pub max_distance_cm: f64,
}

impl RangeRule {
    pub fn new(max_distance_cm: f64) -> Self {
        Self { max_distance_cm }
    }

    /// `true` when `distance_cm <= max_distance_cm`.
    pub fn admits(&self, distance_cm: f64) -> bool {
        distance_cm <= self.max_distance_cm
    }
}

/// Result of [`ActuationGate::evaluate`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum GateVerdict {
    OutOfRange { distance_cm: f64, limit_cm: f64 },
    Cooling { remaining: Duration },
    Fire,
}

pub struct ActuationGate {
    range: RangeRule,
    cooldown: CooldownGate,
}

impl ActuationGate {
    pub fn new(range: RangeRule, cooldown: CooldownGate) -> Self {
        Self { range, cooldown }
    }

    pub fn range(&self) -> RangeRule {
        self.range
    }

    pub fn cooldown(&self) -> &CooldownGate {
        &self.cooldown
    }

    pub fn evaluate(&self, distance_cm: f64) -> GateVerdict {
        self.evaluate_at(distance_cm, Instant::now())
    }

    /// Range check, then cooldown check at `now`.
    pub fn evaluate_at(&self, distance_cm: f64, now: Instant) -> GateVerdict {
        if !self.range.admits(distance_cm) {
            return GateVerdict::OutOfRange {
                distance_cm,
                limit_cm: self.range.max_distance_cm,
            };
        }
        match self.cooldown.try_acquire_at(now) {
            CooldownDecision::Granted => GateVerdict::Fire,
            CooldownDecision::Cooling { remaining } => GateVerdict::Cooling { remaining },
        }
    }
}

impl Default for ActuationGate {
    fn default() -> Self {
        Self::new(RangeRule::new(DEFAULT_FRAME_RANGE_CM), CooldownGate::default())
    }
}
