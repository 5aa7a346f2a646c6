//! [`CooldownGate`] – minimum spacing between automatic actuations.
//!
//! The gate holds the timestamp of the last trigger it let through.  A new
//! trigger is granted only when at least the cooldown has elapsed since then;
//! granting and recording the new timestamp happen under one lock, so two
//! concurrent frames can never both pass.

use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::debug;

/// Default spacing between automatic actuations.
pub const DEFAULT_COOLDOWN: Duration = Duration::from_millis(3000);

// ────────────────────────────────────────────────────────────────────────────
// Public types
// ────────────────────────────────────────────────────────────────────────────

/// Outcome of [`CooldownGate::try_acquire`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CooldownDecision {
    /// The trigger may fire; the last-fire timestamp now equals the request
    /// time.
    Granted,
    /// Still inside the window; nothing was recorded.
    Cooling { remaining: Duration },
}

// ────────────────────────────────────────────────────────────────────────────
// CooldownGate
// ────────────────────────────────────────────────────────────────────────────

/// Process-wide last-fire gate.
///
/// # Example
///
/// ```
/// use std::time::{Duration, Instant};
/// use pollen_kernel::cooldown::{CooldownDecision, CooldownGate};
///
/// let gate = CooldownGate::new(Duration::from_secs(3));
/// let t0 = Instant::now();
///
/// assert_eq!(gate.try_acquire_at(t0), CooldownDecision::Granted);
/// assert!(matches!(
///     gate.try_acquire_at(t0 + Duration::from_secs(1)),
///     CooldownDecision::Cooling { .. }
/// ));
/// assert_eq!(
///     gate.try_acquire_at(t0 + Duration::from_secs(3)),
///     CooldownDecision::Granted
/// );
/// ```
#[derive(Debug)]
pub struct CooldownGate {
    cooldown: Duration,
    last_fire: Mutex<Option<Instant>>,
}

impl CooldownGate {
    /// A gate that has never fired.
    pub fn new(cooldown: Duration) -> Self {
        Self {
            cooldown,
            last_fire: Mutex::new(None),
        }
    }

    pub fn cooldown(&self) -> Duration {
        self.cooldown
    }

    /// When the gate last granted a trigger.
    pub fn last_fire(&self) -> Option<Instant> {
        *self.last_fire.lock()
    }

    /// [`try_acquire_at`][Self::try_acquire_at] with the current time.
    pub fn try_acquire(&self) -> CooldownDecision {
        self.try_acquire_at(Instant::now())
    }

    /// Grant a trigger at `now` if `now - last_fire >= cooldown`, recording
    /// `now` as the new last-fire time.
    ///
    /// A `now` earlier than the recorded timestamp counts as zero elapsed.
    pub fn try_acquire_at(&self, now: Instant) -> CooldownDecision {
        let mut last_fire = self.last_fire.lock();
        if let Some(previous) = *last_fire {
            let elapsed = now.saturating_duration_since(previous);
            if elapsed < self.cooldown {
                let remaining = self.cooldown - elapsed;
                debug!(remaining_ms = remaining.as_millis() as u64, "trigger suppressed by cooldown");
                return CooldownDecision::Cooling { remaining };
            }
        }
        *last_fire = Some(now);
        CooldownDecision::Granted
    }
}

impl Default for CooldownGate {
    fn default() -> Self {
        Self::new(DEFAULT_COOLDOWN)
    }
}
