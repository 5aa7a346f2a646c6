//! The `Pollinator` trait: typed actuator operations on the pollination head.
//!
//! The trigger pipeline and the HTTP API only ever talk to this trait, so the
//! serial-backed driver can be swapped for a mock without touching decision
//! logic.

use async_trait::async_trait;
use pollen_types::{CommandOutcome, StatusReport};

/// The pollination actuator.
///
/// Operations never return errors: device failures (link down, timeout,
/// refusal) are reported as [`CommandOutcome`] with `success: false`, or as
/// [`StatusReport::Unavailable`].
#[async_trait]
pub trait Pollinator: Send + Sync {
    /// `true` while the underlying link can carry commands.
    fn is_connected(&self) -> bool;

    /// Run `strokes` pollination strokes.  Any value of one or less runs the
    /// default single stroke.
    async fn pollinate(&self, strokes: u8) -> CommandOutcome;

    /// Return the head to its rest position.
    async fn home(&self) -> CommandOutcome;

    /// Run the firmware self-test sequence.
    async fn self_test(&self) -> CommandOutcome;

    /// Query the controller's distance reading and readiness.
    async fn status(&self) -> StatusReport;
}

#[cfg(test)]
mod tests {
    use super::*;
    use pollen_types::DeviceStatus;
    use std::sync::atomic::{AtomicU8, Ordering};

    /// Minimal in-process pollinator used only for tests.
    struct CountingPollinator {
        strokes: AtomicU8,
    }

    #[async_trait]
    impl Pollinator for CountingPollinator {
        fn is_connected(&self) -> bool {
            true
        }

        async fn pollinate(&self, strokes: u8) -> CommandOutcome {
            self.strokes.fetch_add(strokes.max(1), Ordering::SeqCst);
            CommandOutcome {
                success: true,
                message: "POLL_DONE".into(),
                distance: Some(20),
            }
        }

        async fn home(&self) -> CommandOutcome {
            CommandOutcome::failed("not supported")
        }

        async fn self_test(&self) -> CommandOutcome {
            CommandOutcome::failed("not supported")
        }

        async fn status(&self) -> StatusReport {
            StatusReport::Snapshot(DeviceStatus {
                distance: Some(20),
                ready: true,
                raw: "STATUS DIST:20 READY:1".into(),
            })
        }
    }

    #[tokio::test]
    async fn trait_object_dispatch() {
        let device: Box<dyn Pollinator> = Box::new(CountingPollinator {
            strokes: AtomicU8::new(0),
        });
        assert!(device.pollinate(2).await.success);
        assert!(device.pollinate(0).await.success);
        assert!(!device.home().await.success);
        assert_eq!(device.status().await.distance(), Some(20));
    }
}
