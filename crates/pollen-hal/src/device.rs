//! Serial-backed [`Pollinator`] driver.

use std::sync::Arc;

use async_trait::async_trait;
use pollen_types::{CommandOutcome, DeviceStatus, StatusReport};
use tracing::{info, warn};

use crate::channel::SerialChannel;
use crate::pollinator::Pollinator;
use crate::reply::{NOT_READY_TOKEN, parse_distance};

/// Speaks the controller's command vocabulary over a [`SerialChannel`].
///
/// | Operation | Command | Success marker |
/// |---|---|---|
/// | `pollinate(1)` | `POLL` | `POLL_DONE` |
/// | `pollinate(n)` | `POLL:n` | `POLL_DONE` |
/// | `home` | `HOME` | `HOMED` |
/// | `self_test` | `TEST` | `TEST_DONE` |
/// | `status` | `STATUS` | any reply |
#[derive(Clone)]
pub struct SerialPollinator {
    channel: Arc<SerialChannel>,
}

impl SerialPollinator {
    pub fn new(channel: Arc<SerialChannel>) -> Self {
        Self { channel }
    }

    pub fn channel(&self) -> &Arc<SerialChannel> {
        &self.channel
    }

    /// Wire form of a pollinate request.
    pub fn poll_command(strokes: u8) -> String {
        if strokes > 1 {
            format!("POLL:{strokes}")
        } else {
            "POLL".to_string()
        }
    }

    async fn run(&self, command: &str, success_marker: &str, with_distance: bool) -> CommandOutcome {
        match self.channel.send_default(command).await {
            Ok(reply) => {
                let success = reply.contains(success_marker);
                if success {
                    info!(command, reply = %reply, "controller command completed");
                } else {
                    warn!(command, reply = %reply, "controller refused command");
                }
                CommandOutcome {
                    success,
                    distance: if with_distance { parse_distance(&reply) } else { None },
                    message: reply,
                }
            }
            Err(e) => {
                warn!(command, error = %e, "controller command failed");
                CommandOutcome::failed(e)
            }
        }
    }
}

#[async_trait]
impl Pollinator for SerialPollinator {
    fn is_connected(&self) -> bool {
        self.channel.is_connected()
    }

    async fn pollinate(&self, strokes: u8) -> CommandOutcome {
        let command = Self::poll_command(strokes);
        self.run(&command, "POLL_DONE", true).await
    }

    async fn home(&self) -> CommandOutcome {
        self.run("HOME", "HOMED", false).await
    }

    async fn self_test(&self) -> CommandOutcome {
        self.run("TEST", "TEST_DONE", false).await
    }

    async fn status(&self) -> StatusReport {
        match self.channel.send_default("STATUS").await {
            Ok(reply) => StatusReport::Snapshot(DeviceStatus {
                distance: parse_distance(&reply),
                ready: !reply.contains(NOT_READY_TOKEN),
                raw: reply,
            }),
            Err(e) => {
                warn!(error = %e, "status query failed");
                StatusReport::Unavailable {
                    error: e.to_string(),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ChannelConfig;
    use crate::sim::{SimController, SimPorts};
    use std::time::Duration;

    async fn sim_device(controller: &SimController) -> SerialPollinator {
        let channel = SerialChannel::new(
            ChannelConfig {
                ready_grace: Duration::from_millis(50),
                ..ChannelConfig::default()
            },
            Arc::new(SimPorts::new(controller.clone())),
        );
        channel.connect(None).await.unwrap();
        SerialPollinator::new(Arc::new(channel))
    }

    #[test]
    fn poll_command_forms() {
        assert_eq!(SerialPollinator::poll_command(0), "POLL");
        assert_eq!(SerialPollinator::poll_command(1), "POLL");
        assert_eq!(SerialPollinator::poll_command(3), "POLL:3");
    }

    #[tokio::test]
    async fn pollinate_reports_done_and_distance() {
        let controller = SimController::new().with_distance(18);
        let device = sim_device(&controller).await;

        let outcome = device.pollinate(2).await;
        assert!(outcome.success, "{outcome:?}");
        assert_eq!(outcome.distance, Some(18));
        assert_eq!(controller.commands(), vec!["POLL:2"]);
    }

    #[tokio::test]
    async fn too_far_reply_is_unsuccessful() {
        let controller = SimController::new().with_distance(55);
        let device = sim_device(&controller).await;

        let outcome = device.pollinate(1).await;
        assert!(!outcome.success);
        assert!(outcome.message.contains("TOO_FAR"));
        assert_eq!(outcome.distance, Some(55));
    }

    #[tokio::test]
    async fn busy_controller_refuses_and_reports_not_ready() {
        let controller = SimController::new().busy();
        let device = sim_device(&controller).await;

        let outcome = device.pollinate(1).await;
        assert!(!outcome.success);
        assert_eq!(outcome.message, "BUSY");

        match device.status().await {
            StatusReport::Snapshot(status) => assert!(!status.ready),
            other => panic!("expected snapshot, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn home_and_self_test() {
        let controller = SimController::new();
        let device = sim_device(&controller).await;

        let homed = device.home().await;
        assert!(homed.success);
        assert_eq!(homed.message, "HOMED");
        assert!(device.self_test().await.success);
        assert_eq!(controller.commands(), vec!["HOME", "TEST"]);
    }

    #[tokio::test]
    async fn status_snapshot_parses_distance_and_ready() {
        let controller = SimController::new().with_distance(23);
        let device = sim_device(&controller).await;

        match device.status().await {
            StatusReport::Snapshot(status) => {
                assert_eq!(status.distance, Some(23));
                assert!(status.ready);
            }
            other => panic!("expected snapshot, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn disconnected_operations_fail_without_panicking() {
        let channel = SerialChannel::new(ChannelConfig::default(), Arc::new(SimPorts::default()));
        let device = SerialPollinator::new(Arc::new(channel));

        assert!(!device.is_connected());
        let outcome = device.pollinate(1).await;
        assert!(!outcome.success);
        assert!(outcome.message.contains("Not Connected"));
        assert!(matches!(device.status().await, StatusReport::Unavailable { .. }));
    }
}
