//! In-process simulated controller for running without hardware.
//!
//! [`SimController`] emulates the pollinator firmware behind an in-memory
//! duplex pipe: it prints the boot banner, answers `POLL[:n]`, `HOME`,
//! `TEST` and `STATUS`, and records every command it receives.
//! [`SimPorts`] exposes it through the [`PortProvider`] seam so a
//! [`SerialChannel`][crate::channel::SerialChannel] can connect to it like a
//! real port.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use pollen_hal::{ChannelConfig, SerialChannel, SimController, SimPorts};
//!
//! # async fn demo() {
//! let controller = SimController::new().with_distance(18);
//! let channel = SerialChannel::new(
//!     ChannelConfig::default(),
//!     Arc::new(SimPorts::new(controller.clone())),
//! );
//! channel.connect(None).await.expect("sim connects");
//! # }
//! ```

use std::sync::Arc;

use parking_lot::Mutex;
use pollen_types::PollenError;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream};
use tracing::debug;

use crate::reply::READY_BANNER;
use crate::transport::{BoxedTransport, CONTROLLER_VENDOR_ID, PortInfo, PortProvider};

/// Path under which [`SimPorts`] advertises the simulated controller.
pub const SIM_PORT: &str = "sim://pollinator";

/// Furthest distance at which the firmware agrees to pollinate.
pub const SIM_REACH_CM: u32 = 40;

const PIPE_CAPACITY: usize = 1024;

/// Behaviour knobs of the simulated firmware.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimSettings {
    /// Value reported in `DIST:<n>` tokens.
    pub distance_cm: u32,
    /// `POLL` beyond this distance answers `TOO_FAR`.
    pub reach_cm: u32,
    pub banner: bool,
    /// Every command answers `BUSY` and `STATUS` reports `READY:0`.
    pub busy: bool,
    /// Commands are swallowed without a reply.
    pub silent: bool,
}

impl Default for SimSettings {
    fn default() -> Self {
        Self {
            distance_cm: 20,
            reach_cm: SIM_REACH_CM,
            banner: true,
            busy: false,
            silent: false,
        }
    }
}

/// Handle to a simulated controller.  Clones share settings and the command
/// log.
#[derive(Debug, Clone, Default)]
pub struct SimController {
    settings: Arc<Mutex<SimSettings>>,
    commands: Arc<Mutex<Vec<String>>>,
}

impl SimController {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_distance(self, distance_cm: u32) -> Self {
        self.settings.lock().distance_cm = distance_cm;
        self
    }

    pub fn without_banner(self) -> Self {
        self.settings.lock().banner = false;
        self
    }

    pub fn busy(self) -> Self {
        self.settings.lock().busy = true;
        self
    }

    pub fn silent(self) -> Self {
        self.settings.lock().silent = true;
        self
    }

    /// Change the reported distance on a running controller.
    pub fn set_distance(&self, distance_cm: u32) {
        self.settings.lock().distance_cm = distance_cm;
    }

    pub fn settings(&self) -> SimSettings {
        self.settings.lock().clone()
    }

    /// Every command received so far, oldest first.
    pub fn commands(&self) -> Vec<String> {
        self.commands.lock().clone()
    }

    /// Power up a fresh firmware instance and return the host end of its
    /// pipe.  Must be called within a Tokio runtime.
    pub fn attach(&self) -> BoxedTransport {
        let (host, device) = tokio::io::duplex(PIPE_CAPACITY);
        tokio::spawn(run_firmware(
            device,
            Arc::clone(&self.settings),
            Arc::clone(&self.commands),
        ));
        Box::new(host)
    }
}

/// Reply the firmware gives to `command`, or `None` for no reply.
pub fn respond(command: &str, settings: &SimSettings) -> Option<String> {
    if settings.silent {
        return None;
    }
    let (verb, arg) = match command.split_once(':') {
        Some((verb, arg)) => (verb, Some(arg)),
        None => (command, None),
    };
    let distance = settings.distance_cm;
    let reply = match verb {
        _ if settings.busy && verb != "STATUS" => "BUSY".to_string(),
        "POLL" if distance > settings.reach_cm => format!("TOO_FAR DIST:{distance}"),
        "POLL" => {
            let strokes = arg.and_then(|a| a.parse::<u8>().ok()).unwrap_or(1);
            format!("POLL_DONE:{strokes} DIST:{distance}")
        }
        "HOME" => "HOMED".to_string(),
        "TEST" => "TEST_DONE".to_string(),
        "STATUS" => format!(
            "STATUS DIST:{distance} READY:{}",
            if settings.busy { 0 } else { 1 }
        ),
        _ => format!("ERR unknown command {command}"),
    };
    Some(reply)
}

async fn run_firmware(
    device: DuplexStream,
    settings: Arc<Mutex<SimSettings>>,
    commands: Arc<Mutex<Vec<String>>>,
) {
    let (reader, mut writer) = tokio::io::split(device);
    let banner = settings.lock().banner;
    if banner {
        let line = format!("{READY_BANNER}\n");
        if writer.write_all(line.as_bytes()).await.is_err() {
            return;
        }
    }

    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let command = line.trim().to_string();
        if command.is_empty() {
            continue;
        }
        commands.lock().push(command.clone());
        let snapshot = settings.lock().clone();
        let Some(reply) = respond(&command, &snapshot) else {
            debug!(command = %command, "sim controller swallowed command");
            continue;
        };
        let line = format!("{reply}\n");
        if writer.write_all(line.as_bytes()).await.is_err() {
            break;
        }
    }
    debug!("sim controller powered down");
}

/// [`PortProvider`] exposing one [`SimController`] at [`SIM_PORT`].
#[derive(Debug, Clone, Default)]
pub struct SimPorts {
    controller: SimController,
}

impl SimPorts {
    pub fn new(controller: SimController) -> Self {
        Self { controller }
    }

    pub fn controller(&self) -> &SimController {
        &self.controller
    }
}

impl PortProvider for SimPorts {
    fn list_ports(&self) -> Result<Vec<PortInfo>, PollenError> {
        Ok(vec![PortInfo {
            path: SIM_PORT.to_string(),
            manufacturer: Some("Arduino (simulated)".to_string()),
            vendor_id: Some(CONTROLLER_VENDOR_ID),
        }])
    }

    fn open(&self, path: &str, _baud_rate: u32) -> Result<BoxedTransport, PollenError> {
        if path != SIM_PORT {
            return Err(PollenError::Link(format!("no simulated port at {path}")));
        }
        Ok(self.controller.attach())
    }
}
