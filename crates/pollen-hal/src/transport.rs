//! Serial transport seam and controller auto-discovery.
//!
//! The [`SerialChannel`][crate::channel::SerialChannel] never touches the OS
//! serial API directly; it asks a [`PortProvider`] to enumerate and open
//! ports.  [`SystemPorts`] is the real implementation backed by
//! `tokio-serial`; [`SimPorts`][crate::sim::SimPorts] and test doubles plug in
//! the same way.

use pollen_types::PollenError;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_serial::{SerialPortBuilderExt, SerialPortType};

/// USB vendor id assigned to Arduino boards.
pub const CONTROLLER_VENDOR_ID: u16 = 0x2341;

/// Line rate the controller firmware is flashed with.
pub const DEFAULT_BAUD_RATE: u32 = 115_200;

/// Path fragments that mark a port as worth trying when no controller
/// identifies itself by vendor.
const PLAUSIBLE_PATH_TAGS: [&str; 3] = ["USB", "ACM", "COM"];

/// A byte stream to the controller.  Anything that is both readable and
/// writable asynchronously qualifies, so in-memory duplex pipes work in
/// tests.
pub trait Transport: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> Transport for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

pub type BoxedTransport = Box<dyn Transport>;

/// Description of one serial port found during enumeration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PortInfo {
    pub path: String,
    pub manufacturer: Option<String>,
    pub vendor_id: Option<u16>,
}

impl PortInfo {
    /// Create a bare port entry with no USB metadata.
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }

    /// `true` when the port identifies itself as the controller board.
    pub fn is_controller(&self) -> bool {
        let by_manufacturer = self
            .manufacturer
            .as_deref()
            .is_some_and(|m| m.contains("Arduino") || m.contains("arduino"));
        by_manufacturer || self.vendor_id == Some(CONTROLLER_VENDOR_ID)
    }

    /// `true` when the path looks like a USB-serial or COM device.
    pub fn is_plausible(&self) -> bool {
        PLAUSIBLE_PATH_TAGS.iter().any(|tag| self.path.contains(tag))
    }
}

/// Order `ports` into the sequence [`SerialChannel::connect`] should try:
/// ports identifying as the controller first, then every other plausible
/// USB/ACM/COM path.  Ports matching neither are never tried.
///
/// [`SerialChannel::connect`]: crate::channel::SerialChannel::connect
pub fn candidate_ports(ports: &[PortInfo]) -> Vec<String> {
    let mut ordered: Vec<String> = ports
        .iter()
        .filter(|p| p.is_controller())
        .map(|p| p.path.clone())
        .collect();
    for port in ports.iter().filter(|p| p.is_plausible()) {
        if !ordered.contains(&port.path) {
            ordered.push(port.path.clone());
        }
    }
    ordered
}

/// Enumerates and opens serial ports.
pub trait PortProvider: Send + Sync {
    /// List the ports currently present on the system.
    ///
    /// # Errors
    ///
    /// Returns [`PollenError::DeviceNotFound`] when enumeration itself fails.
    fn list_ports(&self) -> Result<Vec<PortInfo>, PollenError>;

    /// Open `path` at `baud_rate`.
    ///
    /// # Errors
    ///
    /// Returns [`PollenError::Link`] when the port cannot be opened.
    fn open(&self, path: &str, baud_rate: u32) -> Result<BoxedTransport, PollenError>;
}

/// [`PortProvider`] backed by the operating system's serial ports.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemPorts;

impl PortProvider for SystemPorts {
    fn list_ports(&self) -> Result<Vec<PortInfo>, PollenError> {
        let ports = tokio_serial::available_ports()
            .map_err(|e| PollenError::DeviceNotFound(format!("port enumeration failed: {e}")))?;
        Ok(ports
            .into_iter()
            .map(|port| {
                let (manufacturer, vendor_id) = match port.port_type {
                    SerialPortType::UsbPort(usb) => (usb.manufacturer, Some(usb.vid)),
                    _ => (None, None),
                };
                PortInfo {
                    path: port.port_name,
                    manufacturer,
                    vendor_id,
                }
            })
            .collect())
    }

    fn open(&self, path: &str, baud_rate: u32) -> Result<BoxedTransport, PollenError> {
        let stream = tokio_serial::new(path, baud_rate)
            .open_native_async()
            .map_err(|e| PollenError::Link(format!("failed to open {path}: {e}")))?;
        Ok(Box::new(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn usb(path: &str, manufacturer: &str, vid: u16) -> PortInfo {
        PortInfo {
            path: path.into(),
            manufacturer: Some(manufacturer.into()),
            vendor_id: Some(vid),
        }
    }

    #[test]
    fn controller_detected_by_manufacturer_or_vendor() {
        assert!(usb("/dev/ttyACM0", "Arduino LLC", 0x0000).is_controller());
        assert!(usb("/dev/ttyACM0", "arduino.cc", 0x0000).is_controller());
        assert!(usb("/dev/ttyUSB3", "Unknown", CONTROLLER_VENDOR_ID).is_controller());
        assert!(!usb("/dev/ttyUSB0", "FTDI", 0x0403).is_controller());
    }

    #[test]
    fn candidates_put_controller_first_then_plausible_paths() {
        let ports = vec![
            PortInfo::new("/dev/ttyS0"),
            usb("/dev/ttyUSB0", "FTDI", 0x0403),
            usb("/dev/ttyACM1", "Arduino LLC", CONTROLLER_VENDOR_ID),
            PortInfo::new("COM4"),
        ];
        assert_eq!(
            candidate_ports(&ports),
            vec!["/dev/ttyACM1", "/dev/ttyUSB0", "COM4"]
        );
    }

    #[test]
    fn candidates_empty_when_nothing_plausible() {
        let ports = vec![PortInfo::new("/dev/ttyS0"), PortInfo::new("/dev/null")];
        assert!(candidate_ports(&ports).is_empty());
    }
}
