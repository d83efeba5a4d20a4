//! Serial port channel
//!
//! Hardware connection to a controller over USB or RS-232 using the
//! `serialport` crate. Reads use a short timeout so the executor loop
//! stays responsive.

use std::io::{ErrorKind, Read, Write};
use std::time::Duration;

use gcodelink_core::{ChannelError, PortSettings};

use super::{ChannelOpener, SerialChannel};

const READ_TIMEOUT: Duration = Duration::from_millis(10);
const READ_CHUNK: usize = 256;

/// Information about an available serial port
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerialPortInfo {
    /// Port name (e.g., "/dev/ttyUSB0", "COM3")
    pub port_name: String,

    /// Port description (e.g., "USB Serial Port")
    pub description: String,

    /// Manufacturer name if available
    pub manufacturer: Option<String>,

    /// USB vendor ID if applicable
    pub vid: Option<u16>,

    /// USB product ID if applicable
    pub pid: Option<u16>,
}

/// List serial ports that look like CNC controllers
///
/// Enumeration failures are logged and yield an empty list.
pub fn list_ports() -> Vec<SerialPortInfo> {
    match serialport::available_ports() {
        Ok(ports) => ports
            .iter()
            .filter(|port| is_valid_cnc_port(&port.port_name))
            .map(|port| match &port.port_type {
                serialport::SerialPortType::UsbPort(usb) => SerialPortInfo {
                    port_name: port.port_name.clone(),
                    description: format!(
                        "USB {} {}",
                        usb.manufacturer.as_deref().unwrap_or("Device"),
                        usb.product.as_deref().unwrap_or("Serial Port")
                    ),
                    manufacturer: usb.manufacturer.clone(),
                    vid: Some(usb.vid),
                    pid: Some(usb.pid),
                },
                other => SerialPortInfo {
                    port_name: port.port_name.clone(),
                    description: match other {
                        serialport::SerialPortType::BluetoothPort => "Bluetooth Serial",
                        serialport::SerialPortType::PciPort => "PCI Serial",
                        _ => "Serial Port",
                    }
                    .to_string(),
                    manufacturer: None,
                    vid: None,
                    pid: None,
                },
            })
            .collect(),
        Err(e) => {
            tracing::warn!("Failed to enumerate serial ports: {}", e);
            Vec::new()
        }
    }
}

/// Names of the ports returned by [`list_ports`]
pub fn list_port_names() -> Vec<String> {
    list_ports().into_iter().map(|info| info.port_name).collect()
}

/// Check if a port name matches CNC controller patterns
///
/// - Windows: COM* (COM1, COM2, etc.)
/// - Linux: /dev/ttyUSB*, /dev/ttyACM*
/// - macOS: /dev/cu.usbserial-*, /dev/cu.usbmodem*
pub fn is_valid_cnc_port(port_name: &str) -> bool {
    if let Some(digits) = port_name.strip_prefix("COM") {
        return !digits.is_empty() && digits.chars().all(|c| c.is_ascii_digit());
    }

    port_name.starts_with("/dev/ttyUSB")
        || port_name.starts_with("/dev/ttyACM")
        || port_name.starts_with("/dev/cu.usbserial-")
        || port_name.starts_with("/dev/cu.usbmodem")
}

/// An open hardware serial port
pub struct SerialPortChannel {
    name: String,
    port: Box<dyn serialport::SerialPort>,
}

impl SerialPortChannel {
    /// Open `settings.port` at `settings.baud_rate`, 8N1 without flow control
    pub fn open(settings: &PortSettings) -> Result<Self, ChannelError> {
        let port = serialport::new(&settings.port, settings.baud_rate)
            .timeout(READ_TIMEOUT)
            .data_bits(serialport::DataBits::Eight)
            .stop_bits(serialport::StopBits::One)
            .parity(serialport::Parity::None)
            .flow_control(serialport::FlowControl::None)
            .open()
            .map_err(|e| {
                tracing::warn!("Failed to open serial port {}: {}", settings.port, e);
                ChannelError::Open {
                    port: settings.port.clone(),
                    reason: e.to_string(),
                }
            })?;

        tracing::info!("Opened {} at {} baud", settings.port, settings.baud_rate);
        Ok(Self {
            name: settings.port.clone(),
            port,
        })
    }
}

impl SerialChannel for SerialPortChannel {
    fn read_available(&mut self) -> Result<Vec<u8>, ChannelError> {
        let mut received = Vec::new();
        let mut buf = [0u8; READ_CHUNK];
        loop {
            match self.port.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    received.extend_from_slice(&buf[..n]);
                    if n < buf.len() {
                        break;
                    }
                }
                Err(e) if e.kind() == ErrorKind::TimedOut => break,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(ChannelError::Read(e.to_string())),
            }
        }
        Ok(received)
    }

    fn write(&mut self, data: &[u8]) -> Result<(), ChannelError> {
        self.port
            .write_all(data)
            .and_then(|_| self.port.flush())
            .map_err(|e| ChannelError::Write(e.to_string()))
    }

    fn name(&self) -> &str {
        &self.name
    }
}

impl std::fmt::Debug for SerialPortChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SerialPortChannel")
            .field("name", &self.name)
            .finish()
    }
}

/// Opens hardware serial ports
#[derive(Debug, Clone, Copy, Default)]
pub struct SerialPortOpener;

impl ChannelOpener for SerialPortOpener {
    fn open(&self, settings: &PortSettings) -> Result<Box<dyn SerialChannel>, ChannelError> {
        Ok(Box::new(SerialPortChannel::open(settings)?))
    }

    fn list_ports(&self) -> Vec<String> {
        list_port_names()
    }
}
