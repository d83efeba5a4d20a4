//! Device channel abstraction
//!
//! A [`SerialChannel`] is a byte pipe to the device. The executor never
//! blocks on it for long: reads return whatever is available after a short
//! timeout. A [`ChannelOpener`] creates channels from [`PortSettings`] and
//! is the seam tests use to substitute the [`virtual_port`] device.

pub mod serial;
pub mod virtual_port;

use gcodelink_core::{ChannelError, PortSettings};

pub use serial::{is_valid_cnc_port, list_port_names, list_ports, SerialPortChannel, SerialPortInfo, SerialPortOpener};
pub use virtual_port::{VirtualChannel, VirtualDevice, VirtualOpener};

/// Bidirectional byte channel to a device
pub trait SerialChannel: Send {
    /// Bytes received since the last call, possibly empty
    fn read_available(&mut self) -> Result<Vec<u8>, ChannelError>;

    /// Write every byte of `data`
    fn write(&mut self, data: &[u8]) -> Result<(), ChannelError>;

    /// Port name, for diagnostics
    fn name(&self) -> &str;
}

/// Factory for device channels
pub trait ChannelOpener: Send + Sync {
    /// Open the channel described by `settings`
    fn open(&self, settings: &PortSettings) -> Result<Box<dyn SerialChannel>, ChannelError>;

    /// Candidate port names for the configuration report
    fn list_ports(&self) -> Vec<String> {
        Vec::new()
    }
}

/// Assembles newline-terminated lines from received byte chunks
///
/// Lines may arrive split across reads. A trailing `\r` is dropped and
/// blank lines are discarded.
#[derive(Debug, Default)]
pub struct LineAssembler {
    partial: Vec<u8>,
}

impl LineAssembler {
    /// Create an empty assembler
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed received bytes, returning every line they complete
    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        let mut lines = Vec::new();
        for &byte in bytes {
            if byte == b'\n' {
                let raw = std::mem::take(&mut self.partial);
                let line = String::from_utf8_lossy(&raw);
                let line = line.trim_end_matches('\r');
                if !line.trim().is_empty() {
                    lines.push(line.to_string());
                }
            } else {
                self.partial.push(byte);
            }
        }
        lines
    }

    /// Drop any incomplete line
    pub fn clear(&mut self) {
        self.partial.clear();
    }

    /// True if an incomplete line is buffered
    pub fn has_partial(&self) -> bool {
        !self.partial.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lines_split_across_reads() {
        let mut assembler = LineAssembler::new();
        assert!(assembler.push(b"o").is_empty());
        assert!(assembler.has_partial());
        assert_eq!(assembler.push(b"k\r\nerr"), vec!["ok"]);
        assert_eq!(assembler.push(b"or:2\n"), vec!["error:2"]);
        assert!(!assembler.has_partial());
    }

    #[test]
    fn test_blank_lines_dropped() {
        let mut assembler = LineAssembler::new();
        assert_eq!(assembler.push(b"\r\n\nok\n"), vec!["ok"]);
    }

    #[test]
    fn test_clear_discards_partial() {
        let mut assembler = LineAssembler::new();
        assembler.push(b"<Idle|MPos");
        assembler.clear();
        assert_eq!(assembler.push(b"ok\n"), vec!["ok"]);
    }
}
