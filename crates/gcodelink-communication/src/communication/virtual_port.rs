//! In-memory Grbl-like device
//!
//! [`VirtualDevice`] answers like a Grbl controller: every newline
//! terminated line is acknowledged with `ok` (or `error:N` when it matches
//! a configured failure), `?` is answered with a status report and the
//! other realtime bytes are recorded without a reply. Acknowledgements can
//! be held back and released later to drive the executor step by step.
//!
//! The device is shared: clones observe the same state, so a test keeps
//! one handle while the executor owns the channel.

use std::collections::VecDeque;
use std::sync::Arc;

use gcodelink_core::{ChannelError, PortSettings};
use parking_lot::Mutex;

use super::{ChannelOpener, SerialChannel};

const REALTIME_BYTES: [u8; 4] = [b'?', b'~', b'!', 0x18];
const DEFAULT_STATUS: &str = "<Idle|MPos:0.000,0.000,0.000|FS:0,0>";

#[derive(Debug)]
struct DeviceState {
    partial: Vec<u8>,
    lines: Vec<String>,
    realtime: Vec<u8>,
    outbox: VecDeque<u8>,
    held: VecDeque<String>,
    auto_ack: bool,
    failures: Vec<(String, u8)>,
    status_line: String,
    banner: Option<String>,
    fail_open: bool,
    fail_read: bool,
    fail_write: bool,
    open_count: usize,
}

impl Default for DeviceState {
    fn default() -> Self {
        Self {
            partial: Vec::new(),
            lines: Vec::new(),
            realtime: Vec::new(),
            outbox: VecDeque::new(),
            held: VecDeque::new(),
            auto_ack: true,
            failures: Vec::new(),
            status_line: DEFAULT_STATUS.to_string(),
            banner: None,
            fail_open: false,
            fail_read: false,
            fail_write: false,
            open_count: 0,
        }
    }
}

impl DeviceState {
    fn reply(&mut self, line: String) {
        self.outbox.extend(line.as_bytes());
        self.outbox.extend(b"\r\n");
    }

    fn receive(&mut self, data: &[u8]) {
        for &byte in data {
            if REALTIME_BYTES.contains(&byte) {
                self.realtime.push(byte);
                match byte {
                    b'?' => {
                        let status = self.status_line.clone();
                        self.reply(status);
                    }
                    0x18 => {
                        self.partial.clear();
                        self.held.clear();
                    }
                    _ => {}
                }
                continue;
            }

            if byte != b'\n' {
                self.partial.push(byte);
                continue;
            }

            let raw = std::mem::take(&mut self.partial);
            let line = String::from_utf8_lossy(&raw).trim_end_matches('\r').to_string();
            let answer = match self.failures.iter().find(|(pattern, _)| line.contains(pattern)) {
                Some((_, code)) => format!("error:{}", code),
                None => "ok".to_string(),
            };
            self.lines.push(line);
            if self.auto_ack {
                self.reply(answer);
            } else {
                self.held.push_back(answer);
            }
        }
    }
}

/// Shared handle to an in-memory device
#[derive(Debug, Clone, Default)]
pub struct VirtualDevice {
    state: Arc<Mutex<DeviceState>>,
}

impl VirtualDevice {
    /// Create a device that acknowledges every line at once
    pub fn new() -> Self {
        Self::default()
    }

    /// Opener producing channels to this device
    pub fn opener(&self) -> VirtualOpener {
        VirtualOpener {
            device: self.clone(),
        }
    }

    /// Toggle immediate acknowledgement; turning it on releases held replies
    pub fn set_auto_ack(&self, enabled: bool) {
        let mut state = self.state.lock();
        state.auto_ack = enabled;
        if enabled {
            while let Some(answer) = state.held.pop_front() {
                state.reply(answer);
            }
        }
    }

    /// Release the oldest held reply, returning false if none was held
    pub fn release_ack(&self) -> bool {
        let mut state = self.state.lock();
        match state.held.pop_front() {
            Some(answer) => {
                state.reply(answer);
                true
            }
            None => false,
        }
    }

    /// Release every held reply, returning how many were released
    pub fn release_all(&self) -> usize {
        let mut state = self.state.lock();
        let mut released = 0;
        while let Some(answer) = state.held.pop_front() {
            state.reply(answer);
            released += 1;
        }
        released
    }

    /// Number of replies waiting for release
    pub fn held_acks(&self) -> usize {
        self.state.lock().held.len()
    }

    /// Answer lines containing `pattern` with `error:code`
    pub fn fail_on(&self, pattern: impl Into<String>, code: u8) {
        self.state.lock().failures.push((pattern.into(), code));
    }

    /// Status line sent in reply to `?`
    pub fn set_status_line(&self, line: impl Into<String>) {
        self.state.lock().status_line = line.into();
    }

    /// Line sent as soon as a channel is opened
    pub fn set_banner(&self, banner: impl Into<String>) {
        self.state.lock().banner = Some(banner.into());
    }

    /// Queue an unsolicited device line
    pub fn push_line(&self, line: impl Into<String>) {
        self.state.lock().reply(line.into());
    }

    /// Make subsequent opens fail
    pub fn set_fail_open(&self, fail: bool) {
        self.state.lock().fail_open = fail;
    }

    /// Make subsequent reads fail
    pub fn set_fail_read(&self, fail: bool) {
        self.state.lock().fail_read = fail;
    }

    /// Make subsequent writes fail
    pub fn set_fail_write(&self, fail: bool) {
        self.state.lock().fail_write = fail;
    }

    /// Every complete line received, in order
    pub fn written_lines(&self) -> Vec<String> {
        self.state.lock().lines.clone()
    }

    /// Every realtime byte received, in order
    pub fn realtime_bytes(&self) -> Vec<u8> {
        self.state.lock().realtime.clone()
    }

    /// Number of successful opens
    pub fn open_count(&self) -> usize {
        self.state.lock().open_count
    }
}

/// Channel end of a [`VirtualDevice`]
#[derive(Debug)]
pub struct VirtualChannel {
    name: String,
    device: VirtualDevice,
}

impl SerialChannel for VirtualChannel {
    fn read_available(&mut self) -> Result<Vec<u8>, ChannelError> {
        let mut state = self.device.state.lock();
        if state.fail_read {
            return Err(ChannelError::Read("virtual device read failure".to_string()));
        }
        Ok(state.outbox.drain(..).collect())
    }

    fn write(&mut self, data: &[u8]) -> Result<(), ChannelError> {
        let mut state = self.device.state.lock();
        if state.fail_write {
            return Err(ChannelError::Write("virtual device write failure".to_string()));
        }
        state.receive(data);
        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Opens channels to a [`VirtualDevice`]
#[derive(Debug, Clone, Default)]
pub struct VirtualOpener {
    device: VirtualDevice,
}

impl VirtualOpener {
    /// The device behind this opener
    pub fn device(&self) -> &VirtualDevice {
        &self.device
    }
}

impl ChannelOpener for VirtualOpener {
    fn open(&self, settings: &PortSettings) -> Result<Box<dyn SerialChannel>, ChannelError> {
        let mut state = self.device.state.lock();
        if state.fail_open {
            return Err(ChannelError::Open {
                port: settings.port.clone(),
                reason: "virtual device refused".to_string(),
            });
        }
        state.open_count += 1;
        state.partial.clear();
        state.held.clear();
        state.outbox.clear();
        if let Some(banner) = state.banner.clone() {
            state.reply(banner);
        }
        Ok(Box::new(VirtualChannel {
            name: settings.port.clone(),
            device: self.device.clone(),
        }))
    }

    fn list_ports(&self) -> Vec<String> {
        vec!["virtual".to_string()]
    }
}
