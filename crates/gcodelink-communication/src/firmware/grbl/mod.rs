//! Grbl device protocol
//!
//! Grbl accepts newline-terminated ASCII lines into a 127 byte receive
//! buffer and answers every line with exactly one `ok` or `error:`. The
//! host keeps a FIFO of line sizes it has written and retires the oldest
//! entry on each answer, so it always knows how full the device buffer is.

pub mod error_decoder;
pub mod status_parser;

use std::collections::VecDeque;
use std::sync::LazyLock;

use gcodelink_core::{AxisCoords, DeviceConfig, JogRequest};
use regex::Regex;

use crate::firmware::{DeviceProtocol, DeviceResponse, RealtimeCommand};

static ACK_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^ok\s*$").expect("valid regex"));
static ERROR_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^error:(.*)$").expect("valid regex"));
static VERSION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^Grbl\s+(\S+)(?:\s+\[.*\])?").expect("valid regex"));
static ALARM_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^ALARM:(.*)$").expect("valid regex"));

/// Grbl status query byte
pub const STATUS_QUERY: u8 = b'?';
/// Grbl cycle start byte
pub const CYCLE_START: u8 = b'~';
/// Grbl feed hold byte
pub const FEED_HOLD: u8 = b'!';
/// Grbl soft reset byte (ctrl-x)
pub const SOFT_RESET: u8 = 0x18;

/// Grbl protocol state and buffer accounting
#[derive(Debug, Clone)]
pub struct GrblDevice {
    capacity: usize,
    watermark: usize,
    in_flight: VecDeque<usize>,
    bytes_in_flight: usize,
    version: Option<String>,
}

impl GrblDevice {
    /// Create a Grbl device from configuration
    pub fn new(config: &DeviceConfig) -> Self {
        Self {
            capacity: config.buffer_capacity,
            watermark: config.watermark(),
            in_flight: VecDeque::new(),
            bytes_in_flight: 0,
            version: None,
        }
    }

    /// Flow-control threshold in bytes
    pub fn watermark(&self) -> usize {
        self.watermark
    }

    /// Last version banner seen
    pub fn version(&self) -> Option<&str> {
        self.version.as_deref()
    }

    /// Sizes of in-flight lines, oldest first
    pub fn in_flight(&self) -> impl Iterator<Item = usize> + '_ {
        self.in_flight.iter().copied()
    }

    fn wire_line(line: &str) -> String {
        format!("{}\n", line.trim_end())
    }

    fn retire_one(&mut self) {
        match self.in_flight.pop_front() {
            Some(size) => self.bytes_in_flight -= size,
            None => tracing::debug!("Acknowledgement with no line in flight"),
        }
    }
}

impl Default for GrblDevice {
    fn default() -> Self {
        Self::new(&DeviceConfig::default())
    }
}

impl DeviceProtocol for GrblDevice {
    fn device_name(&self) -> &str {
        "Grbl"
    }

    fn init_comm(&mut self) {
        self.in_flight.clear();
        self.bytes_in_flight = 0;
    }

    fn configure(&mut self, config: &DeviceConfig) {
        self.capacity = config.buffer_capacity;
        self.watermark = config.watermark();
    }

    fn encode(&mut self, line: &str, bookkeeping: bool) -> Vec<u8> {
        let bytes = Self::wire_line(line).into_bytes();
        if bookkeeping {
            self.in_flight.push_back(bytes.len());
            self.bytes_in_flight += bytes.len();
        }
        bytes
    }

    fn ok_to_send(&self, line: &str) -> bool {
        let candidate = Self::wire_line(line).len();
        self.bytes_in_flight + candidate <= self.watermark
    }

    fn decode(&mut self, raw: &str) -> DeviceResponse {
        let line = raw.trim_end_matches(['\r', '\n']);

        if let Some(mut status) = status_parser::parse_status(line) {
            status.buffer_usage = self.buffer_usage_percent();
            return DeviceResponse::Status(status);
        }

        if ACK_RE.is_match(line) {
            self.retire_one();
            return DeviceResponse::Ack;
        }

        if let Some(caps) = ERROR_RE.captures(line) {
            self.retire_one();
            let detail = caps.get(1).map(|m| m.as_str()).unwrap_or("");
            return DeviceResponse::Error(error_decoder::error_fault(line, detail));
        }

        if let Some(caps) = VERSION_RE.captures(line) {
            let version = caps.get(1).map(|m| m.as_str()).unwrap_or("").to_string();
            self.version = Some(version.clone());
            return DeviceResponse::Version(version);
        }

        if let Some(caps) = ALARM_RE.captures(line) {
            let detail = caps.get(1).map(|m| m.as_str()).unwrap_or("");
            return DeviceResponse::Alarm(error_decoder::alarm_fault(line, detail));
        }

        DeviceResponse::Raw(line.to_string())
    }

    fn get_status(&self) -> Vec<u8> {
        vec![STATUS_QUERY]
    }

    fn get_set_axis_cmd(&self, axes: &AxisCoords) -> String {
        format!("G92 {}", axes.words())
    }

    fn get_home_cmds(&self, axes: &AxisCoords) -> Vec<String> {
        let requested = axes.axes();
        let everything = requested.len() >= 3
            && ['X', 'Y', 'Z']
                .iter()
                .all(|letter| requested.iter().any(|(l, _)| l == letter));
        if requested.is_empty() || everything {
            vec!["$H".to_string()]
        } else {
            requested
                .iter()
                .map(|(letter, _)| format!("$H{}", letter))
                .collect()
        }
    }

    fn get_jog_cmds(&self, jog: &JogRequest, relative: bool, rapid: bool) -> Vec<String> {
        let distance_mode = if relative { "G91" } else { "G90" };
        let words = jog.axes.words();
        if rapid {
            let mut commands = vec![format!("{} G0 {}", distance_mode, words)];
            if relative {
                commands.push("G90".to_string());
            }
            commands
        } else {
            match jog.feed {
                Some(feed) => vec![format!("$J={} {} F{}", distance_mode, words, feed)],
                None => vec![format!("$J={} {}", distance_mode, words)],
            }
        }
    }

    fn get_clear_alarm_cmd(&self) -> String {
        "$X".to_string()
    }

    fn get_realtime_cmd(&self, command: RealtimeCommand) -> Vec<u8> {
        match command {
            RealtimeCommand::CycleStart => vec![CYCLE_START],
            RealtimeCommand::FeedHold => vec![FEED_HOLD],
            RealtimeCommand::Reset => vec![SOFT_RESET],
        }
    }

    fn bytes_in_flight(&self) -> usize {
        self.bytes_in_flight
    }

    fn lines_in_flight(&self) -> usize {
        self.in_flight.len()
    }

    fn buffer_capacity(&self) -> usize {
        self.capacity
    }
}
