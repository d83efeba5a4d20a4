//! Device protocol implementations
//!
//! The executor only talks to a device through [`DeviceProtocol`]. The
//! concrete variant is chosen once from configuration by [`create_device`].
//!
//! Supported controllers:
//! - Grbl: character-counted text protocol with a fixed receive buffer

pub mod grbl;

use gcodelink_core::{AxisCoords, DeviceConfig, DeviceFault, DeviceKind, DeviceStatus, JogRequest};

pub use grbl::GrblDevice;

/// Classified device reply
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceResponse {
    /// Status report
    Status(DeviceStatus),
    /// Bare acknowledgement
    Ack,
    /// Classified error reply
    Error(DeviceFault),
    /// Version banner
    Version(String),
    /// Alarm report
    Alarm(DeviceFault),
    /// Anything else, passed through untouched
    Raw(String),
}

impl DeviceResponse {
    /// True for replies that retire an in-flight line
    pub fn retires_line(&self) -> bool {
        matches!(self, DeviceResponse::Ack | DeviceResponse::Error(_))
    }
}

/// Realtime (single byte, unbuffered) device commands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RealtimeCommand {
    /// Resume / start the cycle
    CycleStart,
    /// Pause motion
    FeedHold,
    /// Soft reset
    Reset,
}

/// Capability set every device variant provides
///
/// Buffer accounting lives here: `encode` with bookkeeping records the
/// bytes a line occupies in the device's receive buffer and `decode`
/// retires them when the matching acknowledgement or error arrives.
pub trait DeviceProtocol: Send {
    /// Human-readable device name
    fn device_name(&self) -> &str;

    /// Reset buffer accounting for a freshly opened or reset channel
    fn init_comm(&mut self);

    /// Apply new buffer geometry
    fn configure(&mut self, config: &DeviceConfig);

    /// Convert a line to wire bytes, optionally recording it as in flight
    fn encode(&mut self, line: &str, bookkeeping: bool) -> Vec<u8>;

    /// True if `line` fits under the watermark, without mutating state
    fn ok_to_send(&self, line: &str) -> bool;

    /// Classify one received line
    fn decode(&mut self, raw: &str) -> DeviceResponse;

    /// Status query bytes
    fn get_status(&self) -> Vec<u8>;

    /// Command that sets work coordinates
    fn get_set_axis_cmd(&self, axes: &AxisCoords) -> String;

    /// Commands for a homing cycle
    fn get_home_cmds(&self, axes: &AxisCoords) -> Vec<String>;

    /// Commands for a jog
    fn get_jog_cmds(&self, jog: &JogRequest, relative: bool, rapid: bool) -> Vec<String>;

    /// Command that clears an alarm lock
    fn get_clear_alarm_cmd(&self) -> String;

    /// Realtime command bytes
    fn get_realtime_cmd(&self, command: RealtimeCommand) -> Vec<u8>;

    /// Bytes currently in flight
    fn bytes_in_flight(&self) -> usize;

    /// Number of lines currently in flight
    fn lines_in_flight(&self) -> usize;

    /// Receive buffer capacity
    fn buffer_capacity(&self) -> usize;

    /// Utilisation in percent, diagnostic only
    fn buffer_usage_percent(&self) -> f64 {
        let capacity = self.buffer_capacity();
        if capacity == 0 {
            return 0.0;
        }
        100.0 * self.bytes_in_flight() as f64 / capacity as f64
    }
}

/// Build the device variant named by the configuration
pub fn create_device(config: &DeviceConfig) -> Box<dyn DeviceProtocol> {
    match config.kind {
        DeviceKind::Grbl => Box::new(GrblDevice::new(config)),
    }
}
