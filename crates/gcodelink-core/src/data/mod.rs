//! Data models shared between the executor, the device codec and the
//! transport layer.

mod program;

pub use program::{Program, RunRequest};

use serde::{Deserialize, Serialize};

/// Partial axis coordinates
///
/// Each axis is an `Option` where `None` means "not addressed". Used for
/// SET_AXIS, HOME and jog targets.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct AxisCoords {
    /// X axis
    pub x: Option<f64>,
    /// Y axis
    pub y: Option<f64>,
    /// Z axis
    pub z: Option<f64>,
    /// A axis (4th axis)
    pub a: Option<f64>,
    /// B axis (5th axis)
    pub b: Option<f64>,
    /// C axis (6th axis)
    pub c: Option<f64>,
}

impl AxisCoords {
    /// Create empty coordinates (no axis addressed)
    pub fn new() -> Self {
        Self::default()
    }

    /// Coordinates with XYZ set
    pub fn xyz(x: f64, y: f64, z: f64) -> Self {
        Self {
            x: Some(x),
            y: Some(y),
            z: Some(z),
            ..Default::default()
        }
    }

    /// Addressed axes as `(letter, value)` pairs, in XYZABC order
    pub fn axes(&self) -> Vec<(char, f64)> {
        [
            ('X', self.x),
            ('Y', self.y),
            ('Z', self.z),
            ('A', self.a),
            ('B', self.b),
            ('C', self.c),
        ]
        .into_iter()
        .filter_map(|(letter, value)| value.map(|v| (letter, v)))
        .collect()
    }

    /// True if no axis is addressed
    pub fn is_empty(&self) -> bool {
        self.axes().is_empty()
    }

    /// G-code axis words, e.g. `X1 Y-2.5`
    pub fn words(&self) -> String {
        self.axes()
            .iter()
            .map(|(letter, value)| format!("{}{}", letter, value))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Jog target
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct JogRequest {
    /// Target (absolute) or distance (relative) per axis
    pub axes: AxisCoords,
    /// Feed rate; ignored for rapid moves
    pub feed: Option<f64>,
}

/// A full position as reported by the device
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct AxisPosition {
    /// X position
    pub x: f64,
    /// Y position
    pub y: f64,
    /// Z position
    pub z: f64,
    /// A axis position
    pub a: Option<f64>,
    /// B axis position
    pub b: Option<f64>,
    /// C axis position
    pub c: Option<f64>,
}

impl AxisPosition {
    /// Parse a comma-separated coordinate list (at least XYZ)
    pub fn parse(pos_str: &str) -> Option<Self> {
        let coords: Vec<f64> = pos_str
            .split(',')
            .map(|s| s.trim().parse::<f64>())
            .collect::<Result<_, _>>()
            .ok()?;

        if coords.len() < 3 {
            return None;
        }

        Some(Self {
            x: coords[0],
            y: coords[1],
            z: coords[2],
            a: coords.get(3).copied(),
            b: coords.get(4).copied(),
            c: coords.get(5).copied(),
        })
    }

    /// Component-wise difference `self - other`
    pub fn minus(&self, other: &AxisPosition) -> AxisPosition {
        fn sub(a: Option<f64>, b: Option<f64>) -> Option<f64> {
            match (a, b) {
                (Some(a), Some(b)) => Some(a - b),
                (a, None) => a,
                (None, Some(_)) => None,
            }
        }
        AxisPosition {
            x: self.x - other.x,
            y: self.y - other.y,
            z: self.z - other.z,
            a: sub(self.a, other.a),
            b: sub(self.b, other.b),
            c: sub(self.c, other.c),
        }
    }
}

/// Structured fields of a device status report
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceStatus {
    /// Machine state as reported (`Idle`, `Run`, `Hold:0`, ...)
    pub state: String,
    /// Machine position (MPos)
    pub machine_pos: Option<AxisPosition>,
    /// Work position (WPos, or derived from MPos - WCO)
    pub work_pos: Option<AxisPosition>,
    /// Work coordinate offset (WCO)
    pub work_offset: Option<AxisPosition>,
    /// Current feed rate
    pub feed_rate: Option<f64>,
    /// Current spindle speed
    pub spindle_speed: Option<f64>,
    /// Free planner blocks (Bf/Buf first field)
    pub planner_blocks: Option<u32>,
    /// Free receive-buffer bytes (Bf/Buf second field)
    pub rx_bytes: Option<u32>,
    /// Host-side buffer utilisation in percent, diagnostic only
    pub buffer_usage: f64,
}

/// A classified device error or alarm
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceFault {
    /// Numeric code, when the device sent one
    pub code: Option<u8>,
    /// Raw line as received
    pub message: String,
    /// Human-readable description
    pub description: String,
}

/// Device channel settings carried by OPEN
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortSettings {
    /// Port name (e.g. "/dev/ttyUSB0", "COM3")
    pub port: String,
    /// Baud rate
    pub baud_rate: u32,
}

/// Server identity sent in the welcome notification
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerInfo {
    /// Configured server name
    pub name: String,
    /// Server version
    pub version: String,
    /// Host name of the machine running the server
    pub host: String,
    /// Operating system of the host
    pub os: String,
}

impl ServerInfo {
    /// Describe the local host
    pub fn local(name: impl Into<String>, version: impl Into<String>) -> Self {
        let host = std::env::var("HOSTNAME")
            .or_else(|_| std::env::var("COMPUTERNAME"))
            .unwrap_or_else(|_| "unknown".to_string());
        Self {
            name: name.into(),
            version: version.into(),
            host,
            os: std::env::consts::OS.to_string(),
        }
    }
}
