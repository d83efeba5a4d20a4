//! Event type definitions for the event bus.
//!
//! Every message exchanged between actors is an [`Event`]: a kind, a typed
//! payload and the identity of the actor that produced it. Events are
//! cloneable and serializable so the same value can cross a network hop.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use uuid::Uuid;

use crate::config::AppConfig;
use crate::data::{
    AxisCoords, DeviceFault, DeviceStatus, JogRequest, PortSettings, Program, RunRequest,
    ServerInfo,
};

/// Identity of an actor (executor, transport server, client, UI)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ActorId(Uuid);

impl ActorId {
    /// Create a new unique actor id
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// The nil id, used by events that have no meaningful sender
    pub fn nil() -> Self {
        Self(Uuid::nil())
    }
}

impl Default for ActorId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ActorId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Actor({})", &self.0.to_string()[..8])
    }
}

/// Event family
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventFamily {
    /// Imperative, consumed by exactly one actor.
    Command,
    /// Broadcastable, fanned out to every listener.
    Notification,
}

impl std::fmt::Display for EventFamily {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EventFamily::Command => write!(f, "Command"),
            EventFamily::Notification => write!(f, "Notification"),
        }
    }
}

/// Every kind of event the engine understands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventKind {
    // Commands
    /// Start or resume program execution.
    Run,
    /// Execute exactly one program line.
    Step,
    /// Return to idle, abandoning any acknowledgement wait.
    Stop,
    /// Stop issuing program lines until the next RUN.
    Pause,
    /// Write a raw line, bypassing program sequencing.
    Send,
    /// Write a raw line and hold the executor until it is acknowledged.
    SendWithAck,
    /// Query device status.
    GetStatus,
    /// Set work coordinates for the given axes.
    SetAxis,
    /// Run the homing cycle.
    Home,
    /// Absolute jog.
    JogMove,
    /// Relative jog.
    JogMoveRelative,
    /// Absolute rapid move.
    JogRapidMove,
    /// Relative rapid move.
    JogRapidMoveRelative,
    /// Realtime cycle start / resume.
    CycleStart,
    /// Realtime feed hold.
    FeedHold,
    /// Drop pending writes and flush the device.
    QueueFlush,
    /// Realtime soft reset.
    Reset,
    /// Unlock the device after an alarm.
    ClearAlarm,
    /// Open the device channel.
    Open,
    /// Close the device channel.
    Close,
    /// Terminate the receiving actor.
    Exit,
    /// Request configuration and serial port candidates.
    GetConfig,
    /// Replace runtime configuration.
    UpdateConfig,
    /// Request the loaded program.
    GetGcode,
    /// Request the breakpoint set.
    GetBreakpoints,

    // Notifications
    /// Parsed device status report.
    DataStatus,
    /// Raw line received from the device.
    DataIn,
    /// Raw line written to the device.
    DataOut,
    /// Program counter changed.
    PcUpdate,
    /// RUN reached the end of the program.
    RunEnd,
    /// STEP finished its line.
    StepEnd,
    /// Execution stopped on a breakpoint.
    BreakpointHit,
    /// Device version banner seen.
    DeviceDetected,
    /// Device channel opened.
    PortOpen,
    /// Device channel closed.
    PortClose,
    /// Fatal channel failure, the actor is shutting down.
    Abort,
    /// Embedded `(MSG, ...)` directive reached.
    GcodeMessage,
    /// Device classified an `error:` response.
    DeviceError,
    /// Device reported an alarm.
    Alarm,
    /// Reply to GET_GCODE.
    Gcode,
    /// A program was loaded; carries its fingerprint.
    ProgramLoaded,
    /// RUN/STEP named a fingerprint that is not loaded.
    ProgramUnknown,
    /// Reply to GET_BREAKPOINTS.
    Breakpoints,
    /// Reply to GET_CONFIG.
    Config,
    /// Server welcome / client connected.
    Hello,
    /// Server or client is going away.
    Goodbye,
}

impl EventKind {
    /// Get the family of this kind
    pub fn family(&self) -> EventFamily {
        use EventKind::*;
        match self {
            Run | Step | Stop | Pause | Send | SendWithAck | GetStatus | SetAxis | Home
            | JogMove | JogMoveRelative | JogRapidMove | JogRapidMoveRelative | CycleStart
            | FeedHold | QueueFlush | Reset | ClearAlarm | Open | Close | Exit | GetConfig
            | UpdateConfig | GetGcode | GetBreakpoints => EventFamily::Command,
            DataStatus | DataIn | DataOut | PcUpdate | RunEnd | StepEnd | BreakpointHit
            | DeviceDetected | PortOpen | PortClose | Abort | GcodeMessage | DeviceError
            | Alarm | Gcode | ProgramLoaded | ProgramUnknown | Breakpoints | Config | Hello
            | Goodbye => EventFamily::Notification,
        }
    }

    /// True for command kinds
    pub fn is_command(&self) -> bool {
        self.family() == EventFamily::Command
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Serialized name doubles as the display name.
        match serde_json::to_value(self) {
            Ok(serde_json::Value::String(name)) => write!(f, "{}", name),
            _ => write!(f, "{:?}", self),
        }
    }
}

/// Typed event payload
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum Payload {
    /// No payload.
    #[default]
    None,
    /// Free text (raw device lines, diagnostics, messages).
    Text(String),
    /// A program counter value.
    Pc(usize),
    /// RUN / STEP arguments.
    Run(RunRequest),
    /// Parsed device status.
    Status(DeviceStatus),
    /// Axis coordinates for SET_AXIS / HOME.
    Axes(AxisCoords),
    /// Jog target and feed.
    Jog(JogRequest),
    /// A loaded program.
    Program(Program),
    /// A breakpoint set.
    Breakpoints(BTreeSet<usize>),
    /// Device channel settings for OPEN.
    Port(PortSettings),
    /// Full configuration, for UPDATE_CONFIG.
    Config(Box<AppConfig>),
    /// Configuration plus discovered serial ports, for the CONFIG reply.
    ConfigReport {
        /// Active configuration.
        config: Box<AppConfig>,
        /// Serial port candidates.
        ports: Vec<String>,
    },
    /// Server identity for HELLO.
    Welcome(ServerInfo),
    /// A classified device error or alarm.
    Fault(DeviceFault),
}

impl Payload {
    /// Text content, if this is a text payload
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Payload::Text(text) => Some(text),
            _ => None,
        }
    }

    /// Program counter, if this is a PC payload
    pub fn as_pc(&self) -> Option<usize> {
        match self {
            Payload::Pc(pc) => Some(*pc),
            _ => None,
        }
    }
}

/// A message between actors
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// What happened or what is requested.
    pub kind: EventKind,
    /// Associated data.
    #[serde(default)]
    pub payload: Payload,
    /// Originating actor.
    pub sender: ActorId,
}

impl Event {
    /// Create a new event
    pub fn new(kind: EventKind, payload: Payload, sender: ActorId) -> Self {
        Self {
            kind,
            payload,
            sender,
        }
    }

    /// Create an event without payload
    pub fn bare(kind: EventKind, sender: ActorId) -> Self {
        Self::new(kind, Payload::None, sender)
    }

    /// Replace the sender, keeping kind and payload
    pub fn restamped(mut self, sender: ActorId) -> Self {
        self.sender = sender;
        self
    }

    /// Short description for logging
    pub fn description(&self) -> String {
        match &self.payload {
            Payload::None => format!("{} from {}", self.kind, self.sender),
            Payload::Text(text) => format!("{} '{}' from {}", self.kind, text.trim(), self.sender),
            Payload::Pc(pc) => format!("{} pc={} from {}", self.kind, pc, self.sender),
            _ => format!("{} (with payload) from {}", self.kind, self.sender),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_families() {
        assert!(EventKind::Run.is_command());
        assert!(EventKind::GetBreakpoints.is_command());
        assert!(!EventKind::DataStatus.is_command());
        assert_eq!(EventKind::Hello.family(), EventFamily::Notification);
    }

    #[test]
    fn test_kind_display_uses_wire_name() {
        assert_eq!(EventKind::SendWithAck.to_string(), "SEND_WITH_ACK");
        assert_eq!(EventKind::PcUpdate.to_string(), "PC_UPDATE");
    }

    #[test]
    fn test_restamp_keeps_payload() {
        let original = Event::new(EventKind::PcUpdate, Payload::Pc(4), ActorId::new());
        let server = ActorId::new();
        let stamped = original.clone().restamped(server);
        assert_eq!(stamped.sender, server);
        assert_eq!(stamped.payload, original.payload);
        assert_eq!(stamped.kind, EventKind::PcUpdate);
    }

    #[test]
    fn test_event_json_shape() {
        let event = Event::new(
            EventKind::Send,
            Payload::Text("G0 X1".to_string()),
            ActorId::nil(),
        );
        let value = serde_json::to_value(&event).expect("serialize");
        assert_eq!(value["kind"], "SEND");
        assert_eq!(value["payload"]["type"], "text");
        assert_eq!(value["payload"]["data"], "G0 X1");
    }

    #[test]
    fn test_missing_payload_defaults_to_none() {
        let json = format!(
            "{{\"kind\":\"STOP\",\"sender\":\"{}\"}}",
            uuid::Uuid::nil()
        );
        let event: Event = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(event.payload, Payload::None);
    }
}
