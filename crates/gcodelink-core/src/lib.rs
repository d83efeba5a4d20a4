//! # GCodeLink Core
//!
//! Core types shared by every GCodeLink crate: the event model and
//! mailboxes actors talk through, loaded programs, device status types,
//! configuration and the error taxonomy.

pub mod config;
pub mod control;
pub mod data;
pub mod error;
pub mod event_bus;

pub use config::{AppConfig, DeviceConfig, DeviceKind, ExecutorConfig, RemoteConfig, StreamMode};

pub use control::CommandSurface;

pub use data::{
    AxisCoords, AxisPosition, DeviceFault, DeviceStatus, JogRequest, PortSettings, Program,
    RunRequest, ServerInfo,
};

pub use error::{ChannelError, ConfigError, Error, Result};

pub use event_bus::{
    mailbox, ActorId, Event, EventFamily, EventKind, EventSink, ListenerRegistry, Mailbox,
    MailboxClosed, MailboxSender, Payload,
};
