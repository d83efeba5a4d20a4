//! Error handling for GCodeLink
//!
//! Provides the error types shared by every layer:
//! - Channel errors (serial open/read/write failures, fatal to the owner)
//! - Configuration errors (load, parse, validation)
//!
//! Device-protocol errors (`error:` replies) are not Rust errors; they are
//! classified responses and travel as notifications.
//!
//! All error types use `thiserror`.

use std::io;
use thiserror::Error;

/// Serial channel error type
///
/// Any of these is fatal to the actor owning the channel.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChannelError {
    /// The channel could not be opened
    #[error("Failed to open {port}: {reason}")]
    Open {
        /// The port name.
        port: String,
        /// The reason the open failed.
        reason: String,
    },

    /// Reading from the channel failed
    #[error("Read failed: {0}")]
    Read(String),

    /// Writing to the channel failed
    #[error("Write failed: {0}")]
    Write(String),

    /// An operation required an open channel
    #[error("Channel not open")]
    NotOpen,
}

/// Configuration error type
#[derive(Error, Debug)]
pub enum ConfigError {
    /// I/O error reading or writing a configuration file
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// TOML parse error
    #[error("TOML error: {0}")]
    TomlDe(#[from] toml::de::Error),

    /// TOML serialization error
    #[error("TOML error: {0}")]
    TomlSer(#[from] toml::ser::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The configuration file format is not supported
    #[error("Unsupported config format: {0}")]
    UnsupportedFormat(String),

    /// A configuration value is out of valid range
    #[error("Value out of range for '{key}': {value}")]
    ValueOutOfRange {
        /// The configuration key.
        key: String,
        /// The offending value.
        value: String,
    },
}

/// Main error type for GCodeLink
#[derive(Error, Debug)]
pub enum Error {
    /// Serial channel error
    #[error(transparent)]
    Channel(#[from] ChannelError),

    /// Configuration error
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// A mailbox had no receiver left
    #[error("Mailbox closed")]
    MailboxClosed,

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Create a generic error from a message
    pub fn other(message: impl Into<String>) -> Self {
        Self::Other(message.into())
    }
}

impl From<crate::event_bus::MailboxClosed> for Error {
    fn from(_: crate::event_bus::MailboxClosed) -> Self {
        Self::MailboxClosed
    }
}

/// Result type alias using the GCodeLink error type
pub type Result<T> = std::result::Result<T, Error>;

/// Result type alias for configuration operations
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;
