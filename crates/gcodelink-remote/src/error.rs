//! Transport error types

use std::io;

use thiserror::Error;
use tokio_tungstenite::tungstenite;

/// Errors raised while framing or unframing a message
#[derive(Debug, Error)]
pub enum FrameError {
    /// The length header is not a decimal number
    #[error("invalid length header {0:?}")]
    InvalidHeader(String),

    /// The payload exceeds the frame limit or does not fit the header width
    #[error("payload of {size} bytes exceeds the limit of {max}")]
    PayloadTooLarge {
        /// Payload size in bytes
        size: usize,
        /// Largest size accepted
        max: usize,
    },

    /// A standalone frame ended before its declared length
    #[error("frame truncated: expected {expected} bytes, got {actual}")]
    Truncated {
        /// Declared frame length, header included
        expected: usize,
        /// Bytes available
        actual: usize,
    },

    /// A standalone frame carried bytes past its declared length
    #[error("{0} trailing bytes after frame")]
    TrailingData(usize),

    /// The event could not be serialized
    #[error("serialize failed: {0}")]
    Serialize(#[source] serde_json::Error),

    /// The payload is not a valid event
    #[error("deserialize failed: {0}")]
    Deserialize(#[source] serde_json::Error),

    /// Socket I/O failed
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Errors raised by the transport server and client
#[derive(Debug, Error)]
pub enum TransportError {
    /// A listener could not be bound
    #[error("failed to bind {addr}: {source}")]
    Bind {
        /// Requested address
        addr: String,
        /// Underlying error
        source: io::Error,
    },

    /// A connection could not be established
    #[error("failed to connect to {addr}: {source}")]
    Connect {
        /// Remote address
        addr: String,
        /// Underlying error
        source: io::Error,
    },

    /// The WebSocket handshake failed
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] Box<tungstenite::Error>),

    /// The server refused the supplied token
    #[error("connection refused: unauthorized")]
    Unauthorized,

    /// A frame could not be encoded or decoded
    #[error(transparent)]
    Frame(#[from] FrameError),

    /// Socket I/O failed
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Result type for transport operations
pub type TransportResult<T> = std::result::Result<T, TransportError>;
