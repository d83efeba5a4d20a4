//! # GCodeLink Remote
//!
//! Network transport for the executor. A [`TransportServer`] owns one
//! shared executor and relays events between it and any number of
//! clients over raw TCP and, optionally, WebSocket. Every message is a
//! length-prefixed JSON event (see [`framing`]). [`RemoteClient`] is the
//! connecting side and implements the same
//! [`CommandSurface`](gcodelink_core::CommandSurface) as a local executor.

pub mod client;
pub mod error;
pub mod framing;
pub mod server;

pub use client::RemoteClient;
pub use error::{FrameError, TransportError, TransportResult};
pub use framing::{decode_frame, encode_frame, FrameCodec, DEFAULT_HEADER_WIDTH, MAX_PAYLOAD_SIZE};
pub use server::{RunningServer, TransportServer, TOKEN_HEADER};
