//! Length-prefixed event framing
//!
//! Every message on the wire is a fixed-width ASCII decimal length header,
//! right-aligned and padded with spaces, followed by exactly that many
//! bytes of JSON:
//!
//! ```text
//! "        57{"kind":"RUN_END","payload":{"type":"none"},"sender":"..."}"
//!  |--10---||--------------------- 57 bytes ---------------------------|
//! ```
//!
//! [`FrameCodec`] handles byte streams (TCP). [`encode_frame`] and
//! [`decode_frame`] handle self-contained frames (one WebSocket binary
//! message, one UDP datagram).

use bytes::{Buf, BufMut, BytesMut};
use gcodelink_core::Event;
use tokio_util::codec::{Decoder, Encoder};

use crate::error::FrameError;

/// Default width of the length header in bytes
pub const DEFAULT_HEADER_WIDTH: usize = 10;

/// Largest payload accepted (16 MB)
pub const MAX_PAYLOAD_SIZE: usize = 16 * 1024 * 1024;

/// Codec for length-prefixed JSON events
#[derive(Debug, Clone)]
pub struct FrameCodec {
    header_width: usize,
    max_payload_size: usize,
}

impl FrameCodec {
    /// Codec with the given header width
    pub fn new(header_width: usize) -> Self {
        Self {
            header_width,
            max_payload_size: MAX_PAYLOAD_SIZE,
        }
    }

    /// Codec rejecting payloads larger than `max_payload_size`
    pub fn with_max_size(header_width: usize, max_payload_size: usize) -> Self {
        Self {
            header_width,
            max_payload_size,
        }
    }

    /// Width of the length header
    pub fn header_width(&self) -> usize {
        self.header_width
    }

    fn parse_header(&self, header: &[u8]) -> Result<usize, FrameError> {
        let text = std::str::from_utf8(header)
            .map_err(|_| FrameError::InvalidHeader(String::from_utf8_lossy(header).into_owned()))?;
        let size = text
            .trim()
            .parse::<usize>()
            .map_err(|_| FrameError::InvalidHeader(text.to_string()))?;
        if size > self.max_payload_size {
            return Err(FrameError::PayloadTooLarge {
                size,
                max: self.max_payload_size,
            });
        }
        Ok(size)
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(DEFAULT_HEADER_WIDTH)
    }
}

impl Decoder for FrameCodec {
    type Item = Event;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < self.header_width {
            return Ok(None);
        }

        let size = self.parse_header(&src[..self.header_width])?;
        let total = self.header_width + size;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        let event = serde_json::from_slice(&src[self.header_width..total])
            .map_err(FrameError::Deserialize)?;
        src.advance(total);
        Ok(Some(event))
    }
}

impl Encoder<Event> for FrameCodec {
    type Error = FrameError;

    fn encode(&mut self, item: Event, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let json = serde_json::to_vec(&item).map_err(FrameError::Serialize)?;
        let header = format!("{:>width$}", json.len(), width = self.header_width);
        if header.len() > self.header_width || json.len() > self.max_payload_size {
            return Err(FrameError::PayloadTooLarge {
                size: json.len(),
                max: self.max_payload_size,
            });
        }

        dst.reserve(header.len() + json.len());
        dst.put_slice(header.as_bytes());
        dst.put_slice(&json);
        Ok(())
    }
}

/// Encode one event as a standalone frame
pub fn encode_frame(event: &Event, header_width: usize) -> Result<Vec<u8>, FrameError> {
    let mut buf = BytesMut::new();
    FrameCodec::new(header_width).encode(event.clone(), &mut buf)?;
    Ok(buf.to_vec())
}

/// Decode a standalone frame holding exactly one event
pub fn decode_frame(frame: &[u8], header_width: usize) -> Result<Event, FrameError> {
    let mut codec = FrameCodec::new(header_width);
    let mut buf = BytesMut::from(frame);
    match codec.decode(&mut buf)? {
        Some(event) if buf.is_empty() => Ok(event),
        Some(_) => Err(FrameError::TrailingData(buf.len())),
        None => {
            let expected = if frame.len() < header_width {
                header_width
            } else {
                header_width + codec.parse_header(&frame[..header_width])?
            };
            Err(FrameError::Truncated {
                expected,
                actual: frame.len(),
            })
        }
    }
}
