//! Wire protocol codec for the internal (supervisor-facing) socket.
//!
//! Length-prefixed frames with a type byte, the same shape the document
//! protocol itself uses on the wire:
//!
//! ```text
//! [u32 LE length] [u8 type] [payload: length-1 bytes]
//! ```
//!
//! Frame types:
//! - `0x01`: text command (UTF-8), e.g. `tile 0 0`, `load url=...`, `canceltiles`
//! - `0x02`: binary payload (tile image bytes, file bytes)

use anyhow::{anyhow, bail, Result};

/// Maximum frame payload size (16 MB, generous for a tile bitmap).
const MAX_FRAME_SIZE: u32 = 16 * 1024 * 1024;

/// Frame type constants.
pub mod frame_type {
    /// UTF-8 text command.
    pub const TEXT: u8 = 0x01;
    /// Raw binary payload.
    pub const BINARY: u8 = 0x02;
}

/// A decoded frame from the internal wire protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// A text command line, e.g. `"tile 0 0"`, `"canceltiles"`, `"eof"`.
    Text(String),
    /// A raw binary payload following a command that announced its length.
    Binary(Vec<u8>),
}

impl Frame {
    /// Encode this frame into a wire-format byte vector.
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Frame::Text(s) => encode_raw(frame_type::TEXT, s.as_bytes()),
            Frame::Binary(data) => encode_raw(frame_type::BINARY, data),
        }
    }

    /// Borrow the text payload, if this is a [`Frame::Text`].
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Frame::Text(s) => Some(s.as_str()),
            Frame::Binary(_) => None,
        }
    }
}

fn encode_raw(frame_type: u8, payload: &[u8]) -> Vec<u8> {
    let length = (payload.len() + 1) as u32;
    let mut buf = Vec::with_capacity(4 + 1 + payload.len());
    buf.extend_from_slice(&length.to_le_bytes());
    buf.push(frame_type);
    buf.extend_from_slice(payload);
    buf
}

fn decode_frame(frame_type: u8, payload: &[u8]) -> Result<Frame> {
    match frame_type {
        frame_type::TEXT => {
            let text = std::str::from_utf8(payload)
                .map_err(|e| anyhow!("invalid UTF-8 text frame: {e}"))?;
            Ok(Frame::Text(text.to_string()))
        }
        frame_type::BINARY => Ok(Frame::Binary(payload.to_vec())),
        other => bail!("unknown frame type: 0x{other:02x}"),
    }
}

/// Incremental frame decoder that handles partial reads.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: Vec<u8>,
}

impl FrameDecoder {
    /// Create a new decoder with an empty buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed bytes into the decoder, returning every complete frame extracted.
    ///
    /// # Errors
    /// Returns an error if a frame is malformed or exceeds the size limit.
    pub fn feed(&mut self, bytes: &[u8]) -> Result<Vec<Frame>> {
        self.buf.extend_from_slice(bytes);
        let mut frames = Vec::new();

        loop {
            if self.buf.len() < 4 {
                break;
            }
            let length = u32::from_le_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]]);
            if length == 0 {
                bail!("invalid frame: zero length");
            }
            if length > MAX_FRAME_SIZE {
                bail!("frame too large: {length} bytes (max {MAX_FRAME_SIZE})");
            }
            let total = 4 + length as usize;
            if self.buf.len() < total {
                break;
            }
            let frame_type = self.buf[4];
            let payload = &self.buf[5..total];
            frames.push(decode_frame(frame_type, payload)?);
            self.buf.drain(..total);
        }

        Ok(frames)
    }

    /// True if the decoder has buffered partial data awaiting completion.
    pub fn has_partial(&self) -> bool {
        !self.buf.is_empty()
    }
}
