//! Length-delimited framing.
//!
//! Wire layout:
//! ```text
//! +----------------------+---------------------------+
//! | length (2B, big-end) | payload (length bytes)    |
//! +----------------------+---------------------------+
//! ```
//!
//! [`FrameCodec::receive`] is restartable across arbitrarily small reads
//! (a header split over two reads is fine) and emits every complete frame
//! found in one call. It knows nothing about the payload format.

use bytes::{Buf, Bytes, BytesMut};

use crate::error::{Result, RpcError};

/// Width of the length header in bytes.
pub const HEADER_LEN: usize = 2;

/// Largest payload the header can announce.
pub const MAX_PAYLOAD: usize = (1 << (8 * HEADER_LEN)) - 1;

enum State {
    AwaitingHeader,
    /// Header consumed; the announced payload length.
    AwaitingPayload(usize),
}

/// Incremental splitter of a raw byte stream into frames.
pub struct FrameCodec {
    buffer: BytesMut,
    state: State,
}

impl FrameCodec {
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(4 * 1024),
            state: State::AwaitingHeader,
        }
    }

    /// Feed bytes off the wire, returning every frame completed by them.
    ///
    /// Partial data is retained for the next call. With a two-byte header
    /// any announced length is representable, so extraction cannot fail.
    pub fn receive(&mut self, data: &[u8]) -> Vec<Bytes> {
        self.buffer.extend_from_slice(data);

        let mut frames = Vec::new();
        loop {
            match self.state {
                State::AwaitingHeader => {
                    if self.buffer.len() < HEADER_LEN {
                        break;
                    }
                    let len = self.buffer.get_u16() as usize;
                    self.state = State::AwaitingPayload(len);
                }
                State::AwaitingPayload(len) => {
                    if self.buffer.len() < len {
                        break;
                    }
                    frames.push(self.buffer.split_to(len).freeze());
                    self.state = State::AwaitingHeader;
                }
            }
        }
        frames
    }

    /// Bytes buffered but not yet forming a complete frame.
    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

/// Prefix a payload with its length header for sending.
///
/// Fails with [`RpcError::FrameTooLarge`] instead of truncating when the
/// payload exceeds what the header can announce.
pub fn pack(payload: &[u8]) -> Result<Vec<u8>> {
    if payload.len() > MAX_PAYLOAD {
        return Err(RpcError::FrameTooLarge(payload.len()));
    }
    let mut out = Vec::with_capacity(HEADER_LEN + payload.len());
    out.extend_from_slice(&(payload.len() as u16).to_be_bytes());
    out.extend_from_slice(payload);
    Ok(out)
}
