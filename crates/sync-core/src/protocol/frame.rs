//! Length-prefix framing.
//!
//! Frame = `[u32 big-endian payload length][payload]`.
//!
//! [`FrameDecoder`] is fed whatever the socket hands back and yields complete
//! payloads in arrival order, however the bytes were split across reads.

use super::{ProtocolError, Result, SyncEvent};

/// Size of the big-endian length prefix.
pub const FRAME_HEADER_LEN: usize = 4;

/// Maximum payload size (50MB) to prevent memory exhaustion from a bad peer.
pub const MAX_FRAME_SIZE: usize = 50 * 1024 * 1024;

/// Prefix a payload with its length.
///
/// The result is one contiguous buffer so it can be written to the socket
/// in a single call.
pub fn encode_frame(payload: &[u8]) -> Result<Vec<u8>> {
    if payload.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge {
            len: payload.len(),
            max: MAX_FRAME_SIZE,
        });
    }

    let mut frame = Vec::with_capacity(FRAME_HEADER_LEN + payload.len());
    frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    frame.extend_from_slice(payload);
    Ok(frame)
}

/// Serialize an event and frame it.
pub fn encode_event_frame(event: &SyncEvent) -> Result<Vec<u8>> {
    encode_frame(&event.to_json()?)
}

/// Incremental frame decoder.
#[derive(Debug)]
pub struct FrameDecoder {
    buf: Vec<u8>,
    /// Payload bytes of an oversized frame still to be thrown away
    skip: usize,
    max_frame_size: usize,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::with_max_frame_size(MAX_FRAME_SIZE)
    }

    pub fn with_max_frame_size(max_frame_size: usize) -> Self {
        Self {
            buf: Vec::new(),
            skip: 0,
            max_frame_size,
        }
    }

    /// Append bytes received from the socket.
    pub fn extend(&mut self, data: &[u8]) {
        if self.skip > 0 {
            let dropped = self.skip.min(data.len());
            self.skip -= dropped;
            self.buf.extend_from_slice(&data[dropped..]);
        } else {
            self.buf.extend_from_slice(data);
        }
    }

    /// Take the next complete payload, if one is buffered.
    ///
    /// An oversized length prefix yields a single `FrameTooLarge` error; the
    /// decoder then discards that frame's payload and carries on with the
    /// frame after it.
    pub fn next_frame(&mut self) -> Option<Result<Vec<u8>>> {
        if self.skip > 0 {
            let dropped = self.skip.min(self.buf.len());
            self.buf.drain(..dropped);
            self.skip -= dropped;
            if self.skip > 0 {
                return None;
            }
        }

        let header: [u8; FRAME_HEADER_LEN] = self.buf.get(..FRAME_HEADER_LEN)?.try_into().ok()?;
        let len = u32::from_be_bytes(header) as usize;

        if len > self.max_frame_size {
            self.buf.drain(..FRAME_HEADER_LEN);
            self.skip = len;
            let dropped = self.skip.min(self.buf.len());
            self.buf.drain(..dropped);
            self.skip -= dropped;
            return Some(Err(ProtocolError::FrameTooLarge {
                len,
                max: self.max_frame_size,
            }));
        }

        if self.buf.len() < FRAME_HEADER_LEN + len {
            return None;
        }

        let payload = self.buf[FRAME_HEADER_LEN..FRAME_HEADER_LEN + len].to_vec();
        self.buf.drain(..FRAME_HEADER_LEN + len);
        Some(Ok(payload))
    }

    /// Bytes buffered but not yet returned as a frame.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Whether the decoder is in the middle of discarding an oversized frame.
    pub fn is_skipping(&self) -> bool {
        self.skip > 0
    }
}
