//! Reassembly of length-prefixed frames from arbitrary read chunks.
//!
//! A frame on the wire is a big-endian `u32` payload length followed by the
//! payload. Reads from the stream may split a frame anywhere, including
//! inside the length prefix, or deliver several frames at once.
//!
//! Payloads are split off the internal `BytesMut`, so no copy is made.
//!
//! # Example
//!
//! ```
//! use wirecall::transport::{encode_frame_header, FrameBuffer};
//!
//! let mut frames = FrameBuffer::new();
//!
//! let mut wire = encode_frame_header(5).to_vec();
//! wire.extend_from_slice(b"hello");
//!
//! assert!(frames.push(&wire[..3]).unwrap().is_empty());
//! let done = frames.push(&wire[3..]).unwrap();
//! assert_eq!(&done[0][..], b"hello");
//! ```

use bytes::{Buf, Bytes, BytesMut};

use super::{DEFAULT_MAX_FRAME_SIZE, FRAME_HEADER_SIZE};
use crate::error::{Result, WirecallError};

/// What the buffer needs next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Need {
    /// The length prefix.
    Length,
    /// This many payload bytes.
    Payload(usize),
}

/// Accumulates incoming bytes and yields complete frame payloads.
#[derive(Debug)]
pub struct FrameBuffer {
    pending: BytesMut,
    need: Need,
    max_frame_size: usize,
}

impl FrameBuffer {
    pub fn new() -> Self {
        Self::with_max_frame_size(DEFAULT_MAX_FRAME_SIZE)
    }

    /// Reject frames whose announced payload is larger than `max_frame_size`.
    pub fn with_max_frame_size(max_frame_size: usize) -> Self {
        Self {
            pending: BytesMut::with_capacity(8 * 1024),
            need: Need::Length,
            max_frame_size,
        }
    }

    /// Append `data` and return every payload completed by it, in order.
    ///
    /// An oversized length prefix is a decode error; the buffer should be
    /// discarded afterwards.
    pub fn push(&mut self, data: &[u8]) -> Result<Vec<Bytes>> {
        self.pending.extend_from_slice(data);

        let mut complete = Vec::new();
        loop {
            match self.need {
                Need::Length if self.pending.len() >= FRAME_HEADER_SIZE => {
                    let announced = self.pending.get_u32() as usize;
                    if announced > self.max_frame_size {
                        return Err(WirecallError::decode(format!(
                            "frame size {} exceeds maximum {}",
                            announced, self.max_frame_size
                        )));
                    }
                    self.need = Need::Payload(announced);
                }
                Need::Payload(size) if self.pending.len() >= size => {
                    complete.push(self.pending.split_to(size).freeze());
                    self.need = Need::Length;
                }
                _ => return Ok(complete),
            }
        }
    }

    /// Bytes held that do not form a complete frame yet.
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Drop buffered bytes and wait for a new length prefix.
    pub fn clear(&mut self) {
        self.pending.clear();
        self.need = Need::Length;
    }
}

impl Default for FrameBuffer {
    fn default() -> Self {
        Self::new()
    }
}
