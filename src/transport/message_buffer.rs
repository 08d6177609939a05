//! Message reassembly for streams without length prefixes.
//!
//! Bytes are accumulated until the buffered prefix decodes as one whole
//! message (envelope plus body struct), which is then split off. A decode
//! that runs out of input means the message has not fully arrived yet; any
//! other decode failure is reported at once.
//!
//! Each attempt re-decodes the buffered bytes from the start, so the cost
//! grows with message size divided by read size.

use bytes::{Bytes, BytesMut};

use crate::error::{Result, WirecallError};
use crate::protocol::{message_len, ProtocolKind};

/// Accumulates incoming bytes and yields complete messages.
#[derive(Debug)]
pub struct MessageBuffer {
    pending: BytesMut,
    protocol: ProtocolKind,
    max_message_size: usize,
}

impl MessageBuffer {
    pub fn new(protocol: ProtocolKind, max_message_size: usize) -> Self {
        Self {
            pending: BytesMut::with_capacity(8 * 1024),
            protocol,
            max_message_size,
        }
    }

    /// Append `data` and return every message completed by it, in order.
    ///
    /// A message larger than the limit is a decode error, even before it
    /// is complete.
    pub fn push(&mut self, data: &[u8]) -> Result<Vec<Bytes>> {
        self.pending.extend_from_slice(data);

        let mut complete = Vec::new();
        while !self.pending.is_empty() {
            match message_len(self.protocol, &self.pending)? {
                Some(len) if len <= self.max_message_size => {
                    complete.push(self.pending.split_to(len).freeze());
                }
                Some(len) => return Err(self.oversized(len)),
                None if self.pending.len() > self.max_message_size => {
                    return Err(self.oversized(self.pending.len()));
                }
                None => break,
            }
        }
        Ok(complete)
    }

    fn oversized(&self, size: usize) -> WirecallError {
        WirecallError::decode(format!(
            "message size {} exceeds maximum {}",
            size, self.max_message_size
        ))
    }

    /// Bytes held that do not form a complete message yet.
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn clear(&mut self) {
        self.pending.clear();
    }
}
