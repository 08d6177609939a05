//! Transport module - byte channels carrying whole messages.
//!
//! Two ways of delimiting messages on the stream:
//!
//! ```text
//! Buffered (default):  │ message │ message │ ...
//! Framed:              │ length (u32, BE) │ message │ length │ message │ ...
//! ```
//!
//! Buffered streams carry messages back to back, as the plain buffered
//! transports of other Thrift peers do; message boundaries are found by
//! decoding. Framed streams prefix every message with its length.
//!
//! [`Channel`] works over any `AsyncRead + AsyncWrite` stream. TCP is the
//! production transport (see [`Channel::connect`]); tests use
//! `tokio::io::duplex`.

mod channel;
mod frame_buffer;
mod message_buffer;

use std::fmt;

use serde::{Deserialize, Serialize};

pub use channel::{Channel, OutboundFrame};
pub use frame_buffer::FrameBuffer;
pub use message_buffer::MessageBuffer;

/// Size of the frame length prefix.
pub const FRAME_HEADER_SIZE: usize = 4;

/// Default largest accepted message (16 MiB).
pub const DEFAULT_MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Encode a frame length prefix.
#[inline]
pub fn encode_frame_header(length: u32) -> [u8; FRAME_HEADER_SIZE] {
    length.to_be_bytes()
}

/// How messages are delimited on the stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Framing {
    /// Messages back to back with no prefix.
    #[default]
    Buffered,
    /// Every message preceded by its u32 big-endian length.
    Framed,
}

impl fmt::Display for Framing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Framing::Buffered => f.write_str("buffered"),
            Framing::Framed => f.write_str("framed"),
        }
    }
}
