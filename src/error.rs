//! Error types for wirecall.
//!
//! Two layers:
//!
//! - [`WirecallError`] covers everything the calling convention itself can
//!   fail with: transport faults, undecodable bytes, envelope violations and
//!   remote protocol exceptions.
//! - [`CallError`] is what a typed operation returns. It adds the operation's
//!   declared exceptions on top, so callers match on
//!   `Declared(..)` vs `Rpc(..)` exhaustively.

use std::time::Duration;

use thiserror::Error;

use crate::envelope::ApplicationException;

/// Main error type for all wirecall operations.
#[derive(Debug, Error)]
pub enum WirecallError {
    /// I/O error on the underlying stream.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON encoding error (json protocol only).
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Could not open the channel.
    #[error("Connect error: {0}")]
    Connect(String),

    /// No complete reply within the read timeout.
    #[error("Read timed out after {0:?}")]
    Timeout(Duration),

    /// Peer closed the stream while a reply was expected.
    #[error("Connection closed")]
    ConnectionClosed,

    /// The channel was closed locally (explicitly or after a fatal error).
    #[error("Channel is closed")]
    ChannelClosed,

    /// Bytes do not form a valid encoding of the expected value.
    #[error("Decode error: {0}")]
    Decode(String),

    /// Input ended before the value was complete.
    ///
    /// On an unframed stream this means more bytes are needed.
    #[error("Decode error: {0}")]
    Truncated(String),

    /// Envelope or result shape does not match the calling convention.
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    /// The remote side rejected the request at the framework level.
    #[error("Application exception: {0}")]
    Application(ApplicationException),
}

impl WirecallError {
    /// Whether this error leaves the channel unusable.
    ///
    /// Only remote protocol exceptions keep the stream aligned.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, WirecallError::Application(_))
    }

    pub(crate) fn decode(msg: impl Into<String>) -> Self {
        WirecallError::Decode(msg.into())
    }

    pub(crate) fn truncated(msg: impl Into<String>) -> Self {
        WirecallError::Truncated(msg.into())
    }

    pub(crate) fn violation(msg: impl Into<String>) -> Self {
        WirecallError::ProtocolViolation(msg.into())
    }
}

/// Result type alias using WirecallError.
pub type Result<T> = std::result::Result<T, WirecallError>;

/// Outcome of a typed remote operation that did not succeed.
///
/// `E` is the operation's declared exception type; operations without
/// declared exceptions use [`std::convert::Infallible`].
#[derive(Debug, Error)]
pub enum CallError<E> {
    /// An exception listed in the operation's contract.
    #[error("{0}")]
    Declared(E),

    /// Protocol exception, decode/protocol violation or transport failure.
    #[error(transparent)]
    Rpc(#[from] WirecallError),
}

impl<E> CallError<E> {
    /// The declared exception, if that is what this is.
    pub fn declared(&self) -> Option<&E> {
        match self {
            CallError::Declared(e) => Some(e),
            CallError::Rpc(_) => None,
        }
    }

    /// The remote protocol exception, if that is what this is.
    pub fn application(&self) -> Option<&ApplicationException> {
        match self {
            CallError::Rpc(WirecallError::Application(e)) => Some(e),
            _ => None,
        }
    }
}
