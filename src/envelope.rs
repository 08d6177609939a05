//! Message envelope protocol.
//!
//! Every message on a channel starts with an [`Envelope`]:
//!
//! ```text
//! ┌────────────────┬─────────────┬─────────────┐
//! │ operation name │ MessageKind │ sequence id │
//! └────────────────┴─────────────┴─────────────┘
//! ```
//!
//! followed by one encoded struct: the call arguments for CALL and
//! ONEWAY, the result struct for REPLY, or an [`ApplicationException`]
//! for EXCEPTION. The byte layout of the envelope belongs to the chosen
//! [`protocol`](crate::protocol); this module owns the rules.
//!
//! Rules:
//! - the caller picks the sequence id for CALL/ONEWAY and the responder
//!   echoes it in the matching REPLY/EXCEPTION
//! - ONEWAY never gets a reply
//! - a REPLY result struct has exactly one populated field

use std::fmt;

use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::{Result, WirecallError};
use crate::protocol::{
    read_field, skip, write_field, InputProtocol, OutputProtocol, TType, WireValue,
};
use crate::transport::Channel;

/// The four message kinds. Discriminants are the wire codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageKind {
    /// Request expecting exactly one reply.
    Call = 1,
    /// Successful dispatch; payload is the result struct.
    Reply = 2,
    /// Framework-level rejection; payload is an [`ApplicationException`].
    Exception = 3,
    /// Request that never gets a reply.
    Oneway = 4,
}

impl MessageKind {
    /// Wire code of this kind.
    #[inline]
    pub fn code(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for MessageKind {
    type Error = WirecallError;

    fn try_from(code: u8) -> Result<Self> {
        match code {
            1 => Ok(MessageKind::Call),
            2 => Ok(MessageKind::Reply),
            3 => Ok(MessageKind::Exception),
            4 => Ok(MessageKind::Oneway),
            other => Err(WirecallError::violation(format!(
                "unrecognised message kind {}",
                other
            ))),
        }
    }
}

/// Message header: operation name, kind and sequence id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub name: String,
    pub kind: MessageKind,
    pub sequence_id: i32,
}

impl Envelope {
    /// Create a new envelope.
    pub fn new(name: impl Into<String>, kind: MessageKind, sequence_id: i32) -> Self {
        Self {
            name: name.into(),
            kind,
            sequence_id,
        }
    }
}

/// Write the header of a CALL (or ONEWAY) message.
pub fn begin_call(
    out: &mut dyn OutputProtocol,
    name: &str,
    sequence_id: i32,
    oneway: bool,
) -> Result<()> {
    let kind = if oneway {
        MessageKind::Oneway
    } else {
        MessageKind::Call
    };
    out.write_message_begin(&Envelope::new(name, kind, sequence_id))
}

/// Close the message being written, then queue and flush it.
pub async fn end_call<S>(out: &mut dyn OutputProtocol, channel: &mut Channel<S>) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    out.write_message_end()?;
    let bytes = out.finish()?;
    channel.write(bytes)?;
    channel.flush().await
}

/// Read the header of a received message.
///
/// Fails with a protocol violation if the kind is not one of the four
/// known kinds.
pub fn read_reply_header(input: &mut dyn InputProtocol) -> Result<Envelope> {
    input.read_message_begin()
}

/// Pick the single populated field of a REPLY result struct.
///
/// `void_ok` is returned when nothing is populated and the operation
/// returns nothing; otherwise an empty result is a violation.
pub fn single_result<T>(
    name: &str,
    populated: impl IntoIterator<Item = Option<T>>,
    void_ok: Option<T>,
) -> Result<T> {
    let mut found = populated.into_iter().flatten();
    match (found.next(), found.next()) {
        (Some(only), None) => Ok(only),
        (None, _) => void_ok.ok_or_else(|| {
            WirecallError::violation(format!("{} reply has no populated result field", name))
        }),
        (Some(_), Some(_)) => Err(WirecallError::violation(format!(
            "{} reply has more than one populated result field",
            name
        ))),
    }
}

/// Fault category of an [`ApplicationException`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ApplicationErrorKind {
    Unknown,
    UnknownMethod,
    InvalidMessageType,
    WrongMethodName,
    BadSequenceId,
    MissingResult,
    InternalError,
    ProtocolError,
    InvalidTransform,
    InvalidProtocol,
    UnsupportedClientType,
}

impl ApplicationErrorKind {
    /// Wire code of this category.
    pub fn code(self) -> i32 {
        match self {
            ApplicationErrorKind::Unknown => 0,
            ApplicationErrorKind::UnknownMethod => 1,
            ApplicationErrorKind::InvalidMessageType => 2,
            ApplicationErrorKind::WrongMethodName => 3,
            ApplicationErrorKind::BadSequenceId => 4,
            ApplicationErrorKind::MissingResult => 5,
            ApplicationErrorKind::InternalError => 6,
            ApplicationErrorKind::ProtocolError => 7,
            ApplicationErrorKind::InvalidTransform => 8,
            ApplicationErrorKind::InvalidProtocol => 9,
            ApplicationErrorKind::UnsupportedClientType => 10,
        }
    }

    /// Category for a wire code; unknown codes map to `Unknown`.
    pub fn from_code(code: i32) -> Self {
        match code {
            1 => ApplicationErrorKind::UnknownMethod,
            2 => ApplicationErrorKind::InvalidMessageType,
            3 => ApplicationErrorKind::WrongMethodName,
            4 => ApplicationErrorKind::BadSequenceId,
            5 => ApplicationErrorKind::MissingResult,
            6 => ApplicationErrorKind::InternalError,
            7 => ApplicationErrorKind::ProtocolError,
            8 => ApplicationErrorKind::InvalidTransform,
            9 => ApplicationErrorKind::InvalidProtocol,
            10 => ApplicationErrorKind::UnsupportedClientType,
            _ => ApplicationErrorKind::Unknown,
        }
    }
}

/// Protocol exception carried by an EXCEPTION message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplicationException {
    pub kind: ApplicationErrorKind,
    pub message: String,
}

impl ApplicationException {
    pub fn new(kind: ApplicationErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl fmt::Display for ApplicationException {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

impl std::error::Error for ApplicationException {}

impl WireValue for ApplicationException {
    const TTYPE: TType = TType::Struct;

    fn write_value(&self, out: &mut dyn OutputProtocol) -> Result<()> {
        out.write_struct_begin("ApplicationException")?;
        if !self.message.is_empty() {
            write_field(out, 1, &self.message)?;
        }
        write_field(out, 2, &self.kind.code())?;
        out.write_field_stop()?;
        out.write_struct_end()
    }

    fn read_value(input: &mut dyn InputProtocol) -> Result<Self> {
        input.read_struct_begin()?;
        let mut message = None;
        let mut code = None;
        loop {
            let field = input.read_field_begin()?;
            if field.is_stop() {
                break;
            }
            match field.id {
                1 => message = read_field(input, field)?.or(message),
                2 => code = read_field(input, field)?.or(code),
                _ => skip(input, field.ttype)?,
            }
            input.read_field_end()?;
        }
        input.read_struct_end()?;

        Ok(ApplicationException {
            kind: ApplicationErrorKind::from_code(code.unwrap_or(0)),
            message: message.unwrap_or_default(),
        })
    }
}

/// Write a complete EXCEPTION message (header + exception + end).
pub fn write_exception_message(
    out: &mut dyn OutputProtocol,
    name: &str,
    sequence_id: i32,
    exception: &ApplicationException,
) -> Result<()> {
    out.write_message_begin(&Envelope::new(name, MessageKind::Exception, sequence_id))?;
    exception.write_value(out)?;
    out.write_message_end()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ProtocolKind;

    const ALL: [ProtocolKind; 3] = [
        ProtocolKind::Binary,
        ProtocolKind::Compact,
        ProtocolKind::Json,
    ];

    #[test]
    fn test_message_kind_codes() {
        assert_eq!(MessageKind::Call.code(), 1);
        assert_eq!(MessageKind::Reply.code(), 2);
        assert_eq!(MessageKind::Exception.code(), 3);
        assert_eq!(MessageKind::Oneway.code(), 4);

        for code in 1u8..=4 {
            assert_eq!(MessageKind::try_from(code).unwrap().code(), code);
        }
    }

    #[test]
    fn test_unknown_message_kind_is_violation() {
        for code in [0u8, 5, 7, 0xFF] {
            let err = MessageKind::try_from(code).unwrap_err();
            assert!(matches!(err, WirecallError::ProtocolViolation(_)));
        }
    }

    #[test]
    fn test_begin_call_and_read_header() {
        for kind in ALL {
            for oneway in [false, true] {
                let mut out = kind.output();
                begin_call(out.as_mut(), "getUser", 17, oneway).unwrap();
                out.write_struct_begin("args").unwrap();
                out.write_field_stop().unwrap();
                out.write_struct_end().unwrap();
                out.write_message_end().unwrap();
                let bytes = out.finish().unwrap();

                let mut input = kind.input(bytes).unwrap();
                let envelope = read_reply_header(input.as_mut()).unwrap();
                assert_eq!(envelope.name, "getUser");
                assert_eq!(envelope.sequence_id, 17);
                let expected = if oneway {
                    MessageKind::Oneway
                } else {
                    MessageKind::Call
                };
                assert_eq!(envelope.kind, expected, "protocol {}", kind);
            }
        }
    }

    #[test]
    fn test_exception_message_roundtrip() {
        let exception = ApplicationException::new(
            ApplicationErrorKind::WrongMethodName,
            "Age must be between 0 and 150",
        );
        for kind in ALL {
            let mut out = kind.output();
            write_exception_message(out.as_mut(), "validateUserData", 9, &exception).unwrap();
            let bytes = out.finish().unwrap();

            let mut input = kind.input(bytes).unwrap();
            let envelope = read_reply_header(input.as_mut()).unwrap();
            assert_eq!(envelope.kind, MessageKind::Exception);
            assert_eq!(envelope.sequence_id, 9);
            let decoded = ApplicationException::read_value(input.as_mut()).unwrap();
            input.read_message_end().unwrap();
            assert_eq!(decoded, exception, "protocol {}", kind);
        }
    }

    #[test]
    fn test_application_error_kind_codes() {
        for code in 0..=10 {
            assert_eq!(ApplicationErrorKind::from_code(code).code(), code);
        }
        assert_eq!(ApplicationErrorKind::from_code(42), ApplicationErrorKind::Unknown);
        assert_eq!(ApplicationErrorKind::from_code(-1), ApplicationErrorKind::Unknown);
    }

    #[test]
    fn test_single_result() {
        assert_eq!(single_result("op", [Some(1), None], None).unwrap(), 1);
        assert_eq!(single_result("op", [None, Some(2)], None).unwrap(), 2);
        assert_eq!(single_result("op", [None::<i32>, None], Some(0)).unwrap(), 0);

        let none = single_result("op", [None::<i32>, None], None).unwrap_err();
        assert!(matches!(none, WirecallError::ProtocolViolation(_)));
        assert!(none.to_string().contains("no populated"));

        let both = single_result("op", [Some(1), Some(2)], None).unwrap_err();
        assert!(both.to_string().contains("more than one"));

        // A void operation that also sets an exception field is still ambiguous.
        let void_both = single_result("op", [Some(1), Some(2)], Some(0)).unwrap_err();
        assert!(matches!(void_both, WirecallError::ProtocolViolation(_)));
    }

    #[test]
    fn test_display() {
        let exception = ApplicationException::new(ApplicationErrorKind::UnknownMethod, "nope");
        assert_eq!(exception.to_string(), "UnknownMethod: nope");
    }
}
