//! Typed call dispatcher.
//!
//! [`RpcClient`] owns one [`Channel`] and one encoder and turns a typed
//! call into exactly one round trip:
//!
//! 1. allocate the next sequence id
//! 2. write the CALL envelope and argument struct, flush
//! 3. wait for one message (bounded by the read timeout)
//! 4. check the reply's sequence id, name and kind
//! 5. decode the result struct, or the protocol exception
//!
//! ONEWAY calls stop after step 2.
//!
//! Any error other than a protocol exception leaves the stream in an
//! unknown state, so the client closes the channel and every later call
//! fails with [`WirecallError::ChannelClosed`]. There is no reconnect;
//! build a new client.
//!
//! # Example
//!
//! ```no_run
//! use wirecall::{ClientConfig, RpcClient};
//! use wirecall::client::Reply;
//! use wirecall::service::{GetUserArgs, User, UserNotFound};
//!
//! # async fn run() -> wirecall::Result<()> {
//! let mut client = RpcClient::connect(&ClientConfig::new()).await?;
//! let args = GetUserArgs { user_id: 1 };
//! let reply: Reply<User, UserNotFound> = client.call("getUser", &args).await?;
//! match reply.into_result() {
//!     Ok(user) => println!("{}", user.name),
//!     Err(e) => println!("{}", e),
//! }
//! client.close().await;
//! # Ok(())
//! # }
//! ```

use std::convert::Infallible;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

use crate::config::ClientConfig;
use crate::envelope::{
    begin_call, end_call, read_reply_header, single_result, ApplicationException, MessageKind,
};
use crate::error::{CallError, Result, WirecallError};
use crate::protocol::{
    read_field, read_struct, skip, write_field, InputProtocol, OutputProtocol, ProtocolKind, TType,
    WireValue,
};
use crate::transport::Channel;

/// Caller side of one channel.
pub struct RpcClient<S> {
    channel: Channel<S>,
    protocol: ProtocolKind,
    output: Box<dyn OutputProtocol>,
    read_timeout: Option<Duration>,
    next_sequence_id: i32,
}

impl RpcClient<TcpStream> {
    /// Open a TCP channel as configured.
    pub async fn connect(config: &ClientConfig) -> Result<Self> {
        let channel = Channel::connect(
            &config.addr,
            config.connect_timeout,
            config.framing,
            config.protocol,
            config.max_frame_size,
        )
        .await?;
        tracing::debug!(
            "Client connected to {} using {} ({})",
            config.addr,
            config.protocol,
            config.framing
        );
        Ok(Self::new(channel, config.protocol, config.read_timeout))
    }
}

impl<S> RpcClient<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Drive an already-open channel.
    pub fn new(
        channel: Channel<S>,
        protocol: ProtocolKind,
        read_timeout: Option<Duration>,
    ) -> Self {
        Self {
            channel,
            protocol,
            output: protocol.output(),
            read_timeout,
            next_sequence_id: 1,
        }
    }

    /// Wrap a connected stream using the settings from `config`.
    pub fn from_stream(stream: S, config: &ClientConfig) -> Self {
        Self::new(
            Channel::new(stream, config.framing, config.protocol, config.max_frame_size),
            config.protocol,
            config.read_timeout,
        )
    }

    /// Encoding used on this channel.
    pub fn protocol(&self) -> ProtocolKind {
        self.protocol
    }

    pub fn is_open(&self) -> bool {
        self.channel.is_open()
    }

    /// Close the channel. Calling it again does nothing.
    pub async fn close(&mut self) {
        self.channel.close().await;
    }

    /// Send a CALL and wait for its reply.
    ///
    /// `R` is the operation's result struct. A protocol exception comes
    /// back as [`WirecallError::Application`] and keeps the channel open.
    pub async fn call<A, R>(&mut self, name: &str, args: &A) -> Result<R>
    where
        A: WireValue,
        R: WireValue,
    {
        let result = self.round_trip(name, args).await;
        self.close_on_fatal(name, result).await
    }

    /// Send a ONEWAY message. Completes once the message is flushed.
    pub async fn oneway<A: WireValue>(&mut self, name: &str, args: &A) -> Result<()> {
        if !self.channel.is_open() {
            return Err(WirecallError::ChannelClosed);
        }
        let sequence_id = self.allocate_sequence_id();
        let result = self.send(name, sequence_id, args, true).await;
        self.close_on_fatal(name, result).await
    }

    fn allocate_sequence_id(&mut self) -> i32 {
        let id = self.next_sequence_id;
        self.next_sequence_id = self.next_sequence_id.wrapping_add(1);
        id
    }

    async fn send<A: WireValue>(
        &mut self,
        name: &str,
        sequence_id: i32,
        args: &A,
        oneway: bool,
    ) -> Result<()> {
        let encoded = begin_call(self.output.as_mut(), name, sequence_id, oneway)
            .and_then(|()| args.write_value(self.output.as_mut()));
        if let Err(e) = encoded {
            // Drop the half-written message.
            let _ = self.output.finish();
            return Err(e);
        }
        end_call(self.output.as_mut(), &mut self.channel).await?;
        tracing::debug!("Sent {} seq={} oneway={}", name, sequence_id, oneway);
        Ok(())
    }

    async fn round_trip<A, R>(&mut self, name: &str, args: &A) -> Result<R>
    where
        A: WireValue,
        R: WireValue,
    {
        if !self.channel.is_open() {
            return Err(WirecallError::ChannelClosed);
        }
        let sequence_id = self.allocate_sequence_id();
        self.send(name, sequence_id, args, false).await?;

        let frame = self.channel.read_frame(self.read_timeout).await?;
        let mut input = self.protocol.input(frame)?;
        let envelope = read_reply_header(input.as_mut())?;
        tracing::debug!(
            "Received {:?} for {} seq={}",
            envelope.kind,
            envelope.name,
            envelope.sequence_id
        );

        if envelope.sequence_id != sequence_id {
            return Err(WirecallError::violation(format!(
                "{} reply has sequence id {}, expected {}",
                name, envelope.sequence_id, sequence_id
            )));
        }
        if envelope.name != name {
            return Err(WirecallError::violation(format!(
                "reply names operation '{}', expected '{}'",
                envelope.name, name
            )));
        }

        match envelope.kind {
            MessageKind::Reply => {
                let result = R::read_value(input.as_mut())?;
                input.read_message_end()?;
                Ok(result)
            }
            MessageKind::Exception => {
                let exception = ApplicationException::read_value(input.as_mut())?;
                input.read_message_end()?;
                Err(WirecallError::Application(exception))
            }
            kind @ (MessageKind::Call | MessageKind::Oneway) => Err(WirecallError::violation(
                format!("received {:?} message in reply to {}", kind, name),
            )),
        }
    }

    async fn close_on_fatal<T>(&mut self, name: &str, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            if e.is_fatal() && self.channel.is_open() {
                tracing::warn!("Closing channel after failed {}: {}", name, e);
                self.channel.close().await;
            }
        }
        result
    }
}

/// Result struct of an operation with a return value.
///
/// Field 0 carries the success value, field 1 the declared exception.
/// Exactly one of them must be present.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply<T, E> {
    Success(T),
    Declared(E),
}

impl<T, E> Reply<T, E> {
    /// Convert into the tagged outcome returned by typed service methods.
    pub fn into_result(self) -> std::result::Result<T, CallError<E>> {
        match self {
            Reply::Success(value) => Ok(value),
            Reply::Declared(e) => Err(CallError::Declared(e)),
        }
    }
}

impl<T: WireValue, E: WireValue> WireValue for Reply<T, E> {
    const TTYPE: TType = TType::Struct;

    fn write_value(&self, out: &mut dyn OutputProtocol) -> Result<()> {
        out.write_struct_begin("result")?;
        match self {
            Reply::Success(value) => write_field(out, 0, value)?,
            Reply::Declared(e) => write_field(out, 1, e)?,
        }
        out.write_field_stop()?;
        out.write_struct_end()
    }

    fn read_value(input: &mut dyn InputProtocol) -> Result<Self> {
        let (success, declared) = read_result_fields::<T, E>(input)?;
        single_result(
            "result",
            [success.map(Reply::Success), declared.map(Reply::Declared)],
            None,
        )
    }
}

/// Result struct of an operation that returns nothing.
///
/// An empty struct means success; field 1 carries the declared exception.
#[derive(Debug, Clone, PartialEq)]
pub enum VoidReply<E> {
    Success,
    Declared(E),
}

impl<E> VoidReply<E> {
    pub fn into_result(self) -> std::result::Result<(), CallError<E>> {
        match self {
            VoidReply::Success => Ok(()),
            VoidReply::Declared(e) => Err(CallError::Declared(e)),
        }
    }
}

impl<E: WireValue> WireValue for VoidReply<E> {
    const TTYPE: TType = TType::Struct;

    fn write_value(&self, out: &mut dyn OutputProtocol) -> Result<()> {
        out.write_struct_begin("result")?;
        if let VoidReply::Declared(e) = self {
            write_field(out, 1, e)?;
        }
        out.write_field_stop()?;
        out.write_struct_end()
    }

    fn read_value(input: &mut dyn InputProtocol) -> Result<Self> {
        let mut declared = None;
        read_struct(input, |input, field| {
            match field.id {
                1 => declared = read_field(input, field)?,
                _ => skip(input, field.ttype)?,
            }
            Ok(())
        })?;
        Ok(match declared {
            Some(e) => VoidReply::Declared(e),
            None => VoidReply::Success,
        })
    }
}

fn read_result_fields<T: WireValue, E: WireValue>(
    input: &mut dyn InputProtocol,
) -> Result<(Option<T>, Option<E>)> {
    let mut success = None;
    let mut declared = None;
    read_struct(input, |input, field| {
        match field.id {
            0 => success = read_field(input, field)?,
            1 => declared = read_field(input, field)?,
            _ => skip(input, field.ttype)?,
        }
        Ok(())
    })?;
    Ok((success, declared))
}

/// Declared-exception type of operations that declare none.
///
/// Nothing can be decoded into it: a reply that populates the exception
/// slot of such an operation is a protocol violation.
impl WireValue for Infallible {
    const TTYPE: TType = TType::Struct;

    fn write_value(&self, _out: &mut dyn OutputProtocol) -> Result<()> {
        match *self {}
    }

    fn read_value(_input: &mut dyn InputProtocol) -> Result<Self> {
        Err(WirecallError::violation(
            "reply carries an exception the operation does not declare",
        ))
    }
}
