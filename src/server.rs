//! Responder side: decode requests, dispatch to a [`UserService`], encode replies.
//!
//! ```text
//! TcpListener ─accept─► task per connection ─► serve_connection
//!                                                 │ read message
//!                                                 ▼
//!                                           Processor::process ─► UserService
//!                                                 │ REPLY / EXCEPTION / nothing (oneway)
//!                                                 ▼
//!                                            write message
//! ```
//!
//! A request that cannot be understood at the envelope level ends the
//! connection. Problems with the arguments or the operation name are
//! answered with a protocol exception and the connection stays up.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;

use crate::client::{Reply, VoidReply};
use crate::envelope::{
    write_exception_message, ApplicationErrorKind, ApplicationException, Envelope, MessageKind,
};
use crate::error::{CallError, Result, WirecallError};
use crate::protocol::{skip, InputProtocol, OutputProtocol, ProtocolKind, TType, WireValue};
use crate::service::{
    method, CreateUserArgs, DeleteUserArgs, GetAllUsersArgs, GetUserArgs, LogUserActivityArgs,
    UpdateUserArgs, UserService, ValidateUserDataArgs,
};
use crate::transport::{Channel, Framing, DEFAULT_MAX_FRAME_SIZE};

/// Dispatches decoded requests to a handler.
pub struct Processor<H> {
    handler: Arc<H>,
}

impl<H> Clone for Processor<H> {
    fn clone(&self) -> Self {
        Self {
            handler: Arc::clone(&self.handler),
        }
    }
}

/// What a request produced.
enum Outcome {
    Reply(Bytes),
    Exception(ApplicationException),
    /// Oneway operation, nothing to send.
    Nothing,
}

impl<H: UserService> Processor<H> {
    pub fn new(handler: Arc<H>) -> Self {
        Self { handler }
    }

    pub fn handler(&self) -> &Arc<H> {
        &self.handler
    }

    /// Handle one request message; returns the reply message, if any.
    ///
    /// Fails only if the envelope itself is unusable.
    pub async fn process(
        &self,
        protocol: ProtocolKind,
        request: Bytes,
        out: &mut dyn OutputProtocol,
    ) -> Result<Option<Bytes>> {
        let mut input = protocol.input(request)?;
        let envelope = input.read_message_begin()?;
        let oneway = match envelope.kind {
            MessageKind::Call => false,
            MessageKind::Oneway => true,
            other => {
                return Err(WirecallError::violation(format!(
                    "expected CALL or ONEWAY, received {:?}",
                    other
                )))
            }
        };
        tracing::debug!(
            "Dispatching {} seq={} oneway={}",
            envelope.name,
            envelope.sequence_id,
            oneway
        );

        let outcome = self.dispatch(&envelope, input.as_mut(), out).await;
        match outcome {
            Outcome::Exception(e) if oneway => {
                tracing::warn!("Oneway {} failed: {}", envelope.name, e);
                Ok(None)
            }
            Outcome::Exception(exception) => {
                tracing::debug!("Rejecting {}: {}", envelope.name, exception);
                write_exception_message(out, &envelope.name, envelope.sequence_id, &exception)?;
                out.finish().map(Some)
            }
            Outcome::Reply(_) if oneway => Ok(None),
            Outcome::Reply(bytes) => Ok(Some(bytes)),
            Outcome::Nothing => {
                if !oneway {
                    tracing::debug!("{} is oneway but was sent as CALL; no reply", envelope.name);
                }
                Ok(None)
            }
        }
    }

    async fn dispatch(
        &self,
        envelope: &Envelope,
        input: &mut dyn InputProtocol,
        out: &mut dyn OutputProtocol,
    ) -> Outcome {
        let handler = self.handler.as_ref();
        match envelope.name.as_str() {
            method::CREATE_USER => match decode_args::<CreateUserArgs>(input) {
                Ok(args) => {
                    let result = handler.create_user(args.name, args.age).await;
                    reply(out, envelope, split(result))
                }
                Err(e) => Outcome::Exception(e),
            },
            method::GET_USER => match decode_args::<GetUserArgs>(input) {
                Ok(args) => reply(out, envelope, split(handler.get_user(args.user_id).await)),
                Err(e) => Outcome::Exception(e),
            },
            method::GET_ALL_USERS => match decode_args::<GetAllUsersArgs>(input) {
                Ok(GetAllUsersArgs) => reply(out, envelope, split(handler.get_all_users().await)),
                Err(e) => Outcome::Exception(e),
            },
            method::UPDATE_USER => match decode_args::<UpdateUserArgs>(input) {
                Ok(args) => reply(out, envelope, split(handler.update_user(args.user).await)),
                Err(e) => Outcome::Exception(e),
            },
            method::DELETE_USER => match decode_args::<DeleteUserArgs>(input) {
                Ok(args) => {
                    let result = handler.delete_user(args.user_id).await;
                    reply(out, envelope, split_void(result))
                }
                Err(e) => Outcome::Exception(e),
            },
            method::VALIDATE_USER_DATA => match decode_args::<ValidateUserDataArgs>(input) {
                Ok(args) => {
                    let result = handler
                        .validate_user_data(args.name, args.age, args.is_active)
                        .await;
                    reply(out, envelope, split(result))
                }
                Err(e) => Outcome::Exception(e),
            },
            method::LOG_USER_ACTIVITY => match decode_args::<LogUserActivityArgs>(input) {
                Ok(args) => {
                    handler.log_user_activity(args).await;
                    Outcome::Nothing
                }
                Err(e) => Outcome::Exception(e),
            },
            unknown => {
                if let Err(e) = skip(input, TType::Struct) {
                    tracing::debug!("Could not skip arguments of {}: {}", unknown, e);
                }
                Outcome::Exception(ApplicationException::new(
                    ApplicationErrorKind::UnknownMethod,
                    format!("Invalid method name: '{}'", unknown),
                ))
            }
        }
    }
}

fn decode_args<A: WireValue>(
    input: &mut dyn InputProtocol,
) -> std::result::Result<A, ApplicationException> {
    read_args(input)
        .map_err(|e| ApplicationException::new(ApplicationErrorKind::ProtocolError, e.to_string()))
}

fn read_args<A: WireValue>(input: &mut dyn InputProtocol) -> Result<A> {
    let args = A::read_value(input)?;
    input.read_message_end()?;
    Ok(args)
}

fn into_exception(err: WirecallError) -> ApplicationException {
    match err {
        WirecallError::Application(e) => e,
        other => ApplicationException::new(ApplicationErrorKind::InternalError, other.to_string()),
    }
}

fn split<T, E>(
    result: std::result::Result<T, CallError<E>>,
) -> std::result::Result<Reply<T, E>, ApplicationException> {
    match result {
        Ok(value) => Ok(Reply::Success(value)),
        Err(CallError::Declared(e)) => Ok(Reply::Declared(e)),
        Err(CallError::Rpc(e)) => Err(into_exception(e)),
    }
}

fn split_void<E>(
    result: std::result::Result<(), CallError<E>>,
) -> std::result::Result<VoidReply<E>, ApplicationException> {
    match result {
        Ok(()) => Ok(VoidReply::Success),
        Err(CallError::Declared(e)) => Ok(VoidReply::Declared(e)),
        Err(CallError::Rpc(e)) => Err(into_exception(e)),
    }
}

fn reply<R: WireValue>(
    out: &mut dyn OutputProtocol,
    envelope: &Envelope,
    result: std::result::Result<R, ApplicationException>,
) -> Outcome {
    let result = match result {
        Ok(result) => result,
        Err(e) => return Outcome::Exception(e),
    };
    match encode_reply(out, envelope, &result) {
        Ok(bytes) => Outcome::Reply(bytes),
        Err(e) => {
            // Drop the partial message; the encoder resets even when this fails.
            let _ = out.finish();
            Outcome::Exception(ApplicationException::new(
                ApplicationErrorKind::InternalError,
                format!("could not encode result: {}", e),
            ))
        }
    }
}

fn encode_reply<R: WireValue>(
    out: &mut dyn OutputProtocol,
    envelope: &Envelope,
    result: &R,
) -> Result<Bytes> {
    let header = Envelope::new(envelope.name.as_str(), MessageKind::Reply, envelope.sequence_id);
    out.write_message_begin(&header)?;
    result.write_value(out)?;
    out.write_message_end()?;
    out.finish()
}

/// Serve requests on one connection until the peer hangs up.
pub async fn serve_connection<S, H>(
    stream: S,
    protocol: ProtocolKind,
    framing: Framing,
    processor: Processor<H>,
    max_frame_size: usize,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
    H: UserService,
{
    let mut channel = Channel::new(stream, framing, protocol, max_frame_size);
    let mut out = protocol.output();

    let result = loop {
        let request = match channel.read_frame(None).await {
            Ok(frame) => frame,
            Err(WirecallError::ConnectionClosed) => break Ok(()),
            Err(e) => break Err(e),
        };

        let response = match processor.process(protocol, request, out.as_mut()).await {
            Ok(response) => response,
            Err(e) => break Err(e),
        };

        if let Some(bytes) = response {
            if let Err(e) = channel.write(bytes) {
                break Err(e);
            }
            if let Err(e) = channel.flush().await {
                break Err(e);
            }
        }
    };

    channel.close().await;
    result
}

/// TCP server running one task per connection.
pub struct Server<H> {
    listener: TcpListener,
    protocol: ProtocolKind,
    framing: Framing,
    processor: Processor<H>,
    max_frame_size: usize,
}

impl<H: UserService> Server<H> {
    /// Bind to `addr` (use port 0 for an ephemeral port).
    pub async fn bind(addr: &str, protocol: ProtocolKind, handler: Arc<H>) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        tracing::info!(
            "Listening on {} using {} protocol",
            listener.local_addr()?,
            protocol
        );
        Ok(Self {
            listener,
            protocol,
            framing: Framing::default(),
            processor: Processor::new(handler),
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        })
    }

    /// Change how messages are delimited. Unframed by default.
    pub fn framing(mut self, framing: Framing) -> Self {
        self.framing = framing;
        self
    }

    /// Change the largest accepted request frame.
    pub fn max_frame_size(mut self, size: usize) -> Self {
        self.max_frame_size = size;
        self
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections forever.
    pub async fn run(self) -> Result<()> {
        loop {
            let (stream, peer) = self.listener.accept().await?;
            if let Err(e) = stream.set_nodelay(true) {
                tracing::debug!("Could not set TCP_NODELAY for {}: {}", peer, e);
            }
            tracing::info!("Accepted connection from {}", peer);

            let processor = self.processor.clone();
            let protocol = self.protocol;
            let framing = self.framing;
            let max_frame_size = self.max_frame_size;
            tokio::spawn(async move {
                let served =
                    serve_connection(stream, protocol, framing, processor, max_frame_size).await;
                match served {
                    Ok(()) => tracing::debug!("Connection from {} closed", peer),
                    Err(e) => tracing::error!("Connection from {} failed: {}", peer, e),
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::begin_call;
    use crate::service::{InMemoryUserService, User};

    const ALL: [ProtocolKind; 3] = [
        ProtocolKind::Binary,
        ProtocolKind::Compact,
        ProtocolKind::Json,
    ];

    fn processor() -> Processor<InMemoryUserService> {
        Processor::new(Arc::new(InMemoryUserService::new()))
    }

    fn request<A: WireValue>(
        protocol: ProtocolKind,
        name: &str,
        seq: i32,
        oneway: bool,
        args: &A,
    ) -> Bytes {
        let mut out = protocol.output();
        begin_call(out.as_mut(), name, seq, oneway).unwrap();
        args.write_value(out.as_mut()).unwrap();
        out.write_message_end().unwrap();
        out.finish().unwrap()
    }

    fn decode_exception(protocol: ProtocolKind, bytes: Bytes) -> (Envelope, ApplicationException) {
        let mut input = protocol.input(bytes).unwrap();
        let envelope = input.read_message_begin().unwrap();
        (envelope, ApplicationException::read_value(input.as_mut()).unwrap())
    }

    #[tokio::test]
    async fn test_create_then_get() {
        for protocol in ALL {
            let processor = processor();
            let mut out = protocol.output();

            let args = CreateUserArgs {
                name: "Ann".to_string(),
                age: 33,
            };
            let bytes = processor
                .process(protocol, request(protocol, "createUser", 5, false, &args), out.as_mut())
                .await
                .unwrap()
                .unwrap();

            let mut input = protocol.input(bytes).unwrap();
            let envelope = input.read_message_begin().unwrap();
            assert_eq!(envelope.kind, MessageKind::Reply);
            assert_eq!(envelope.sequence_id, 5);
            assert_eq!(envelope.name, "createUser");
            let created =
                Reply::<User, std::convert::Infallible>::read_value(input.as_mut()).unwrap();
            assert_eq!(
                created,
                Reply::Success(User {
                    id: 1,
                    name: "Ann".to_string(),
                    age: 33
                }),
                "protocol {}",
                protocol
            );
        }
    }

    #[tokio::test]
    async fn test_unknown_method() {
        for protocol in ALL {
            let processor = processor();
            let mut out = protocol.output();
            let bytes = processor
                .process(
                    protocol,
                    request(protocol, "frobnicate", 9, false, &GetAllUsersArgs),
                    out.as_mut(),
                )
                .await
                .unwrap()
                .unwrap();

            let (envelope, exception) = decode_exception(protocol, bytes);
            assert_eq!(envelope.kind, MessageKind::Exception);
            assert_eq!(envelope.sequence_id, 9);
            assert_eq!(exception.kind, ApplicationErrorKind::UnknownMethod);
            assert!(exception.message.contains("frobnicate"));
        }
    }

    #[tokio::test]
    async fn test_bad_arguments_are_protocol_error() {
        let protocol = ProtocolKind::Compact;
        let processor = processor();
        let mut out = protocol.output();
        // getUser without its user id.
        let bytes = processor
            .process(
                protocol,
                request(protocol, "getUser", 2, false, &GetAllUsersArgs),
                out.as_mut(),
            )
            .await
            .unwrap()
            .unwrap();

        let (_, exception) = decode_exception(protocol, bytes);
        assert_eq!(exception.kind, ApplicationErrorKind::ProtocolError);
        assert!(exception.message.contains("userId"));
    }

    #[tokio::test]
    async fn test_validation_failure_is_exception() {
        let protocol = ProtocolKind::Binary;
        let processor = processor();
        let mut out = protocol.output();
        let args = ValidateUserDataArgs {
            name: Some("x".to_string()),
            age: 200,
            is_active: false,
        };
        let bytes = processor
            .process(
                protocol,
                request(protocol, "validateUserData", 4, false, &args),
                out.as_mut(),
            )
            .await
            .unwrap()
            .unwrap();

        let (envelope, exception) = decode_exception(protocol, bytes);
        assert_eq!(envelope.kind, MessageKind::Exception);
        assert_eq!(exception.kind, ApplicationErrorKind::WrongMethodName);
        assert_eq!(exception.message, "Age must be between 0 and 150");
    }

    #[tokio::test]
    async fn test_oneway_produces_no_reply() {
        let protocol = ProtocolKind::Json;
        let processor = processor();
        let mut out = protocol.output();
        let activity = LogUserActivityArgs {
            action: "login".to_string(),
            user_id: 1,
            timestamp: "now".to_string(),
        };

        let response = processor
            .process(
                protocol,
                request(protocol, "logUserActivity", 1, true, &activity),
                out.as_mut(),
            )
            .await
            .unwrap();
        assert!(response.is_none());
        assert_eq!(processor.handler().activity_log().await, vec![activity]);

        // An unknown oneway is dropped silently too.
        let response = processor
            .process(
                protocol,
                request(protocol, "nope", 2, true, &GetAllUsersArgs),
                out.as_mut(),
            )
            .await
            .unwrap();
        assert!(response.is_none());
    }

    #[tokio::test]
    async fn test_reply_kind_request_is_rejected() {
        let protocol = ProtocolKind::Binary;
        let processor = processor();
        let mut out = protocol.output();

        let mut msg = protocol.output();
        msg.write_message_begin(&Envelope::new("getUser", MessageKind::Reply, 1))
            .unwrap();
        GetUserArgs { user_id: 1 }.write_value(msg.as_mut()).unwrap();
        msg.write_message_end().unwrap();

        let err = processor
            .process(protocol, msg.finish().unwrap(), out.as_mut())
            .await
            .unwrap_err();
        assert!(matches!(err, WirecallError::ProtocolViolation(_)));
    }

    #[tokio::test]
    async fn test_serve_connection_ends_on_hangup() {
        let (client, server) = tokio::io::duplex(1024);
        let task = tokio::spawn(serve_connection(
            server,
            ProtocolKind::Binary,
            Framing::Framed,
            processor(),
            DEFAULT_MAX_FRAME_SIZE,
        ));
        drop(client);
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_serve_connection_unframed_pipelined() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        for protocol in ALL {
            let (mut client, server) = tokio::io::duplex(4096);
            let task = tokio::spawn(serve_connection(
                server,
                protocol,
                Framing::Buffered,
                processor(),
                DEFAULT_MAX_FRAME_SIZE,
            ));

            // Two calls in a single write, no length prefixes.
            let args = CreateUserArgs {
                name: "Bo".to_string(),
                age: 7,
            };
            let lookup = GetUserArgs { user_id: 1 };
            let mut wire = request(protocol, method::CREATE_USER, 1, false, &args).to_vec();
            wire.extend_from_slice(&request(protocol, method::GET_USER, 2, false, &lookup));
            client.write_all(&wire).await.unwrap();
            client.shutdown().await.unwrap();

            let mut replies = Vec::new();
            client.read_to_end(&mut replies).await.unwrap();
            task.await.unwrap().unwrap();

            let mut messages =
                crate::transport::MessageBuffer::new(protocol, DEFAULT_MAX_FRAME_SIZE);
            let done = messages.push(&replies).unwrap();
            assert_eq!(done.len(), 2, "protocol {}", protocol);
            let expected = User {
                id: 1,
                name: "Bo".to_string(),
                age: 7,
            };
            for (seq, message) in (1..).zip(done) {
                let mut input = protocol.input(message).unwrap();
                let envelope = input.read_message_begin().unwrap();
                assert_eq!(envelope.kind, MessageKind::Reply);
                assert_eq!(envelope.sequence_id, seq);
                let user = Reply::<User, std::convert::Infallible>::read_value(input.as_mut());
                assert_eq!(user.unwrap(), Reply::Success(expected.clone()));
            }
        }
    }
}
