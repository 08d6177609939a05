//! # wirecall
//!
//! Typed RPC client core with pluggable wire encodings.
//!
//! A call writes one CALL (or ONEWAY) message to the channel,
//! waits for the REPLY or EXCEPTION carrying the same sequence id, and hands
//! back one of three outcomes:
//!
//! - the typed result,
//! - a declared exception ([`CallError::Declared`]),
//! - an RPC failure ([`CallError::Rpc`]), which is either a protocol exception
//!   sent by the peer or a local transport/decode problem.
//!
//! ## Architecture
//!
//! - **Encoding** ([`protocol`]): tagged binary, compact and JSON
//!   implementations of one encoder/decoder pair of traits
//! - **Envelope** ([`envelope`]): message header, kinds and protocol exceptions
//! - **Transport** ([`transport`]): unframed or length-prefixed channel over any
//!   async byte stream
//! - **Dispatch** ([`client`], [`service`]): sequence ids and typed operations
//! - **Responder** ([`server`]): processor and TCP server for the same contract
//!
//! ## Example
//!
//! ```ignore
//! use wirecall::{ClientConfig, UserServiceClient};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ClientConfig::from_env_and_args(std::env::args().skip(1));
//!     let mut users = UserServiceClient::connect(&config).await?;
//!
//!     let user = users.create_user("Alice", 30).await?;
//!     match users.get_user(user.id + 1).await {
//!         Ok(found) => println!("found {:?}", found),
//!         Err(e) => println!("lookup failed: {}", e),
//!     }
//!
//!     users.close().await;
//!     Ok(())
//! }
//! ```

pub mod client;
pub mod config;
pub mod envelope;
pub mod error;
pub mod protocol;
pub mod server;
pub mod service;
pub mod transport;

pub use client::{Reply, RpcClient, VoidReply};
pub use config::ClientConfig;
pub use envelope::{ApplicationErrorKind, ApplicationException, Envelope, MessageKind};
pub use error::{CallError, Result, WirecallError};
pub use protocol::{ProtocolKind, WireValue};
pub use server::{serve_connection, Processor, Server};
pub use service::{
    CallResult, InMemoryUserService, User, UserNotFound, UserService, UserServiceClient,
};
pub use transport::{Channel, Framing};
