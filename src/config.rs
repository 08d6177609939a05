//! Client configuration.
//!
//! The wire encoding is resolved once, before any channel is opened:
//!
//! | Source                         | Precedence |
//! |--------------------------------|------------|
//! | explicit override              | highest    |
//! | `WIRECALL_PROTOCOL` (non-empty)|            |
//! | first process argument         |            |
//! | `binary`                       | lowest     |
//!
//! Unrecognised names fall back to `binary` without failing.
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//! use wirecall::{ClientConfig, Framing, ProtocolKind};
//!
//! let config = ClientConfig::new()
//!     .addr("10.0.0.5:9091")
//!     .protocol(ProtocolKind::Compact)
//!     .framing(Framing::Framed)
//!     .read_timeout(Duration::from_secs(2));
//! assert_eq!(config.protocol, ProtocolKind::Compact);
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::protocol::ProtocolKind;
use crate::transport::{Framing, DEFAULT_MAX_FRAME_SIZE};

/// Environment variable naming the wire encoding.
pub const PROTOCOL_ENV_VAR: &str = "WIRECALL_PROTOCOL";

/// Default server address.
pub const DEFAULT_ADDR: &str = "127.0.0.1:9091";

/// Default connect timeout.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Default time to wait for a reply.
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(30);

impl ProtocolKind {
    /// Pick the encoding from the available sources.
    ///
    /// Empty or whitespace-only values count as absent.
    pub fn resolve(explicit: Option<&str>, env: Option<&str>, arg: Option<&str>) -> Self {
        fn present(value: Option<&str>) -> Option<&str> {
            value.filter(|v| !v.trim().is_empty())
        }

        let chosen = present(explicit).or(present(env)).or(present(arg));
        match chosen {
            Some(name) => ProtocolKind::from_name(name),
            None => ProtocolKind::default(),
        }
    }
}

/// Settings for one client channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// `host:port` to connect to.
    pub addr: String,
    pub protocol: ProtocolKind,
    /// Unframed by default, matching plain buffered Thrift servers.
    pub framing: Framing,
    pub connect_timeout: Duration,
    /// `None` waits for a reply forever.
    pub read_timeout: Option<Duration>,
    /// Largest frame payload accepted or sent.
    pub max_frame_size: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            addr: DEFAULT_ADDR.to_string(),
            protocol: ProtocolKind::default(),
            framing: Framing::default(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            read_timeout: Some(DEFAULT_READ_TIMEOUT),
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }
}

impl ClientConfig {
    /// Create a configuration with all defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Default configuration with the protocol taken from the environment
    /// and process arguments.
    ///
    /// `args` are the process arguments without the program name, e.g.
    /// `std::env::args().skip(1)`.
    pub fn from_env_and_args<I>(args: I) -> Self
    where
        I: IntoIterator<Item = String>,
    {
        let env = std::env::var(PROTOCOL_ENV_VAR).ok();
        let arg = args.into_iter().next();
        let protocol = ProtocolKind::resolve(None, env.as_deref(), arg.as_deref());
        tracing::debug!("Resolved protocol: {}", protocol);

        Self {
            protocol,
            ..Self::default()
        }
    }

    /// Set the server address.
    pub fn addr(mut self, addr: impl Into<String>) -> Self {
        self.addr = addr.into();
        self
    }

    /// Override the wire encoding.
    pub fn protocol(mut self, protocol: ProtocolKind) -> Self {
        self.protocol = protocol;
        self
    }

    /// Choose how messages are delimited on the stream.
    pub fn framing(mut self, framing: Framing) -> Self {
        self.framing = framing;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = Some(timeout);
        self
    }

    /// Wait for replies without a deadline.
    pub fn no_read_timeout(mut self) -> Self {
        self.read_timeout = None;
        self
    }

    pub fn max_frame_size(mut self, size: usize) -> Self {
        self.max_frame_size = size;
        self
    }
}
