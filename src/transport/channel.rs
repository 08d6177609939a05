//! Bidirectional message channel.
//!
//! Outgoing messages are queued by [`Channel::write`] and sent in one
//! scatter/gather write by [`Channel::flush`]. Incoming bytes are fed
//! through a [`FrameBuffer`] or a [`MessageBuffer`], depending on the
//! [`Framing`], and handed out one message at a time by
//! [`Channel::read_frame`].

use std::collections::VecDeque;
use std::io::IoSlice;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{lookup_host, TcpStream};

use super::{encode_frame_header, FrameBuffer, Framing, MessageBuffer, FRAME_HEADER_SIZE};
use crate::error::{Result, WirecallError};
use crate::protocol::ProtocolKind;

const READ_CHUNK_SIZE: usize = 8 * 1024;

/// A message ready to be written.
#[derive(Debug)]
pub struct OutboundFrame {
    /// Big-endian payload length, absent on buffered streams.
    pub header: Option<[u8; FRAME_HEADER_SIZE]>,
    pub payload: Bytes,
}

impl OutboundFrame {
    /// A length-prefixed frame.
    #[inline]
    pub fn new(payload: Bytes) -> Self {
        Self {
            header: Some(encode_frame_header(payload.len() as u32)),
            payload,
        }
    }

    /// A message sent as is.
    #[inline]
    pub fn bare(payload: Bytes) -> Self {
        Self {
            header: None,
            payload,
        }
    }

    fn header_bytes(&self) -> &[u8] {
        match &self.header {
            Some(header) => &header[..],
            None => &[],
        }
    }

    /// Total size on the wire (header + payload).
    #[inline]
    pub fn size(&self) -> usize {
        self.header_bytes().len() + self.payload.len()
    }
}

/// Incoming reassembly, one per framing.
#[derive(Debug)]
enum Inbound {
    Framed(FrameBuffer),
    Buffered(MessageBuffer),
}

impl Inbound {
    fn push(&mut self, data: &[u8]) -> Result<Vec<Bytes>> {
        match self {
            Inbound::Framed(frames) => frames.push(data),
            Inbound::Buffered(messages) => messages.push(data),
        }
    }

    fn clear(&mut self) {
        match self {
            Inbound::Framed(frames) => frames.clear(),
            Inbound::Buffered(messages) => messages.clear(),
        }
    }
}

/// One connection.
///
/// A channel is driven through `&mut self`, so at most one call is in
/// flight on it at a time.
pub struct Channel<S> {
    /// `None` once closed.
    stream: Option<S>,
    framing: Framing,
    inbound: Inbound,
    ready: VecDeque<Bytes>,
    outbound: Vec<OutboundFrame>,
    read_buf: Box<[u8]>,
    max_frame_size: usize,
}

impl<S> Channel<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Wrap an already-connected stream.
    ///
    /// `protocol` is only consulted for [`Framing::Buffered`], where
    /// message boundaries are found by decoding.
    pub fn new(stream: S, framing: Framing, protocol: ProtocolKind, max_frame_size: usize) -> Self {
        let inbound = match framing {
            Framing::Framed => Inbound::Framed(FrameBuffer::with_max_frame_size(max_frame_size)),
            Framing::Buffered => Inbound::Buffered(MessageBuffer::new(protocol, max_frame_size)),
        };
        Self {
            stream: Some(stream),
            framing,
            inbound,
            ready: VecDeque::new(),
            outbound: Vec::new(),
            read_buf: vec![0u8; READ_CHUNK_SIZE].into_boxed_slice(),
            max_frame_size,
        }
    }

    /// Length-prefixed messages.
    pub fn framed(stream: S, max_frame_size: usize) -> Self {
        Self::new(stream, Framing::Framed, ProtocolKind::Binary, max_frame_size)
    }

    /// Messages back to back, delimited by decoding them with `protocol`.
    pub fn buffered(stream: S, protocol: ProtocolKind, max_frame_size: usize) -> Self {
        Self::new(stream, Framing::Buffered, protocol, max_frame_size)
    }

    pub fn framing(&self) -> Framing {
        self.framing
    }

    /// Check if the channel has not been closed.
    pub fn is_open(&self) -> bool {
        self.stream.is_some()
    }

    /// Queue one message for sending. Nothing hits the wire until [`flush`](Self::flush).
    pub fn write(&mut self, payload: Bytes) -> Result<()> {
        if self.stream.is_none() {
            return Err(WirecallError::ChannelClosed);
        }
        if payload.len() > self.max_frame_size {
            return Err(WirecallError::violation(format!(
                "outgoing frame size {} exceeds maximum {}",
                payload.len(),
                self.max_frame_size
            )));
        }
        let frame = match self.framing {
            Framing::Framed => OutboundFrame::new(payload),
            Framing::Buffered => OutboundFrame::bare(payload),
        };
        self.outbound.push(frame);
        Ok(())
    }

    /// Send all queued messages.
    pub async fn flush(&mut self) -> Result<()> {
        let stream = self.stream.as_mut().ok_or(WirecallError::ChannelClosed)?;
        let batch = std::mem::take(&mut self.outbound);
        write_batch(stream, &batch).await
    }

    /// Wait for the next complete message.
    ///
    /// With a timeout, fails with [`WirecallError::Timeout`] if no complete
    /// message arrives in time. End of stream is
    /// [`WirecallError::ConnectionClosed`].
    pub async fn read_frame(&mut self, timeout: Option<Duration>) -> Result<Bytes> {
        if let Some(frame) = self.ready.pop_front() {
            return Ok(frame);
        }
        match timeout {
            Some(limit) => tokio::time::timeout(limit, self.fill())
                .await
                .map_err(|_| WirecallError::Timeout(limit))?,
            None => self.fill().await,
        }
    }

    async fn fill(&mut self) -> Result<Bytes> {
        let stream = self.stream.as_mut().ok_or(WirecallError::ChannelClosed)?;
        loop {
            let n = stream.read(&mut self.read_buf).await?;
            if n == 0 {
                return Err(WirecallError::ConnectionClosed);
            }
            self.ready.extend(self.inbound.push(&self.read_buf[..n])?);
            if let Some(frame) = self.ready.pop_front() {
                return Ok(frame);
            }
        }
    }

    /// Shut the stream down and drop any buffered data. Safe to call twice.
    pub async fn close(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            if let Err(e) = stream.shutdown().await {
                tracing::debug!("Error shutting down stream: {}", e);
            }
        }
        self.inbound.clear();
        self.ready.clear();
        self.outbound.clear();
    }
}

impl Channel<TcpStream> {
    /// Connect to `addr`, trying each resolved address in turn.
    pub async fn connect(
        addr: &str,
        connect_timeout: Duration,
        framing: Framing,
        protocol: ProtocolKind,
        max_frame_size: usize,
    ) -> Result<Self> {
        let addrs = lookup_host(addr)
            .await
            .map_err(|e| WirecallError::Connect(format!("invalid address '{}': {}", addr, e)))?;

        let mut last_err = None;
        for socket_addr in addrs {
            match tokio::time::timeout(connect_timeout, TcpStream::connect(socket_addr)).await {
                Ok(Ok(stream)) => {
                    stream.set_nodelay(true)?;
                    tracing::debug!("Connected to {} ({})", socket_addr, framing);
                    return Ok(Channel::new(stream, framing, protocol, max_frame_size));
                }
                Ok(Err(e)) => last_err = Some(e.to_string()),
                Err(_) => last_err = Some(format!("timed out after {:?}", connect_timeout)),
            }
        }

        Err(WirecallError::Connect(format!(
            "failed to connect to {}: {}",
            addr,
            last_err.unwrap_or_else(|| "no addresses resolved".to_string())
        )))
    }
}

/// Write a batch of frames using scatter/gather I/O, then flush.
async fn write_batch<W>(writer: &mut W, batch: &[OutboundFrame]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    if batch.is_empty() {
        return writer.flush().await.map_err(Into::into);
    }

    let total_size: usize = batch.iter().map(OutboundFrame::size).sum();
    let mut total_written = 0;

    while total_written < total_size {
        let slices = build_remaining_slices(batch, total_written);
        let written = writer.write_vectored(&slices).await?;
        if written == 0 {
            return Err(WirecallError::Io(std::io::Error::new(
                std::io::ErrorKind::WriteZero,
                "write_vectored returned 0",
            )));
        }
        total_written += written;
    }

    writer.flush().await?;
    Ok(())
}

/// IoSlices covering everything after the first `skip_bytes` of `batch`.
fn build_remaining_slices(batch: &[OutboundFrame], skip_bytes: usize) -> Vec<IoSlice<'_>> {
    let mut slices = Vec::with_capacity(batch.len() * 2);
    let mut offset = 0;

    for frame in batch {
        let header = frame.header_bytes();
        if !header.is_empty() {
            let header_end = offset + header.len();
            if skip_bytes < header_end {
                let start = skip_bytes.saturating_sub(offset);
                slices.push(IoSlice::new(&header[start..]));
            }
            offset = header_end;
        }

        if !frame.payload.is_empty() {
            let payload_end = offset + frame.payload.len();
            if skip_bytes < payload_end {
                let start = skip_bytes.saturating_sub(offset);
                slices.push(IoSlice::new(&frame.payload[start..]));
            }
            offset = payload_end;
        }
    }

    slices
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::DEFAULT_MAX_FRAME_SIZE;
    use tokio::io::duplex;

    fn frame(payload: &'static [u8]) -> OutboundFrame {
        OutboundFrame::new(Bytes::from_static(payload))
    }

    #[test]
    fn test_outbound_frame() {
        let f = frame(b"hello");
        assert_eq!(f.header, Some([0, 0, 0, 5]));
        assert_eq!(f.size(), 9);

        let bare = OutboundFrame::bare(Bytes::from_static(b"hello"));
        assert_eq!(bare.header, None);
        assert_eq!(bare.size(), 5);
    }

    #[test]
    fn test_build_remaining_slices_without_headers() {
        let batch = [
            OutboundFrame::bare(Bytes::from_static(b"abc")),
            OutboundFrame::bare(Bytes::from_static(b"de")),
        ];
        let rest: Vec<u8> = build_remaining_slices(&batch, 2)
            .iter()
            .flat_map(|s| s.to_vec())
            .collect();
        assert_eq!(rest, b"cde");
    }

    #[test]
    fn test_build_remaining_slices() {
        let batch = [frame(b"abc"), frame(b"de")];

        let all: Vec<u8> = build_remaining_slices(&batch, 0)
            .iter()
            .flat_map(|s| s.to_vec())
            .collect();
        assert_eq!(all, [0, 0, 0, 3, b'a', b'b', b'c', 0, 0, 0, 2, b'd', b'e']);

        // Mid-header of the first frame.
        let rest: Vec<u8> = build_remaining_slices(&batch, 2)
            .iter()
            .flat_map(|s| s.to_vec())
            .collect();
        assert_eq!(rest, all[2..]);

        // Mid-payload of the first frame.
        let rest: Vec<u8> = build_remaining_slices(&batch, 5)
            .iter()
            .flat_map(|s| s.to_vec())
            .collect();
        assert_eq!(rest, all[5..]);

        assert!(build_remaining_slices(&batch, all.len()).is_empty());
    }

    #[tokio::test]
    async fn test_write_flush_read_roundtrip() {
        let (a, b) = duplex(64);
        let mut left = Channel::framed(a, DEFAULT_MAX_FRAME_SIZE);
        let mut right = Channel::framed(b, DEFAULT_MAX_FRAME_SIZE);

        left.write(Bytes::from_static(b"one")).unwrap();
        left.write(Bytes::from_static(b"two")).unwrap();
        left.flush().await.unwrap();

        assert_eq!(&right.read_frame(None).await.unwrap()[..], b"one");
        assert_eq!(&right.read_frame(None).await.unwrap()[..], b"two");
    }

    #[tokio::test]
    async fn test_buffered_messages_have_no_prefix() {
        use crate::envelope::begin_call;

        let mut out = ProtocolKind::Binary.output();
        begin_call(out.as_mut(), "getUser", 1, false).unwrap();
        out.write_struct_begin("getUser_args").unwrap();
        out.write_field_stop().unwrap();
        out.write_struct_end().unwrap();
        out.write_message_end().unwrap();
        let message = out.finish().unwrap();

        let (a, b) = duplex(64);
        let mut left = Channel::buffered(a, ProtocolKind::Binary, DEFAULT_MAX_FRAME_SIZE);
        let mut right = Channel::buffered(b, ProtocolKind::Binary, DEFAULT_MAX_FRAME_SIZE);
        assert_eq!(left.framing(), Framing::Buffered);

        left.write(message.clone()).unwrap();
        left.write(message.clone()).unwrap();
        left.flush().await.unwrap();

        assert_eq!(right.read_frame(None).await.unwrap(), message);
        assert_eq!(right.read_frame(None).await.unwrap(), message);
    }

    #[tokio::test]
    async fn test_buffered_read_sees_raw_bytes() {
        let (a, mut b) = duplex(64);
        let mut left = Channel::buffered(a, ProtocolKind::Binary, DEFAULT_MAX_FRAME_SIZE);
        left.write(Bytes::from_static(b"\x80\x01\x00\x01")).unwrap();
        left.flush().await.unwrap();

        let mut head = [0u8; 4];
        b.read_exact(&mut head).await.unwrap();
        assert_eq!(head, [0x80, 0x01, 0x00, 0x01]);
    }

    #[tokio::test]
    async fn test_large_frame_through_small_pipe() {
        let (a, b) = duplex(16);
        let mut left = Channel::framed(a, DEFAULT_MAX_FRAME_SIZE);
        let mut right = Channel::framed(b, DEFAULT_MAX_FRAME_SIZE);

        let payload = Bytes::from(vec![0xAB; 100_000]);
        let expected = payload.clone();
        let writer = tokio::spawn(async move {
            left.write(payload).unwrap();
            left.flush().await.unwrap();
            left
        });

        let received = right.read_frame(None).await.unwrap();
        assert_eq!(received, expected);
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn test_eof_is_connection_closed() {
        let (a, b) = duplex(64);
        let mut right = Channel::framed(b, DEFAULT_MAX_FRAME_SIZE);
        drop(a);

        let err = right.read_frame(None).await.unwrap_err();
        assert!(matches!(err, WirecallError::ConnectionClosed));
    }

    #[tokio::test]
    async fn test_read_timeout() {
        let (_a, b) = duplex(64);
        let mut right = Channel::framed(b, DEFAULT_MAX_FRAME_SIZE);

        let limit = Duration::from_millis(20);
        let err = right.read_frame(Some(limit)).await.unwrap_err();
        assert!(matches!(err, WirecallError::Timeout(d) if d == limit));
    }

    #[tokio::test]
    async fn test_oversized_incoming_frame() {
        let (mut a, b) = duplex(64);
        let mut right = Channel::framed(b, 8);

        a.write_all(&encode_frame_header(9)).await.unwrap();
        let err = right.read_frame(None).await.unwrap_err();
        assert!(matches!(err, WirecallError::Decode(_)));
    }

    #[tokio::test]
    async fn test_oversized_outgoing_frame() {
        let (_a, b) = duplex(64);
        let mut channel = Channel::framed(b, 4);
        assert!(channel.write(Bytes::from_static(b"12345")).is_err());
        assert!(channel.write(Bytes::from_static(b"1234")).is_ok());
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (_a, b) = duplex(64);
        let mut channel = Channel::framed(b, DEFAULT_MAX_FRAME_SIZE);
        assert!(channel.is_open());

        channel.close().await;
        channel.close().await;
        assert!(!channel.is_open());

        assert!(matches!(
            channel.write(Bytes::from_static(b"x")),
            Err(WirecallError::ChannelClosed)
        ));
        assert!(matches!(
            channel.read_frame(None).await,
            Err(WirecallError::ChannelClosed)
        ));
    }

    #[tokio::test]
    async fn test_connect_refused() {
        // Bind then drop to get a port nothing listens on.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let err = Channel::connect(
            &addr,
            Duration::from_secs(1),
            Framing::Framed,
            ProtocolKind::Binary,
            DEFAULT_MAX_FRAME_SIZE,
        )
        .await
        .err()
        .unwrap();
        assert!(matches!(err, WirecallError::Connect(_)));
    }

    #[tokio::test]
    async fn test_connect_invalid_address() {
        let err = Channel::connect(
            "not an address",
            Duration::from_secs(1),
            Framing::Buffered,
            ProtocolKind::Binary,
            DEFAULT_MAX_FRAME_SIZE,
        )
        .await
        .err()
        .unwrap();
        assert!(matches!(err, WirecallError::Connect(_)));
    }
}
