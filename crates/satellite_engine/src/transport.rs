//! Wire transport.
//!
//! The protocol runs over any ordered, reliable duplex byte stream. A
//! [`Connector`] opens one per session; [`FramedTransport`] turns it into a
//! stream of [`Message`]s using the frame codec.

use crate::error::{SatelliteError, SatelliteResult};
use async_trait::async_trait;
use bytes::BytesMut;
use satellite_protocol::{FrameCodec, Message};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::trace;

/// A duplex byte stream.
pub trait TransportStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> TransportStream for T {}

/// Boxed stream returned by a [`Connector`].
pub type BoxedStream = Box<dyn TransportStream>;

/// Opens connections to the replication service.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Opens a new stream.
    ///
    /// Failures should be retryable transport errors unless retrying
    /// cannot help.
    async fn connect(&self) -> SatelliteResult<BoxedStream>;
}

/// Connects over TCP.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    endpoint: String,
}

impl TcpConnector {
    /// Creates a connector for `host:port`.
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
        }
    }

    /// The endpoint this connector dials.
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self) -> SatelliteResult<BoxedStream> {
        let stream = TcpStream::connect(&self.endpoint).await.map_err(|e| {
            SatelliteError::transport_retryable(format!(
                "failed to connect to {}: {e}",
                self.endpoint
            ))
        })?;
        stream
            .set_nodelay(true)
            .map_err(|e| SatelliteError::transport_retryable(e.to_string()))?;
        Ok(Box::new(stream))
    }
}

const READ_CHUNK: usize = 8 * 1024;

/// Default bound on writing and flushing one frame.
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// A message stream over a byte stream.
pub struct FramedTransport {
    stream: BoxedStream,
    codec: FrameCodec,
    read_buf: BytesMut,
    write_buf: BytesMut,
    write_timeout: Duration,
}

impl FramedTransport {
    /// Wraps `stream`, rejecting frames longer than `max_frame_len`.
    pub fn new(stream: BoxedStream, max_frame_len: usize) -> Self {
        Self {
            stream,
            codec: FrameCodec::new(max_frame_len),
            read_buf: BytesMut::with_capacity(READ_CHUNK),
            write_buf: BytesMut::new(),
            write_timeout: DEFAULT_WRITE_TIMEOUT,
        }
    }

    /// Bounds how long one `send` may wait for the peer to take the bytes.
    pub fn with_write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }

    /// Writes one message.
    ///
    /// A peer that stops reading fails the send with a retryable error once
    /// the write timeout elapses.
    pub async fn send(&mut self, message: &Message) -> SatelliteResult<()> {
        self.write_buf.clear();
        self.codec.encode_into(message, &mut self.write_buf)?;
        trace!(kind = ?message.kind(), len = self.write_buf.len(), "sending frame");
        let stream = &mut self.stream;
        let buf = &self.write_buf;
        let write = async move {
            stream
                .write_all(buf)
                .await
                .map_err(|e| SatelliteError::transport_retryable(format!("write failed: {e}")))?;
            stream
                .flush()
                .await
                .map_err(|e| SatelliteError::transport_retryable(format!("flush failed: {e}")))
        };
        tokio::time::timeout(self.write_timeout, write)
            .await
            .map_err(|_| SatelliteError::transport_retryable("write timed out"))?
    }

    /// Reads the next message, or `None` once the peer closed the stream.
    ///
    /// Cancel-safe: a partially read frame stays buffered for the next call.
    pub async fn recv(&mut self) -> SatelliteResult<Option<Message>> {
        loop {
            if let Some(message) = self.codec.decode(&mut self.read_buf)? {
                trace!(kind = ?message.kind(), "received frame");
                return Ok(Some(message));
            }
            self.read_buf.reserve(READ_CHUNK);
            let read = self
                .stream
                .read_buf(&mut self.read_buf)
                .await
                .map_err(|e| SatelliteError::transport_retryable(format!("read failed: {e}")))?;
            if read == 0 {
                if self.read_buf.is_empty() {
                    return Ok(None);
                }
                return Err(SatelliteError::transport_retryable(
                    "connection closed mid-frame",
                ));
            }
        }
    }

    /// Shuts down the write half, giving up after the write timeout.
    pub async fn close(&mut self) {
        let _ = tokio::time::timeout(self.write_timeout, self.stream.shutdown()).await;
    }

    /// Frames of unknown kind skipped so far.
    pub fn skipped_frames(&self) -> u64 {
        self.codec.skipped_frames()
    }
}

impl std::fmt::Debug for FramedTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FramedTransport")
            .field("buffered", &self.read_buf.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use satellite_protocol::{Ack, DEFAULT_MAX_FRAME_LEN};

    #[tokio::test]
    async fn messages_cross_a_duplex_pipe() {
        let (a, b) = tokio::io::duplex(64);
        let mut left = FramedTransport::new(Box::new(a), DEFAULT_MAX_FRAME_LEN);
        let mut right = FramedTransport::new(Box::new(b), DEFAULT_MAX_FRAME_LEN);

        left.send(&Message::Ping).await.unwrap();
        left.send(&Message::Ack(Ack { up_to_seq: 7 })).await.unwrap();
        assert_eq!(right.recv().await.unwrap(), Some(Message::Ping));
        assert_eq!(right.recv().await.unwrap(), Some(Message::ack(7)));

        left.close().await;
        drop(left);
        assert_eq!(right.recv().await.unwrap(), None);
    }

    #[tokio::test]
    async fn oversized_frame_is_a_violation() {
        let (mut a, b) = tokio::io::duplex(64);
        let mut right = FramedTransport::new(Box::new(b), 16);
        a.write_all(&1_000u32.to_be_bytes()).await.unwrap();
        let err = right.recv().await.unwrap_err();
        assert!(matches!(err, SatelliteError::ProtocolViolation(_)));
    }

    #[tokio::test]
    async fn send_to_a_peer_that_stopped_reading_times_out() {
        let (a, _b) = tokio::io::duplex(64);
        let mut left = FramedTransport::new(Box::new(a), DEFAULT_MAX_FRAME_LEN)
            .with_write_timeout(Duration::from_millis(50));
        let big = Message::Error(satellite_protocol::ErrorMessage {
            code: satellite_protocol::ErrorCode::Internal,
            message: "x".repeat(1_000),
        });
        let err = left.send(&big).await.unwrap_err();
        assert!(err.is_retryable());
        assert!(err.to_string().contains("write timed out"));
    }

    #[tokio::test]
    async fn tcp_connect_failure_is_retryable() {
        let err = TcpConnector::new("127.0.0.1:1").connect().await.err().unwrap();
        assert!(err.is_retryable());
    }
}
