//! Connectors that dial in-process peers.

use crate::service::ReferenceService;
use async_trait::async_trait;
use satellite_engine::{BoxedStream, Connector, FramedTransport, SatelliteResult};
use satellite_protocol::{
    HelloAck, Message, ProtocolVersion, SubscribeAck, DEFAULT_MAX_FRAME_LEN,
};
use std::sync::atomic::{AtomicU64, Ordering};

/// Opens in-memory connections to a [`ReferenceService`].
#[derive(Debug)]
pub struct ChannelConnector {
    service: ReferenceService,
    attempts: AtomicU64,
}

impl ChannelConnector {
    /// Creates a connector for `service`.
    pub fn new(service: ReferenceService) -> Self {
        Self {
            service,
            attempts: AtomicU64::new(0),
        }
    }

    /// Connection attempts made so far, refused ones included.
    pub fn attempts(&self) -> u64 {
        self.attempts.load(Ordering::SeqCst)
    }

    /// The service this connector dials.
    pub fn service(&self) -> &ReferenceService {
        &self.service
    }
}

#[async_trait]
impl Connector for ChannelConnector {
    async fn connect(&self) -> SatelliteResult<BoxedStream> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        self.service.connect()
    }
}

/// Dials a peer that completes the handshake and then never reads again.
///
/// The pipe holds only `buffer` bytes, so the client's writes block once it
/// fills up.
#[derive(Debug)]
pub struct StalledConnector {
    watermark: u64,
    buffer: usize,
    attempts: AtomicU64,
}

impl StalledConnector {
    /// Creates a connector whose peer advertises `watermark`.
    pub fn new(watermark: u64, buffer: usize) -> Self {
        Self {
            watermark,
            buffer,
            attempts: AtomicU64::new(0),
        }
    }

    /// Connections opened so far.
    pub fn attempts(&self) -> u64 {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for StalledConnector {
    async fn connect(&self) -> SatelliteResult<BoxedStream> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let (client, server) = tokio::io::duplex(self.buffer);
        let watermark = self.watermark;
        tokio::spawn(async move {
            let mut transport = FramedTransport::new(Box::new(server), DEFAULT_MAX_FRAME_LEN);
            if !matches!(transport.recv().await, Ok(Some(Message::Hello(_)))) {
                return;
            }
            let ack = Message::HelloAck(HelloAck {
                server_version: ProtocolVersion::CURRENT,
                assigned_watermark: watermark,
            });
            if transport.send(&ack).await.is_err() {
                return;
            }
            if !matches!(transport.recv().await, Ok(Some(Message::SubscribeRequest(_)))) {
                return;
            }
            if transport
                .send(&Message::SubscribeAck(SubscribeAck { cursor: 0 }))
                .await
                .is_err()
            {
                return;
            }
            // Keep the pipe open without ever reading from it
            std::future::pending::<()>().await;
        });
        Ok(Box::new(client))
    }
}
