//! Media engine seam.
//!
//! ICE/DTLS negotiation, SRTP and RTP forwarding all live behind
//! [`MediaEngine`]. The orchestration layer only ever talks to the engine
//! through this trait, so the engine can be swapped (the in-process
//! [`LocalEngine`], a fault-injecting mock in tests, or a bridge to an
//! external router process).

pub mod local;
pub mod types;

use async_trait::async_trait;
use thiserror::Error;

use common::types::{ConsumerId, ProducerId, TransportId};

pub use local::{LocalEngine, LocalEngineConfig};
pub use types::*;

/// Errors reported by the media engine.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EngineError {
    /// The engine refused to allocate a resource (ports, workers, memory).
    #[error("Engine resources exhausted: {0}")]
    ResourceExhausted(String),

    #[error("Unknown transport: {0}")]
    UnknownTransport(TransportId),

    #[error("Unknown producer: {0}")]
    UnknownProducer(ProducerId),

    #[error("Unknown consumer: {0}")]
    UnknownConsumer(ConsumerId),

    /// DTLS parameters were already applied to this transport.
    #[error("Transport already connected: {0}")]
    AlreadyConnected(TransportId),

    /// Any other refusal (invalid parameters, closed router).
    #[error("Engine rejected request: {0}")]
    Rejected(String),
}

/// Capability surface of the SFU router consumed by the orchestration layer.
///
/// Implementations must be cheap to share (`Arc<dyn MediaEngine>`) and safe
/// to call concurrently from every actor.
#[async_trait]
pub trait MediaEngine: Send + Sync + 'static {
    /// Router RTP capabilities. Pure read.
    fn rtp_capabilities(&self) -> RtpCapabilities;

    /// Create a one-way ingress endpoint bound to a local address.
    async fn create_plain_transport(
        &self,
        options: PlainTransportOptions,
    ) -> Result<PlainTransportInfo, EngineError>;

    /// Publish a stream on an ingress endpoint.
    async fn produce(
        &self,
        transport_id: TransportId,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    ) -> Result<ProducerId, EngineError>;

    /// Create a bidirectional peer transport with ICE/DTLS.
    async fn create_webrtc_transport(&self) -> Result<WebRtcTransportParams, EngineError>;

    /// Complete DTLS negotiation with the remote parameters.
    async fn connect_webrtc_transport(
        &self,
        transport_id: TransportId,
        dtls_parameters: DtlsParameters,
    ) -> Result<(), EngineError>;

    /// Whether `producer_id` can be consumed by a peer with `rtp_capabilities`.
    fn can_consume(&self, producer_id: ProducerId, rtp_capabilities: &RtpCapabilities) -> bool;

    /// Create a consumer for `producer_id` on `transport_id`.
    async fn consume(
        &self,
        transport_id: TransportId,
        producer_id: ProducerId,
        rtp_capabilities: RtpCapabilities,
        paused: bool,
    ) -> Result<ConsumerInfo, EngineError>;

    async fn resume_consumer(&self, consumer_id: ConsumerId) -> Result<(), EngineError>;

    /// Close a transport. Cascades to every consumer/producer on it.
    /// Closing an unknown or already closed transport is a no-op.
    async fn close_transport(&self, transport_id: TransportId);
}
