//! Message types for actor communication.
//!
//! All inter-actor communication uses strongly-typed message passing via
//! `tokio::sync::mpsc`. Request/reply uses `tokio::sync::oneshot`.

use crate::engine::{
    ConsumerType, DtlsParameters, MediaKind, RtpCapabilities, RtpParameters,
    WebRtcTransportParams,
};
use crate::errors::SfuError;
use crate::ingest::ExitOutcome;
use common::types::{ConsumerId, PeerId, ProducerId, TransportId};
use serde::Serialize;
use tokio::sync::oneshot;

use super::session::ViewerSessionHandle;

// ----------------------------------------------------------------------------
// Source registry
// ----------------------------------------------------------------------------

/// Messages sent to `SourceRegistryActor`.
#[derive(Debug)]
pub enum RegistryMessage {
    /// Register a source and start its ingestion pipeline.
    CreateSource {
        name: String,
        origin_url: String,
        /// `true` for the caller that created the source.
        respond_to: oneshot::Sender<Result<bool, SfuError>>,
    },

    LookupStream {
        name: String,
        respond_to: oneshot::Sender<Result<StreamHandle, SfuError>>,
    },

    GetSource {
        name: String,
        respond_to: oneshot::Sender<Result<SourceInfo, SfuError>>,
    },

    ListSources {
        respond_to: oneshot::Sender<Vec<SourceInfo>>,
    },
}

/// Events the registry actor sends to itself from spawned tasks.
#[derive(Debug)]
pub(crate) enum PipelineEvent {
    /// Receiver endpoint and stream allocation finished.
    Allocated {
        name: String,
        result: Result<AllocatedPipeline, SfuError>,
    },

    /// The encoder of `attempt` terminated on its own.
    EncoderExited {
        name: String,
        attempt: u32,
        outcome: ExitOutcome,
    },

    /// Backoff elapsed for restarting the encoder of `attempt`.
    RestartDue { name: String, attempt: u32 },
}

/// Engine resources held by a ready pipeline.
#[derive(Debug, Clone)]
pub(crate) struct AllocatedPipeline {
    pub transport_id: TransportId,
    pub rtp_port: u16,
    pub rtcp_port: Option<u16>,
    pub producer_id: ProducerId,
}

/// Lifecycle of an ingestion pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum PipelineState {
    /// Receiver endpoint and stream are being allocated.
    Pending,
    /// Encoder spawned.
    Running { pid: Option<u32> },
    /// Encoder exited with status 0.
    Exited,
    /// Encoder failed, was killed by a signal, or could not be spawned.
    Crashed { reason: String },
}

impl PipelineState {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            PipelineState::Pending => "pending",
            PipelineState::Running { .. } => "running",
            PipelineState::Exited => "exited",
            PipelineState::Crashed { .. } => "crashed",
        }
    }
}

/// Non-owning reference to a published stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamHandle {
    pub source: String,
    pub producer_id: ProducerId,
    pub kind: MediaKind,
}

/// Snapshot of one source and its pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceInfo {
    pub name: String,
    pub origin_url: String,
    #[serde(flatten)]
    pub state: PipelineState,
    pub ssrc: u32,
    pub rtp_port: Option<u16>,
    pub rtcp_port: Option<u16>,
    pub producer_id: Option<ProducerId>,
    pub restarts: u32,
    pub created_at: i64,
}

// ----------------------------------------------------------------------------
// Session manager
// ----------------------------------------------------------------------------

/// Messages sent to `SessionManagerActor`.
#[derive(Debug)]
pub enum SessionManagerMessage {
    /// A signaling peer connected.
    RegisterPeer {
        peer_id: PeerId,
        respond_to: oneshot::Sender<Result<ViewerSessionHandle, SfuError>>,
    },

    /// Find the session owning a consumer (process-global id space).
    ResolveConsumer {
        consumer_id: ConsumerId,
        respond_to: oneshot::Sender<Result<ViewerSessionHandle, SfuError>>,
    },

    /// A session created a consumer. Sent before the peer gets the reply.
    ConsumerCreated {
        peer_id: PeerId,
        consumer_id: ConsumerId,
    },

    /// A session dropped consumers (its transport was replaced).
    ConsumersReleased {
        peer_id: PeerId,
        consumer_ids: Vec<ConsumerId>,
    },

    /// Tear down everything the peer owns. Idempotent.
    Disconnect {
        peer_id: PeerId,
        respond_to: oneshot::Sender<()>,
    },

    GetStatus {
        respond_to: oneshot::Sender<SessionManagerStatus>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionManagerStatus {
    pub session_count: usize,
    pub consumer_count: usize,
    pub mailbox_depth: usize,
}

// ----------------------------------------------------------------------------
// Viewer session
// ----------------------------------------------------------------------------

/// Messages sent to `ViewerSessionActor`.
#[derive(Debug)]
pub enum SessionMessage {
    CreateTransport {
        respond_to: oneshot::Sender<Result<WebRtcTransportParams, SfuError>>,
    },

    ConnectTransport {
        transport_id: TransportId,
        dtls_parameters: DtlsParameters,
        respond_to: oneshot::Sender<Result<(), SfuError>>,
    },

    Consume {
        source: String,
        transport_id: TransportId,
        rtp_capabilities: RtpCapabilities,
        respond_to: oneshot::Sender<Result<ConsumeResult, SfuError>>,
    },

    Resume {
        consumer_id: ConsumerId,
        respond_to: oneshot::Sender<Result<(), SfuError>>,
    },

    GetState {
        respond_to: oneshot::Sender<SessionState>,
    },
}

/// Reply to a successful consume.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumeResult {
    pub producer_id: ProducerId,
    pub id: ConsumerId,
    pub kind: MediaKind,
    pub rtp_parameters: RtpParameters,
    #[serde(rename = "type")]
    pub consumer_type: ConsumerType,
    /// Current pause state of the handle; always true for a fresh video handle.
    pub producer_paused: bool,
}

/// One consumption handle as seen from outside the session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConsumerSummary {
    pub consumer_id: ConsumerId,
    pub source: String,
    pub paused: bool,
}

/// Snapshot of a viewer session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionState {
    pub peer_id: PeerId,
    pub transport_id: Option<TransportId>,
    pub transport_connected: bool,
    pub consumers: Vec<ConsumerSummary>,
}
