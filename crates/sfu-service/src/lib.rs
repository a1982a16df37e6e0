//! Relay SFU Service Library
//!
//! Signaling and session orchestration for a selective forwarding unit that
//! republishes RTMP-ingested live sources to many WebRTC viewers:
//!
//! - Named sources, each backed by an ingestion pipeline (engine receiver
//!   endpoint, published stream, supervised ffmpeg encoder)
//! - One viewer session per signaling peer, owning its transport and
//!   consumers and torn down on disconnect
//! - A JSON-over-WebSocket signaling protocol with structured error replies
//!
//! ICE/DTLS, SRTP and RTP forwarding live behind the [`engine::MediaEngine`]
//! trait.
//!
//! # Architecture
//!
//! ```text
//! SignalingServer (one task per WebSocket connection)
//! ├── SourceRegistryActor ── MediaEngine
//! │   └── encoder supervisors (one per source)
//! └── SessionManagerActor
//!     └── ViewerSessionActor (one per peer) ── MediaEngine
//! ```
//!
//! # Modules
//!
//! - [`actors`] - Registry, session manager and per-peer session actors
//! - [`capabilities`] - Router capability queries
//! - [`config`] - Service configuration from environment
//! - [`engine`] - Media engine seam and the in-process engine
//! - [`errors`] - Error types with signaling error codes
//! - [`ingest`] - Encoder command, process launcher and supervision
//! - [`observability`] - Metrics and health endpoints
//! - [`signaling`] - WebSocket signaling protocol

pub mod actors;
pub mod capabilities;
pub mod config;
pub mod engine;
pub mod errors;
pub mod ingest;
pub mod observability;
pub mod signaling;
