//! SFU service error types.
//!
//! Every error maps to a signaling error code string sent to the peer.
//! Internal details are logged server-side but not exposed to clients.

use crate::engine::EngineError;
use common::types::{ConsumerId, TransportId};
use thiserror::Error;

/// SFU service error type.
///
/// Maps to signaling error codes:
/// - `BadRequest`: `BAD_REQUEST`
/// - `SourceNotFound`, `TransportNotFound`, `ConsumerNotFound`: `NOT_FOUND`
/// - `IncompatibleCapabilities`: `INCOMPATIBLE_CAPABILITIES`
/// - `TransportNotConnected`, `TransportAlreadyConnected`: `PRECONDITION_FAILED`
/// - `EngineAllocation`, `Draining`: `ENGINE_UNAVAILABLE`
/// - Engine, `SessionClosed`, Internal: `INTERNAL`
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SfuError {
    /// Malformed frame, unknown method, or missing/invalid field.
    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Source not found: {0}")]
    SourceNotFound(String),

    /// The peer has no tracked transport with this id.
    #[error("Transport not found: {0}")]
    TransportNotFound(TransportId),

    #[error("Consumer not found: {0}")]
    ConsumerNotFound(ConsumerId),

    /// Consume attempted before DTLS negotiation completed.
    #[error("Transport not connected: {0}")]
    TransportNotConnected(TransportId),

    #[error("Transport already connected: {0}")]
    TransportAlreadyConnected(TransportId),

    /// The engine reports the source cannot be consumed with the remote
    /// capabilities.
    #[error("Incompatible capabilities for source: {0}")]
    IncompatibleCapabilities(String),

    /// The engine refused to allocate the receiver endpoint or stream.
    #[error("Engine allocation failed: {0}")]
    EngineAllocation(String),

    /// Any other engine failure.
    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),

    /// The viewer session was torn down while the request was in flight.
    #[error("Session closed")]
    SessionClosed,

    /// Service is shutting down.
    #[error("Service is draining")]
    Draining,

    /// Internal error with context.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl SfuError {
    /// Returns the signaling error code for this error.
    pub fn error_code(&self) -> &'static str {
        match self {
            SfuError::BadRequest(_) => "BAD_REQUEST",
            SfuError::SourceNotFound(_)
            | SfuError::TransportNotFound(_)
            | SfuError::ConsumerNotFound(_) => "NOT_FOUND",
            SfuError::IncompatibleCapabilities(_) => "INCOMPATIBLE_CAPABILITIES",
            SfuError::TransportNotConnected(_) | SfuError::TransportAlreadyConnected(_) => {
                "PRECONDITION_FAILED"
            }
            SfuError::EngineAllocation(_) | SfuError::Draining => "ENGINE_UNAVAILABLE",
            SfuError::Engine(_) | SfuError::SessionClosed | SfuError::Internal(_) => "INTERNAL",
        }
    }

    /// Returns a bounded label string for the error variant.
    ///
    /// Finer than `error_code()`: used as the `status` label of signaling
    /// metrics so `NOT_FOUND` splits by resource.
    pub fn error_type_label(&self) -> &'static str {
        match self {
            SfuError::BadRequest(_) => "bad_request",
            SfuError::SourceNotFound(_) => "source_not_found",
            SfuError::TransportNotFound(_) => "transport_not_found",
            SfuError::ConsumerNotFound(_) => "consumer_not_found",
            SfuError::TransportNotConnected(_) => "transport_not_connected",
            SfuError::TransportAlreadyConnected(_) => "transport_already_connected",
            SfuError::IncompatibleCapabilities(_) => "incompatible_capabilities",
            SfuError::EngineAllocation(_) => "engine_allocation",
            SfuError::Engine(_) => "engine",
            SfuError::SessionClosed => "session_closed",
            SfuError::Draining => "draining",
            SfuError::Internal(_) => "internal",
        }
    }

    /// Returns a client-safe error message (no internal details).
    pub fn client_message(&self) -> String {
        match self {
            SfuError::Engine(_) | SfuError::Internal(_) => {
                "An internal error occurred".to_string()
            }
            SfuError::EngineAllocation(_) => {
                "Media engine could not allocate resources, please retry".to_string()
            }
            SfuError::SessionClosed => "Session closed".to_string(),
            SfuError::Draining => "Server is shutting down, please reconnect".to_string(),
            SfuError::BadRequest(_)
            | SfuError::SourceNotFound(_)
            | SfuError::TransportNotFound(_)
            | SfuError::ConsumerNotFound(_)
            | SfuError::TransportNotConnected(_)
            | SfuError::TransportAlreadyConnected(_)
            | SfuError::IncompatibleCapabilities(_) => self.to_string(),
        }
    }
}
