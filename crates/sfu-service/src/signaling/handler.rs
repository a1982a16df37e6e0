//! Per-peer request dispatcher.
//!
//! Maps each request frame onto a registry or session operation and turns
//! the outcome into a reply frame. Every failure produces a structured error
//! reply; nothing is left unanswered.

use super::protocol::{
    ConnectTransportRequest, ConsumeRequest, CreateSourceRequest, Method, ReplyFrame,
    RequestFrame, ResumeRequest,
};
use crate::actors::{SessionManagerHandle, SourceRegistryHandle, ViewerSessionHandle};
use crate::capabilities::CapabilityRegistry;
use crate::errors::SfuError;
use crate::observability;

use common::types::PeerId;
use serde::Serialize;
use serde_json::Value;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Shared collaborators of every signaling connection.
#[derive(Clone, Debug)]
pub struct SignalingContext {
    pub registry: SourceRegistryHandle,
    pub sessions: SessionManagerHandle,
    pub capabilities: CapabilityRegistry,
}

/// Dispatcher bound to one connected peer.
#[derive(Debug)]
pub struct SignalingHandler {
    session: ViewerSessionHandle,
    ctx: SignalingContext,
}

impl SignalingHandler {
    #[must_use]
    pub fn new(session: ViewerSessionHandle, ctx: SignalingContext) -> Self {
        Self { session, ctx }
    }

    #[must_use]
    pub fn peer_id(&self) -> PeerId {
        self.session.peer_id()
    }

    /// Handle one text frame and produce its reply.
    pub async fn handle_text(&self, text: &str) -> ReplyFrame {
        let started = Instant::now();

        let frame = match RequestFrame::parse(text) {
            Ok(frame) => frame,
            Err((id, e)) => {
                debug!(
                    target: "sfu.signaling",
                    peer_id = %self.peer_id(),
                    error = %e,
                    "Malformed signaling frame"
                );
                observability::record_signaling_request(
                    "invalid",
                    e.error_type_label(),
                    started.elapsed(),
                );
                return ReplyFrame::failure(id, &e);
            }
        };

        let Some(method) = Method::parse(&frame.method) else {
            let e = SfuError::BadRequest(format!("unknown method: {}", frame.method));
            debug!(
                target: "sfu.signaling",
                peer_id = %self.peer_id(),
                method = %frame.method,
                "Unknown signaling method"
            );
            observability::record_signaling_request(
                "unknown",
                e.error_type_label(),
                started.elapsed(),
            );
            return ReplyFrame::failure(Some(frame.id), &e);
        };

        let result = self.dispatch(method, &frame).await;
        let elapsed = started.elapsed();

        match result {
            Ok(data) => {
                observability::record_signaling_request(method.as_str(), "ok", elapsed);
                ReplyFrame::success(frame.id, data)
            }
            Err(e) => {
                match e.error_code() {
                    "INTERNAL" | "ENGINE_UNAVAILABLE" => warn!(
                        target: "sfu.signaling",
                        peer_id = %self.peer_id(),
                        method = method.as_str(),
                        error = %e,
                        "Signaling request failed"
                    ),
                    _ => debug!(
                        target: "sfu.signaling",
                        peer_id = %self.peer_id(),
                        method = method.as_str(),
                        error = %e,
                        "Signaling request rejected"
                    ),
                }
                observability::record_signaling_request(
                    method.as_str(),
                    e.error_type_label(),
                    elapsed,
                );
                ReplyFrame::failure(Some(frame.id), &e)
            }
        }
    }

    async fn dispatch(&self, method: Method, frame: &RequestFrame) -> Result<Value, SfuError> {
        match method {
            Method::CreateSource => {
                let request: CreateSourceRequest = frame.payload()?;
                let name = request.name.clone();
                let created = self
                    .ctx
                    .registry
                    .create_source(request.name, request.origin_url)
                    .await?;
                info!(
                    target: "sfu.signaling",
                    peer_id = %self.peer_id(),
                    source = %name,
                    created,
                    "createSource handled"
                );
                Ok(Value::Null)
            }

            Method::GetRouterRtpCapabilities => to_data(&self.ctx.capabilities.capabilities()),

            Method::CreateConsumerTransport => {
                let params = self.session.create_transport().await?;
                to_data(&params)
            }

            Method::ConnectConsumerTransport => {
                let request: ConnectTransportRequest = frame.payload()?;
                self.session
                    .connect_transport(request.transport_id, request.dtls_parameters)
                    .await?;
                Ok(Value::Null)
            }

            Method::Consume => {
                let request: ConsumeRequest = frame.payload()?;
                let result = self
                    .session
                    .consume(
                        request.source,
                        request.transport_id,
                        request.rtp_capabilities,
                    )
                    .await?;
                to_data(&result)
            }

            Method::Resume => {
                let request: ResumeRequest = frame.payload()?;
                let owner = self
                    .ctx
                    .sessions
                    .resolve_consumer(request.consumer_id)
                    .await?;
                owner.resume(request.consumer_id).await?;
                Ok(Value::Null)
            }
        }
    }
}

fn to_data<T: Serialize>(value: &T) -> Result<Value, SfuError> {
    serde_json::to_value(value)
        .map_err(|e| SfuError::Internal(format!("failed to encode reply: {e}")))
}
