//! Capability Registry.
//!
//! Pass-through over the media engine's negotiated codec set. Both the
//! ingestion path (what may be produced) and the consumption path (what a
//! peer may consume) consult this one place.

use crate::engine::{MediaEngine, RtpCapabilities, RtpParameters};
use common::types::ProducerId;
use std::sync::Arc;

/// Read-only view of the router's capabilities.
#[derive(Clone)]
pub struct CapabilityRegistry {
    engine: Arc<dyn MediaEngine>,
}

impl CapabilityRegistry {
    pub fn new(engine: Arc<dyn MediaEngine>) -> Self {
        Self { engine }
    }

    /// Router RTP capabilities. No side effects.
    pub fn capabilities(&self) -> RtpCapabilities {
        self.engine.rtp_capabilities()
    }

    /// Whether a peer with `remote` capabilities can consume `producer_id`.
    pub fn can_consume(&self, producer_id: ProducerId, remote: &RtpCapabilities) -> bool {
        self.engine.can_consume(producer_id, remote)
    }

    /// Whether the router accepts every codec of `rtp_parameters`.
    pub fn supports(&self, rtp_parameters: &RtpParameters) -> bool {
        let router = self.capabilities();
        !rtp_parameters.codecs.is_empty()
            && rtp_parameters.codecs.iter().all(|codec| {
                router
                    .codecs
                    .iter()
                    .any(|c| c.matches(&codec.mime_type, codec.clock_rate))
            })
    }
}

impl std::fmt::Debug for CapabilityRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CapabilityRegistry").finish_non_exhaustive()
    }
}
