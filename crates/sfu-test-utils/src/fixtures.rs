//! Test fixtures for SFU testing.
//!
//! Capability sets shaped like what browser client libraries send, DTLS
//! parameters, and [`TestSfu`], a fully wired registry + session manager over
//! a [`MockEngine`] and [`MockEncoderLauncher`].

use crate::mock_encoder::MockEncoderLauncher;
use crate::mock_engine::MockEngine;
use common::types::PeerId;
use serde_json::json;
use sfu_service::actors::{
    ActorMetrics, IngestConfig, SessionContext, SessionManagerHandle, SourceRegistryHandle,
};
use sfu_service::capabilities::CapabilityRegistry;
use sfu_service::engine::{
    DtlsFingerprint, DtlsParameters, DtlsRole, MediaEngine, RtpCapabilities,
};
use sfu_service::ingest::RestartPolicy;
use sfu_service::signaling::{SignalingContext, SignalingHandler};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// A source as a peer would announce it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestSource {
    pub name: String,
    pub origin_url: String,
}

impl TestSource {
    /// Source `name` pulling from `rtmp://host/live/<name>`.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        let origin_url = format!("rtmp://host/live/{name}");
        Self { name, origin_url }
    }
}

/// Receive capabilities of a browser that decodes H264.
#[must_use]
pub fn h264_capabilities() -> RtpCapabilities {
    serde_json::from_value(json!({
        "codecs": [
            {
                "kind": "video",
                "mimeType": "video/H264",
                "preferredPayloadType": 125,
                "clockRate": 90000,
                "parameters": {
                    "level-asymmetry-allowed": 1,
                    "packetization-mode": 1,
                    "profile-level-id": "42e01f"
                },
                "rtcpFeedback": [
                    { "type": "nack" },
                    { "type": "nack", "parameter": "pli" },
                    { "type": "ccm", "parameter": "fir" },
                    { "type": "goog-remb" }
                ]
            },
            {
                "kind": "audio",
                "mimeType": "audio/opus",
                "preferredPayloadType": 111,
                "clockRate": 48000,
                "channels": 2
            }
        ],
        "headerExtensions": []
    }))
    .expect("static capabilities are valid")
}

/// Receive capabilities of a client without H264 support.
#[must_use]
pub fn vp8_only_capabilities() -> RtpCapabilities {
    serde_json::from_value(json!({
        "codecs": [{
            "kind": "video",
            "mimeType": "video/VP8",
            "preferredPayloadType": 96,
            "clockRate": 90000
        }]
    }))
    .expect("static capabilities are valid")
}

#[must_use]
pub fn dtls_parameters() -> DtlsParameters {
    DtlsParameters {
        role: DtlsRole::Client,
        fingerprints: vec![DtlsFingerprint {
            algorithm: "sha-256".to_string(),
            value: "82:5A:68:3D:36:C3:0A:DE:AF:E7:32:43:D2:88:83:57:AC:2D:65:E5:80:C4:B6:FB:AF:1A:A0:21:9F:6D:0C:AD".to_string(),
        }],
    }
}

/// Registry and session manager wired to mocks.
pub struct TestSfu {
    pub engine: Arc<MockEngine>,
    pub launcher: Arc<MockEncoderLauncher>,
    pub registry: SourceRegistryHandle,
    pub sessions: SessionManagerHandle,
    pub capabilities: CapabilityRegistry,
    pub metrics: Arc<ActorMetrics>,
    pub root_token: CancellationToken,
    registry_task: JoinHandle<()>,
    sessions_task: JoinHandle<()>,
}

impl TestSfu {
    /// Start with a default engine and no encoder restarts.
    #[must_use]
    pub fn start() -> Self {
        Self::builder().build()
    }

    #[must_use]
    pub fn builder() -> TestSfuBuilder {
        TestSfuBuilder::default()
    }

    #[must_use]
    pub fn signaling_context(&self) -> SignalingContext {
        SignalingContext {
            registry: self.registry.clone(),
            sessions: self.sessions.clone(),
            capabilities: self.capabilities.clone(),
        }
    }

    /// Register a fresh peer and return its dispatcher.
    pub async fn connect_peer(&self) -> SignalingHandler {
        let session = self
            .sessions
            .register_peer(PeerId::new())
            .await
            .expect("register peer");
        SignalingHandler::new(session, self.signaling_context())
    }

    /// Create `source` through the registry.
    pub async fn create_source(&self, source: &TestSource) -> bool {
        self.registry
            .create_source(source.name.clone(), source.origin_url.clone())
            .await
            .expect("create source")
    }

    /// Cancel everything and wait for both actors to drain.
    pub async fn shutdown(self) {
        self.root_token.cancel();
        self.sessions_task.await.expect("session manager task");
        self.registry_task.await.expect("registry task");
    }
}

#[derive(Default)]
pub struct TestSfuBuilder {
    engine: Option<Arc<MockEngine>>,
    restart_policy: RestartPolicy,
}

impl TestSfuBuilder {
    #[must_use]
    pub fn engine(mut self, engine: Arc<MockEngine>) -> Self {
        self.engine = Some(engine);
        self
    }

    #[must_use]
    pub fn restart_policy(mut self, policy: RestartPolicy) -> Self {
        self.restart_policy = policy;
        self
    }

    /// Spawn the actors. Must be called inside a tokio runtime.
    #[must_use]
    pub fn build(self) -> TestSfu {
        let engine = self.engine.unwrap_or_else(|| MockEngine::builder().build());
        let launcher = MockEncoderLauncher::new();
        let metrics = ActorMetrics::new();
        let root_token = CancellationToken::new();
        let dyn_engine: Arc<dyn MediaEngine> = Arc::clone(&engine) as Arc<dyn MediaEngine>;
        let capabilities = CapabilityRegistry::new(Arc::clone(&dyn_engine));

        let (registry, registry_task) = SourceRegistryHandle::spawn(
            "sfu-test".to_string(),
            Arc::clone(&dyn_engine),
            Arc::clone(&launcher) as Arc<dyn sfu_service::ingest::EncoderLauncher>,
            IngestConfig {
                restart_policy: self.restart_policy,
                ..IngestConfig::default()
            },
            root_token.child_token(),
            Arc::clone(&metrics),
        );

        let (sessions, sessions_task) = SessionManagerHandle::spawn(
            "sfu-test".to_string(),
            SessionContext {
                engine: dyn_engine,
                capabilities: capabilities.clone(),
                registry: registry.clone(),
                metrics: Arc::clone(&metrics),
            },
            root_token.child_token(),
        );

        TestSfu {
            engine,
            launcher,
            registry,
            sessions,
            capabilities,
            metrics,
            root_token,
            registry_task,
            sessions_task,
        }
    }
}
