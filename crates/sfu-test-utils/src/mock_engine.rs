//! Fault-injecting media engine for SFU testing.
//!
//! Wraps the in-process [`LocalEngine`] so resource bookkeeping stays real,
//! and adds:
//! - Per-operation failure switches (flip them at any point in a test)
//! - An artificial delay before engine calls, for cancellation races
//! - Call counters per operation
//!
//! # Example
//!
//! ```rust,ignore
//! use sfu_test_utils::MockEngine;
//!
//! let engine = MockEngine::builder()
//!     .fail_produce()
//!     .build();
//!
//! // createSource now fails with EngineAllocation and rolls back
//! ```

use async_trait::async_trait;
use common::types::{ConsumerId, ProducerId, TransportId};
use sfu_service::engine::{
    ConsumerInfo, DtlsParameters, EngineError, LocalEngine, LocalEngineConfig, MediaEngine,
    MediaKind, PlainTransportInfo, PlainTransportOptions, RtpCapabilities, RtpParameters,
    WebRtcTransportParams,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Engine operations that can be counted and failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EngineOp {
    CreatePlainTransport,
    Produce,
    CreateWebRtcTransport,
    ConnectWebRtcTransport,
    Consume,
    ResumeConsumer,
    CloseTransport,
}

/// Mock engine with fault injection.
#[derive(Debug)]
pub struct MockEngine {
    inner: LocalEngine,
    fail_plain_transport: AtomicBool,
    fail_produce: AtomicBool,
    fail_webrtc_transport: AtomicBool,
    call_delay: Mutex<Option<Duration>>,
    calls: Mutex<HashMap<EngineOp, usize>>,
}

impl Default for MockEngine {
    fn default() -> Self {
        Self::from_local(LocalEngine::default())
    }
}

impl MockEngine {
    /// Create a new `MockEngine` builder.
    #[must_use]
    pub fn builder() -> MockEngineBuilder {
        MockEngineBuilder::default()
    }

    fn from_local(inner: LocalEngine) -> Self {
        Self {
            inner,
            fail_plain_transport: AtomicBool::new(false),
            fail_produce: AtomicBool::new(false),
            fail_webrtc_transport: AtomicBool::new(false),
            call_delay: Mutex::new(None),
            calls: Mutex::new(HashMap::new()),
        }
    }

    /// The wrapped engine, for resource assertions.
    #[must_use]
    pub fn inner(&self) -> &LocalEngine {
        &self.inner
    }

    pub fn set_fail_plain_transport(&self, fail: bool) {
        self.fail_plain_transport.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_produce(&self, fail: bool) {
        self.fail_produce.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_webrtc_transport(&self, fail: bool) {
        self.fail_webrtc_transport.store(fail, Ordering::SeqCst);
    }

    /// Delay every async engine call (except `close_transport`) by `delay`.
    pub fn set_call_delay(&self, delay: Option<Duration>) {
        *self.call_delay.lock().unwrap() = delay;
    }

    /// Number of calls made for `op`.
    #[must_use]
    pub fn calls(&self, op: EngineOp) -> usize {
        self.calls.lock().unwrap().get(&op).copied().unwrap_or(0)
    }

    fn record(&self, op: EngineOp) {
        *self.calls.lock().unwrap().entry(op).or_insert(0) += 1;
    }

    async fn delay(&self) {
        let delay = *self.call_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }
}

#[async_trait]
impl MediaEngine for MockEngine {
    fn rtp_capabilities(&self) -> RtpCapabilities {
        self.inner.rtp_capabilities()
    }

    async fn create_plain_transport(
        &self,
        options: PlainTransportOptions,
    ) -> Result<PlainTransportInfo, EngineError> {
        self.record(EngineOp::CreatePlainTransport);
        self.delay().await;
        if self.fail_plain_transport.load(Ordering::SeqCst) {
            return Err(EngineError::ResourceExhausted(
                "injected plain transport failure".to_string(),
            ));
        }
        self.inner.create_plain_transport(options).await
    }

    async fn produce(
        &self,
        transport_id: TransportId,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    ) -> Result<ProducerId, EngineError> {
        self.record(EngineOp::Produce);
        self.delay().await;
        if self.fail_produce.load(Ordering::SeqCst) {
            return Err(EngineError::Rejected("injected produce failure".to_string()));
        }
        self.inner.produce(transport_id, kind, rtp_parameters).await
    }

    async fn create_webrtc_transport(&self) -> Result<WebRtcTransportParams, EngineError> {
        self.record(EngineOp::CreateWebRtcTransport);
        self.delay().await;
        if self.fail_webrtc_transport.load(Ordering::SeqCst) {
            return Err(EngineError::ResourceExhausted(
                "injected webrtc transport failure".to_string(),
            ));
        }
        self.inner.create_webrtc_transport().await
    }

    async fn connect_webrtc_transport(
        &self,
        transport_id: TransportId,
        dtls_parameters: DtlsParameters,
    ) -> Result<(), EngineError> {
        self.record(EngineOp::ConnectWebRtcTransport);
        self.delay().await;
        self.inner
            .connect_webrtc_transport(transport_id, dtls_parameters)
            .await
    }

    fn can_consume(&self, producer_id: ProducerId, rtp_capabilities: &RtpCapabilities) -> bool {
        self.inner.can_consume(producer_id, rtp_capabilities)
    }

    async fn consume(
        &self,
        transport_id: TransportId,
        producer_id: ProducerId,
        rtp_capabilities: RtpCapabilities,
        paused: bool,
    ) -> Result<ConsumerInfo, EngineError> {
        self.record(EngineOp::Consume);
        self.delay().await;
        self.inner
            .consume(transport_id, producer_id, rtp_capabilities, paused)
            .await
    }

    async fn resume_consumer(&self, consumer_id: ConsumerId) -> Result<(), EngineError> {
        self.record(EngineOp::ResumeConsumer);
        self.delay().await;
        self.inner.resume_consumer(consumer_id).await
    }

    async fn close_transport(&self, transport_id: TransportId) {
        self.record(EngineOp::CloseTransport);
        self.inner.close_transport(transport_id).await;
    }
}

/// Builder for `MockEngine` configuration.
#[derive(Debug, Default)]
pub struct MockEngineBuilder {
    port_range: Option<(u16, u16)>,
    fail_plain_transport: bool,
    fail_produce: bool,
    fail_webrtc_transport: bool,
    call_delay: Option<Duration>,
}

impl MockEngineBuilder {
    /// Restrict the engine's RTC port range (inclusive).
    #[must_use]
    pub fn with_port_range(mut self, min: u16, max: u16) -> Self {
        self.port_range = Some((min, max));
        self
    }

    #[must_use]
    pub fn fail_plain_transport(mut self) -> Self {
        self.fail_plain_transport = true;
        self
    }

    #[must_use]
    pub fn fail_produce(mut self) -> Self {
        self.fail_produce = true;
        self
    }

    #[must_use]
    pub fn fail_webrtc_transport(mut self) -> Self {
        self.fail_webrtc_transport = true;
        self
    }

    #[must_use]
    pub fn with_call_delay(mut self, delay: Duration) -> Self {
        self.call_delay = Some(delay);
        self
    }

    #[must_use]
    pub fn build(self) -> Arc<MockEngine> {
        let mut config = LocalEngineConfig::default();
        if let Some((min, max)) = self.port_range {
            config.rtc_min_port = min;
            config.rtc_max_port = max;
        }

        let engine = MockEngine::from_local(LocalEngine::new(config));
        engine.set_fail_plain_transport(self.fail_plain_transport);
        engine.set_fail_produce(self.fail_produce);
        engine.set_fail_webrtc_transport(self.fail_webrtc_transport);
        engine.set_call_delay(self.call_delay);
        Arc::new(engine)
    }
}
