//! `ViewerSessionActor` - per-peer state: one transport and its consumers.
//!
//! A session owns at most one peer transport and at most one consumer per
//! source. Engine calls run in spawned tasks raced against the session's
//! cancellation token, so a disconnect is never blocked behind a slow engine.
//! On exit the actor closes its transport, which cascades to its consumers.

use crate::capabilities::CapabilityRegistry;
use crate::engine::{
    DtlsParameters, EngineError, MediaEngine, MediaKind, RtpCapabilities, WebRtcTransportParams,
};
use crate::errors::SfuError;
use crate::observability;

use super::messages::{
    ConsumeResult, ConsumerSummary, SessionManagerMessage, SessionMessage, SessionState,
};
use super::metrics::{ActorMetrics, ActorType, MailboxMonitor};
use super::registry::SourceRegistryHandle;

use common::types::{ConsumerId, PeerId, TransportId};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// A peer only has one request in flight, so the mailbox stays shallow.
const SESSION_CHANNEL_BUFFER: usize = 64;

/// Everything a session needs besides its own state.
#[derive(Clone)]
pub struct SessionContext {
    pub engine: Arc<dyn MediaEngine>,
    pub capabilities: CapabilityRegistry,
    pub registry: SourceRegistryHandle,
    pub metrics: Arc<ActorMetrics>,
}

/// Handle to a `ViewerSessionActor`.
#[derive(Debug, Clone)]
pub struct ViewerSessionHandle {
    sender: mpsc::Sender<SessionMessage>,
    cancel_token: CancellationToken,
    peer_id: PeerId,
}

impl ViewerSessionHandle {
    #[must_use]
    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    /// Create the peer transport, replacing any previous one.
    pub async fn create_transport(&self) -> Result<WebRtcTransportParams, SfuError> {
        let (tx, rx) = oneshot::channel();
        self.send(SessionMessage::CreateTransport { respond_to: tx })
            .await?;
        rx.await.map_err(|_| SfuError::SessionClosed)?
    }

    pub async fn connect_transport(
        &self,
        transport_id: TransportId,
        dtls_parameters: DtlsParameters,
    ) -> Result<(), SfuError> {
        let (tx, rx) = oneshot::channel();
        self.send(SessionMessage::ConnectTransport {
            transport_id,
            dtls_parameters,
            respond_to: tx,
        })
        .await?;
        rx.await.map_err(|_| SfuError::SessionClosed)?
    }

    /// Create (or return the existing) consumer of `source` on the transport.
    ///
    /// Clients see `NOT_FOUND` for an unknown source or transport,
    /// `PRECONDITION_FAILED` before `connect_transport`, and
    /// `INCOMPATIBLE_CAPABILITIES` when no codec matches.
    pub async fn consume(
        &self,
        source: String,
        transport_id: TransportId,
        rtp_capabilities: RtpCapabilities,
    ) -> Result<ConsumeResult, SfuError> {
        let (tx, rx) = oneshot::channel();
        self.send(SessionMessage::Consume {
            source,
            transport_id,
            rtp_capabilities,
            respond_to: tx,
        })
        .await?;
        rx.await.map_err(|_| SfuError::SessionClosed)?
    }

    pub async fn resume(&self, consumer_id: ConsumerId) -> Result<(), SfuError> {
        let (tx, rx) = oneshot::channel();
        self.send(SessionMessage::Resume {
            consumer_id,
            respond_to: tx,
        })
        .await?;
        rx.await.map_err(|_| SfuError::SessionClosed)?
    }

    pub async fn get_state(&self) -> Result<SessionState, SfuError> {
        let (tx, rx) = oneshot::channel();
        self.send(SessionMessage::GetState { respond_to: tx }).await?;
        rx.await.map_err(|_| SfuError::SessionClosed)
    }

    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }

    async fn send(&self, message: SessionMessage) -> Result<(), SfuError> {
        self.sender
            .send(message)
            .await
            .map_err(|_| SfuError::SessionClosed)
    }
}

struct PeerTransport {
    id: TransportId,
    connected: bool,
}

struct TrackedConsumer {
    source: String,
    result: ConsumeResult,
}

/// The `ViewerSessionActor` implementation.
pub struct ViewerSessionActor {
    peer_id: PeerId,
    receiver: mpsc::Receiver<SessionMessage>,
    cancel_token: CancellationToken,
    ctx: SessionContext,
    /// Back-channel to the manager's consumer index.
    manager: mpsc::WeakSender<SessionManagerMessage>,
    transport: Option<PeerTransport>,
    /// Keyed by source name; at most one consumer per source.
    consumers: HashMap<String, TrackedConsumer>,
    mailbox: MailboxMonitor,
}

impl ViewerSessionActor {
    /// Spawn a session for `peer_id`.
    pub fn spawn(
        peer_id: PeerId,
        ctx: SessionContext,
        manager: mpsc::WeakSender<SessionManagerMessage>,
        cancel_token: CancellationToken,
    ) -> (ViewerSessionHandle, JoinHandle<()>) {
        let (sender, receiver) = mpsc::channel(SESSION_CHANNEL_BUFFER);

        let actor = Self {
            peer_id,
            receiver,
            cancel_token: cancel_token.clone(),
            ctx,
            manager,
            transport: None,
            consumers: HashMap::new(),
            mailbox: MailboxMonitor::new(ActorType::Session, peer_id.to_string()),
        };

        let task_handle = tokio::spawn(actor.run());

        let handle = ViewerSessionHandle {
            sender,
            cancel_token,
            peer_id,
        };

        (handle, task_handle)
    }

    #[instrument(skip_all, name = "sfu.actor.session", fields(peer_id = %self.peer_id))]
    async fn run(mut self) {
        debug!(
            target: "sfu.actor.session",
            peer_id = %self.peer_id,
            "ViewerSessionActor started"
        );

        loop {
            tokio::select! {
                () = self.cancel_token.cancelled() => {
                    break;
                }

                msg = self.receiver.recv() => {
                    match msg {
                        Some(message) => {
                            self.mailbox.record_enqueue();
                            self.handle_message(message).await;
                            self.mailbox.record_dequeue();
                            self.ctx.metrics.record_message_processed();
                        }
                        None => break,
                    }
                }
            }
        }

        self.teardown().await;

        info!(
            target: "sfu.actor.session",
            peer_id = %self.peer_id,
            messages_processed = self.mailbox.messages_processed(),
            "ViewerSessionActor stopped"
        );
    }

    async fn handle_message(&mut self, message: SessionMessage) {
        match message {
            SessionMessage::CreateTransport { respond_to } => {
                let result = self.create_transport().await;
                let _ = respond_to.send(result);
            }

            SessionMessage::ConnectTransport {
                transport_id,
                dtls_parameters,
                respond_to,
            } => {
                let result = self.connect_transport(transport_id, dtls_parameters).await;
                let _ = respond_to.send(result);
            }

            SessionMessage::Consume {
                source,
                transport_id,
                rtp_capabilities,
                respond_to,
            } => {
                let result = self.consume(source, transport_id, rtp_capabilities).await;
                let _ = respond_to.send(result);
            }

            SessionMessage::Resume {
                consumer_id,
                respond_to,
            } => {
                let result = self.resume(consumer_id).await;
                let _ = respond_to.send(result);
            }

            SessionMessage::GetState { respond_to } => {
                let _ = respond_to.send(self.state());
            }
        }
    }

    async fn create_transport(&mut self) -> Result<WebRtcTransportParams, SfuError> {
        if let Some(previous) = self.transport.take() {
            self.ctx.engine.close_transport(previous.id).await;
            let released: Vec<ConsumerId> =
                self.consumers.drain().map(|(_, c)| c.result.id).collect();

            debug!(
                target: "sfu.actor.session",
                peer_id = %self.peer_id,
                transport_id = %previous.id,
                released = released.len(),
                "Replacing peer transport"
            );

            if !released.is_empty() {
                self.notify_manager(SessionManagerMessage::ConsumersReleased {
                    peer_id: self.peer_id,
                    consumer_ids: released,
                })
                .await;
            }
        }

        let started = Instant::now();
        let engine = Arc::clone(&self.ctx.engine);
        let mut task = tokio::spawn(async move { engine.create_webrtc_transport().await });

        let joined = tokio::select! {
            () = self.cancel_token.cancelled() => {
                // The engine may still hand back a transport nobody owns.
                let engine = Arc::clone(&self.ctx.engine);
                tokio::spawn(async move {
                    if let Ok(Ok(params)) = task.await {
                        engine.close_transport(params.id).await;
                    }
                });
                return Err(SfuError::SessionClosed);
            }
            joined = &mut task => joined,
        };
        observability::record_engine_call("create_webrtc_transport", started.elapsed());

        let params = joined
            .map_err(|e| SfuError::Internal(format!("engine task failed: {e}")))?
            .map_err(map_engine_error)?;

        self.transport = Some(PeerTransport {
            id: params.id,
            connected: false,
        });

        debug!(
            target: "sfu.actor.session",
            peer_id = %self.peer_id,
            transport_id = %params.id,
            "Peer transport created"
        );

        Ok(params)
    }

    async fn connect_transport(
        &mut self,
        transport_id: TransportId,
        dtls_parameters: DtlsParameters,
    ) -> Result<(), SfuError> {
        match &self.transport {
            Some(t) if t.id == transport_id => {
                if t.connected {
                    return Err(SfuError::TransportAlreadyConnected(transport_id));
                }
            }
            _ => return Err(SfuError::TransportNotFound(transport_id)),
        }

        let engine = Arc::clone(&self.ctx.engine);
        self.engine_call("connect_webrtc_transport", async move {
            engine
                .connect_webrtc_transport(transport_id, dtls_parameters)
                .await
        })
        .await?;

        if let Some(transport) = self.transport.as_mut() {
            transport.connected = true;
        }

        debug!(
            target: "sfu.actor.session",
            peer_id = %self.peer_id,
            transport_id = %transport_id,
            "Peer transport connected"
        );

        Ok(())
    }

    /// Source lookup runs before the transport checks, so an unknown source
    /// wins over a bad transport id.
    async fn consume(
        &mut self,
        source: String,
        transport_id: TransportId,
        rtp_capabilities: RtpCapabilities,
    ) -> Result<ConsumeResult, SfuError> {
        let stream = self.ctx.registry.lookup_stream(source.clone()).await?;

        match &self.transport {
            Some(t) if t.id == transport_id => {
                if !t.connected {
                    return Err(SfuError::TransportNotConnected(transport_id));
                }
            }
            _ => return Err(SfuError::TransportNotFound(transport_id)),
        }

        if let Some(existing) = self.consumers.get(&source) {
            debug!(
                target: "sfu.actor.session",
                peer_id = %self.peer_id,
                source = %source,
                consumer_id = %existing.result.id,
                "Returning existing consumer"
            );
            return Ok(existing.result.clone());
        }

        if !self
            .ctx
            .capabilities
            .can_consume(stream.producer_id, &rtp_capabilities)
        {
            return Err(SfuError::IncompatibleCapabilities(source));
        }

        let paused = stream.kind == MediaKind::Video;
        let engine = Arc::clone(&self.ctx.engine);
        let producer_id = stream.producer_id;
        let info = self
            .engine_call("consume", async move {
                engine
                    .consume(transport_id, producer_id, rtp_capabilities, paused)
                    .await
            })
            .await?;

        let result = ConsumeResult {
            producer_id: info.producer_id,
            id: info.id,
            kind: info.kind,
            rtp_parameters: info.rtp_parameters,
            consumer_type: info.consumer_type,
            producer_paused: info.paused,
        };

        // Indexed before the peer can learn the id.
        self.notify_manager(SessionManagerMessage::ConsumerCreated {
            peer_id: self.peer_id,
            consumer_id: result.id,
        })
        .await;
        observability::record_consumer_created();

        info!(
            target: "sfu.actor.session",
            peer_id = %self.peer_id,
            source = %source,
            consumer_id = %result.id,
            paused = result.producer_paused,
            "Consumer created"
        );

        self.consumers.insert(
            source.clone(),
            TrackedConsumer {
                source,
                result: result.clone(),
            },
        );

        Ok(result)
    }

    async fn resume(&mut self, consumer_id: ConsumerId) -> Result<(), SfuError> {
        let paused = self
            .consumers
            .values()
            .find(|c| c.result.id == consumer_id)
            .map(|c| c.result.producer_paused)
            .ok_or(SfuError::ConsumerNotFound(consumer_id))?;

        if !paused {
            return Ok(());
        }

        let engine = Arc::clone(&self.ctx.engine);
        self.engine_call("resume_consumer", async move {
            engine.resume_consumer(consumer_id).await
        })
        .await?;

        if let Some(consumer) = self
            .consumers
            .values_mut()
            .find(|c| c.result.id == consumer_id)
        {
            consumer.result.producer_paused = false;
        }

        debug!(
            target: "sfu.actor.session",
            peer_id = %self.peer_id,
            consumer_id = %consumer_id,
            "Consumer resumed"
        );

        Ok(())
    }

    fn state(&self) -> SessionState {
        let mut consumers: Vec<ConsumerSummary> = self
            .consumers
            .values()
            .map(|c| ConsumerSummary {
                consumer_id: c.result.id,
                source: c.source.clone(),
                paused: c.result.producer_paused,
            })
            .collect();
        consumers.sort_by(|a, b| a.source.cmp(&b.source));

        SessionState {
            peer_id: self.peer_id,
            transport_id: self.transport.as_ref().map(|t| t.id),
            transport_connected: self.transport.as_ref().is_some_and(|t| t.connected),
            consumers,
        }
    }

    /// Run an engine call in its own task, abandoning it if the session is
    /// cancelled first.
    async fn engine_call<T, F>(&self, operation: &'static str, call: F) -> Result<T, SfuError>
    where
        T: Send + 'static,
        F: Future<Output = Result<T, EngineError>> + Send + 'static,
    {
        let started = Instant::now();
        let mut task = tokio::spawn(call);

        let joined = tokio::select! {
            () = self.cancel_token.cancelled() => return Err(SfuError::SessionClosed),
            joined = &mut task => joined,
        };
        observability::record_engine_call(operation, started.elapsed());

        joined
            .map_err(|e| SfuError::Internal(format!("engine task failed: {e}")))?
            .map_err(map_engine_error)
    }

    async fn notify_manager(&self, message: SessionManagerMessage) {
        let Some(manager) = self.manager.upgrade() else {
            return;
        };
        if manager.send(message).await.is_err() {
            warn!(
                target: "sfu.actor.session",
                peer_id = %self.peer_id,
                "Session manager gone, consumer index not updated"
            );
        }
    }

    async fn teardown(&mut self) {
        if let Some(transport) = self.transport.take() {
            self.ctx.engine.close_transport(transport.id).await;
        }

        debug!(
            target: "sfu.actor.session",
            peer_id = %self.peer_id,
            consumers = self.consumers.len(),
            "Session resources released"
        );
        self.consumers.clear();
    }
}

fn map_engine_error(error: EngineError) -> SfuError {
    match error {
        EngineError::ResourceExhausted(reason) => SfuError::EngineAllocation(reason),
        EngineError::UnknownTransport(id) => SfuError::TransportNotFound(id),
        EngineError::UnknownConsumer(id) => SfuError::ConsumerNotFound(id),
        EngineError::AlreadyConnected(id) => SfuError::TransportAlreadyConnected(id),
        other @ (EngineError::UnknownProducer(_) | EngineError::Rejected(_)) => {
            SfuError::Engine(other)
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]
mod tests {
    use super::*;
    use crate::actors::registry::IngestConfig;
    use crate::engine::{DtlsFingerprint, DtlsRole, LocalEngine};
    use crate::ingest::{EncoderCommand, EncoderLauncher, EncoderProcess, StderrStream};
    use async_trait::async_trait;
    use std::io;

    struct IdleLauncher;

    struct IdleProcess;

    #[async_trait]
    impl EncoderProcess for IdleProcess {
        fn id(&self) -> Option<u32> {
            None
        }

        fn take_stderr(&mut self) -> Option<StderrStream> {
            None
        }

        async fn wait(&mut self) -> io::Result<Option<i32>> {
            std::future::pending().await
        }

        async fn kill(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl EncoderLauncher for IdleLauncher {
        fn launch(&self, _command: &EncoderCommand) -> io::Result<Box<dyn EncoderProcess>> {
            Ok(Box::new(IdleProcess))
        }
    }

    struct Fixture {
        engine: Arc<LocalEngine>,
        registry: SourceRegistryHandle,
        session: ViewerSessionHandle,
        task: JoinHandle<()>,
        _manager_rx: mpsc::Receiver<SessionManagerMessage>,
        manager_tx: mpsc::Sender<SessionManagerMessage>,
    }

    async fn fixture() -> Fixture {
        let engine = Arc::new(LocalEngine::default());
        let metrics = ActorMetrics::new();
        let (registry, _) = SourceRegistryHandle::spawn(
            "sfu-test".to_string(),
            Arc::clone(&engine) as Arc<dyn MediaEngine>,
            Arc::new(IdleLauncher),
            IngestConfig::default(),
            CancellationToken::new(),
            Arc::clone(&metrics),
        );
        registry
            .create_source("cam1".to_string(), "rtmp://host/live".to_string())
            .await
            .unwrap();

        let (manager_tx, manager_rx) = mpsc::channel(16);
        let ctx = SessionContext {
            engine: Arc::clone(&engine) as Arc<dyn MediaEngine>,
            capabilities: CapabilityRegistry::new(Arc::clone(&engine) as Arc<dyn MediaEngine>),
            registry: registry.clone(),
            metrics,
        };
        let (session, task) = ViewerSessionActor::spawn(
            PeerId::new(),
            ctx,
            manager_tx.downgrade(),
            CancellationToken::new(),
        );

        Fixture {
            engine,
            registry,
            session,
            task,
            _manager_rx: manager_rx,
            manager_tx,
        }
    }

    fn dtls() -> DtlsParameters {
        DtlsParameters {
            role: DtlsRole::Client,
            fingerprints: vec![DtlsFingerprint {
                algorithm: "sha-256".to_string(),
                value: "AB:CD".to_string(),
            }],
        }
    }

    fn browser_caps(engine: &LocalEngine) -> RtpCapabilities {
        engine.rtp_capabilities()
    }

    #[tokio::test]
    async fn test_consume_requires_connected_transport() {
        let f = fixture().await;
        let params = f.session.create_transport().await.unwrap();

        let result = f
            .session
            .consume("cam1".to_string(), params.id, browser_caps(&f.engine))
            .await;
        assert_eq!(result, Err(SfuError::TransportNotConnected(params.id)));
        assert_eq!(result.unwrap_err().error_code(), "PRECONDITION_FAILED");

        let stranger = TransportId::new();
        let result = f
            .session
            .consume("cam1".to_string(), stranger, browser_caps(&f.engine))
            .await;
        assert_eq!(result, Err(SfuError::TransportNotFound(stranger)));
        assert_eq!(result.unwrap_err().error_code(), "NOT_FOUND");

        f.session.connect_transport(params.id, dtls()).await.unwrap();
        let result = f
            .session
            .consume("cam1".to_string(), params.id, browser_caps(&f.engine))
            .await
            .unwrap();
        assert!(result.producer_paused);
        assert_eq!(result.kind, MediaKind::Video);
        assert_eq!(f.engine.consumer_paused(result.id), Some(true));
    }

    #[tokio::test]
    async fn test_consume_unknown_source_is_checked_first() {
        let f = fixture().await;
        let result = f
            .session
            .consume(
                "doesNotExist".to_string(),
                TransportId::new(),
                browser_caps(&f.engine),
            )
            .await;
        assert_eq!(
            result,
            Err(SfuError::SourceNotFound("doesNotExist".to_string()))
        );
    }

    #[tokio::test]
    async fn test_connect_twice_fails() {
        let f = fixture().await;
        let params = f.session.create_transport().await.unwrap();

        f.session.connect_transport(params.id, dtls()).await.unwrap();
        let again = f.session.connect_transport(params.id, dtls()).await;
        assert_eq!(again, Err(SfuError::TransportAlreadyConnected(params.id)));

        let stranger = TransportId::new();
        let unknown = f.session.connect_transport(stranger, dtls()).await;
        assert_eq!(unknown, Err(SfuError::TransportNotFound(stranger)));
    }

    #[tokio::test]
    async fn test_repeat_consume_returns_same_consumer() {
        let f = fixture().await;
        let params = f.session.create_transport().await.unwrap();
        f.session.connect_transport(params.id, dtls()).await.unwrap();

        let first = f
            .session
            .consume("cam1".to_string(), params.id, browser_caps(&f.engine))
            .await
            .unwrap();
        let second = f
            .session
            .consume("cam1".to_string(), params.id, browser_caps(&f.engine))
            .await
            .unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(f.engine.consumer_count(), 1);
    }

    #[tokio::test]
    async fn test_incompatible_capabilities() {
        let f = fixture().await;
        let params = f.session.create_transport().await.unwrap();
        f.session.connect_transport(params.id, dtls()).await.unwrap();

        let result = f
            .session
            .consume("cam1".to_string(), params.id, RtpCapabilities::default())
            .await;
        assert_eq!(
            result,
            Err(SfuError::IncompatibleCapabilities("cam1".to_string()))
        );
        assert_eq!(f.engine.consumer_count(), 0);
    }

    #[tokio::test]
    async fn test_resume_is_idempotent() {
        let f = fixture().await;
        let params = f.session.create_transport().await.unwrap();
        f.session.connect_transport(params.id, dtls()).await.unwrap();
        let consumer = f
            .session
            .consume("cam1".to_string(), params.id, browser_caps(&f.engine))
            .await
            .unwrap();

        f.session.resume(consumer.id).await.unwrap();
        f.session.resume(consumer.id).await.unwrap();
        assert_eq!(f.engine.consumer_paused(consumer.id), Some(false));

        let state = f.session.get_state().await.unwrap();
        assert!(!state.consumers[0].paused);

        let missing = ConsumerId::new();
        assert_eq!(
            f.session.resume(missing).await,
            Err(SfuError::ConsumerNotFound(missing))
        );
    }

    #[tokio::test]
    async fn test_new_transport_replaces_previous() {
        let f = fixture().await;
        let first = f.session.create_transport().await.unwrap();
        f.session.connect_transport(first.id, dtls()).await.unwrap();
        f.session
            .consume("cam1".to_string(), first.id, browser_caps(&f.engine))
            .await
            .unwrap();

        let second = f.session.create_transport().await.unwrap();
        assert!(!f.engine.is_transport_open(first.id));
        assert!(f.engine.is_transport_open(second.id));
        assert_eq!(f.engine.consumer_count(), 0);

        let state = f.session.get_state().await.unwrap();
        assert_eq!(state.transport_id, Some(second.id));
        assert!(!state.transport_connected);
        assert!(state.consumers.is_empty());
    }

    #[tokio::test]
    async fn test_cancel_closes_transport() {
        let f = fixture().await;
        let params = f.session.create_transport().await.unwrap();
        f.session.connect_transport(params.id, dtls()).await.unwrap();
        f.session
            .consume("cam1".to_string(), params.id, browser_caps(&f.engine))
            .await
            .unwrap();

        f.session.cancel();
        f.task.await.unwrap();

        assert!(!f.engine.is_transport_open(params.id));
        assert_eq!(f.engine.consumer_count(), 0);
        // Receiver endpoint of the source is untouched
        assert_eq!(f.engine.producer_count(), 1);

        assert_eq!(
            f.session.get_state().await,
            Err(SfuError::SessionClosed)
        );
        drop(f.manager_tx);
        f.registry.cancel();
    }
}
