//! `SourceRegistryActor` - owns every named source and its ingestion pipeline.
//!
//! The actor's mailbox is the registry-scoped mutual exclusion: the
//! "already registered?" check and the insertion of the `Pending` entry
//! happen in one message, so two peers creating the same name can never
//! produce two pipelines.
//!
//! Pipeline lifecycle:
//!
//! ```text
//! Pending --allocated--> Running --exit--> Exited | Crashed
//!    |                      ^                  |
//!    +--alloc failed--> (removed)              +--restart policy--+
//! ```
//!
//! Engine allocation runs in a spawned task so the mailbox stays responsive;
//! its result comes back as a [`PipelineEvent`]. Encoders are supervised by
//! [`supervise`] and report exits the same way.

use crate::capabilities::CapabilityRegistry;
use crate::config::Config;
use crate::engine::{
    MediaEngine, MediaKind, PlainTransportOptions, RtcpParameters, RtpCodecParameters,
    RtpEncodingParameters, RtpParameters,
};
use crate::errors::SfuError;
use crate::ingest::{
    supervise, EncoderCommand, EncoderLauncher, ExitOutcome, RestartPolicy, RtpTarget,
    ENCODER_CLOCK_RATE, ENCODER_MIME_TYPE, ENCODER_PAYLOAD_TYPE,
};
use crate::observability;

use super::messages::{
    AllocatedPipeline, PipelineEvent, PipelineState, RegistryMessage, SourceInfo, StreamHandle,
};
use super::metrics::{ActorMetrics, ActorType, MailboxMonitor};

use rand::Rng;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Default channel buffer size for the registry mailbox.
const REGISTRY_CHANNEL_BUFFER: usize = 256;

/// Synchronization ids are drawn from `[0, SSRC_SPACE)`.
pub const SSRC_SPACE: u32 = 10_000;

/// Ingestion settings shared by every pipeline.
#[derive(Debug, Clone)]
pub struct IngestConfig {
    pub plain_listen_ip: String,
    pub encoder_target_host: String,
    pub ffmpeg_path: String,
    pub restart_policy: RestartPolicy,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            plain_listen_ip: "0.0.0.0".to_string(),
            encoder_target_host: "127.0.0.1".to_string(),
            ffmpeg_path: "ffmpeg".to_string(),
            restart_policy: RestartPolicy::Never,
        }
    }
}

impl From<&Config> for IngestConfig {
    fn from(config: &Config) -> Self {
        Self {
            plain_listen_ip: config.plain_listen_ip.clone(),
            encoder_target_host: config.encoder_target_host.clone(),
            ffmpeg_path: config.ffmpeg_path.clone(),
            restart_policy: config.restart_policy,
        }
    }
}

/// Handle to the `SourceRegistryActor`.
#[derive(Debug, Clone)]
pub struct SourceRegistryHandle {
    sender: mpsc::Sender<RegistryMessage>,
    cancel_token: CancellationToken,
}

impl SourceRegistryHandle {
    /// Spawn the registry actor.
    ///
    /// Cancelling `cancel_token` kills every encoder and closes every
    /// receiver endpoint.
    #[must_use]
    pub fn spawn(
        instance_id: String,
        engine: Arc<dyn MediaEngine>,
        launcher: Arc<dyn EncoderLauncher>,
        config: IngestConfig,
        cancel_token: CancellationToken,
        metrics: Arc<ActorMetrics>,
    ) -> (Self, JoinHandle<()>) {
        let (sender, receiver) = mpsc::channel(REGISTRY_CHANNEL_BUFFER);
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let actor = SourceRegistryActor {
            mailbox: MailboxMonitor::new(ActorType::Registry, &instance_id),
            instance_id,
            receiver,
            events_tx,
            events_rx,
            cancel_token: cancel_token.clone(),
            capabilities: CapabilityRegistry::new(Arc::clone(&engine)),
            engine,
            launcher,
            config,
            sources: HashMap::new(),
            metrics,
        };

        let task_handle = tokio::spawn(actor.run());

        (
            Self {
                sender,
                cancel_token,
            },
            task_handle,
        )
    }

    /// Register `name` and start its pipeline.
    ///
    /// Returns `Ok(true)` for the call that created the source and
    /// `Ok(false)` when it already existed (or was being created).
    pub async fn create_source(
        &self,
        name: String,
        origin_url: String,
    ) -> Result<bool, SfuError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(RegistryMessage::CreateSource {
                name,
                origin_url,
                respond_to: tx,
            })
            .await
            .map_err(|e| SfuError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| SfuError::Internal(format!("response receive failed: {e}")))?
    }

    /// Resolve the published stream of a ready source.
    pub async fn lookup_stream(&self, name: String) -> Result<StreamHandle, SfuError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(RegistryMessage::LookupStream {
                name,
                respond_to: tx,
            })
            .await
            .map_err(|e| SfuError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| SfuError::Internal(format!("response receive failed: {e}")))?
    }

    pub async fn get_source(&self, name: String) -> Result<SourceInfo, SfuError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(RegistryMessage::GetSource {
                name,
                respond_to: tx,
            })
            .await
            .map_err(|e| SfuError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| SfuError::Internal(format!("response receive failed: {e}")))?
    }

    /// All sources, sorted by name.
    pub async fn list_sources(&self) -> Result<Vec<SourceInfo>, SfuError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(RegistryMessage::ListSources { respond_to: tx })
            .await
            .map_err(|e| SfuError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| SfuError::Internal(format!("response receive failed: {e}")))
    }

    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }
}

/// Callers waiting on a pipeline that is still being allocated.
struct PendingSource {
    origin_url: String,
    ssrc: u32,
    creator: oneshot::Sender<Result<bool, SfuError>>,
    followers: Vec<oneshot::Sender<Result<bool, SfuError>>>,
}

struct Pipeline {
    origin_url: String,
    ssrc: u32,
    alloc: AllocatedPipeline,
    state: PipelineState,
    /// Incremented on every encoder spawn; stale exit events are ignored.
    attempt: u32,
    restarts: u32,
    encoder_token: Option<CancellationToken>,
    created_at: i64,
}

enum SourceEntry {
    Pending(PendingSource),
    Ready(Pipeline),
}

impl SourceEntry {
    fn ssrc(&self) -> u32 {
        match self {
            SourceEntry::Pending(p) => p.ssrc,
            SourceEntry::Ready(p) => p.ssrc,
        }
    }
}

/// The `SourceRegistryActor` implementation.
pub struct SourceRegistryActor {
    instance_id: String,
    receiver: mpsc::Receiver<RegistryMessage>,
    events_tx: mpsc::UnboundedSender<PipelineEvent>,
    events_rx: mpsc::UnboundedReceiver<PipelineEvent>,
    cancel_token: CancellationToken,
    engine: Arc<dyn MediaEngine>,
    capabilities: CapabilityRegistry,
    launcher: Arc<dyn EncoderLauncher>,
    config: IngestConfig,
    sources: HashMap<String, SourceEntry>,
    metrics: Arc<ActorMetrics>,
    mailbox: MailboxMonitor,
}

impl SourceRegistryActor {
    #[instrument(skip_all, name = "sfu.actor.registry", fields(instance_id = %self.instance_id))]
    async fn run(mut self) {
        info!(
            target: "sfu.actor.registry",
            instance_id = %self.instance_id,
            "SourceRegistryActor started"
        );

        loop {
            tokio::select! {
                () = self.cancel_token.cancelled() => {
                    info!(
                        target: "sfu.actor.registry",
                        instance_id = %self.instance_id,
                        "SourceRegistryActor received cancellation signal"
                    );
                    self.graceful_shutdown().await;
                    break;
                }

                msg = self.receiver.recv() => {
                    match msg {
                        Some(message) => {
                            self.mailbox.record_enqueue();
                            self.handle_message(message);
                            self.mailbox.record_dequeue();
                            self.metrics.record_message_processed();
                        }
                        None => {
                            info!(
                                target: "sfu.actor.registry",
                                instance_id = %self.instance_id,
                                "SourceRegistryActor channel closed, exiting"
                            );
                            self.graceful_shutdown().await;
                            break;
                        }
                    }
                }

                Some(event) = self.events_rx.recv() => {
                    self.handle_event(event).await;
                }
            }
        }

        info!(
            target: "sfu.actor.registry",
            instance_id = %self.instance_id,
            messages_processed = self.mailbox.messages_processed(),
            "SourceRegistryActor stopped"
        );
    }

    fn handle_message(&mut self, message: RegistryMessage) {
        match message {
            RegistryMessage::CreateSource {
                name,
                origin_url,
                respond_to,
            } => {
                self.create_source(name, origin_url, respond_to);
            }

            RegistryMessage::LookupStream { name, respond_to } => {
                let result = self.lookup_stream(&name);
                let _ = respond_to.send(result);
            }

            RegistryMessage::GetSource { name, respond_to } => {
                let result = self
                    .source_info(&name)
                    .ok_or(SfuError::SourceNotFound(name));
                let _ = respond_to.send(result);
            }

            RegistryMessage::ListSources { respond_to } => {
                let mut names: Vec<&String> = self.sources.keys().collect();
                names.sort();
                let infos = names
                    .into_iter()
                    .filter_map(|name| self.source_info(name))
                    .collect();
                let _ = respond_to.send(infos);
            }
        }
    }

    fn create_source(
        &mut self,
        name: String,
        origin_url: String,
        respond_to: oneshot::Sender<Result<bool, SfuError>>,
    ) {
        if name.trim().is_empty() {
            let _ = respond_to.send(Err(SfuError::BadRequest(
                "source name must not be empty".to_string(),
            )));
            return;
        }
        if origin_url.trim().is_empty() {
            let _ = respond_to.send(Err(SfuError::BadRequest(
                "originUrl must not be empty".to_string(),
            )));
            return;
        }

        match self.sources.get_mut(&name) {
            Some(SourceEntry::Ready(_)) => {
                debug!(
                    target: "sfu.actor.registry",
                    source = %name,
                    "Source already registered"
                );
                let _ = respond_to.send(Ok(false));
                return;
            }
            Some(SourceEntry::Pending(pending)) => {
                debug!(
                    target: "sfu.actor.registry",
                    source = %name,
                    "Source allocation in progress, waiting for outcome"
                );
                pending.followers.push(respond_to);
                return;
            }
            None => {}
        }

        let ssrc = match self.draw_ssrc() {
            Ok(ssrc) => ssrc,
            Err(e) => {
                let _ = respond_to.send(Err(e));
                return;
            }
        };

        debug!(
            target: "sfu.actor.registry",
            source = %name,
            ssrc,
            "Allocating ingestion pipeline"
        );

        self.sources.insert(
            name.clone(),
            SourceEntry::Pending(PendingSource {
                origin_url,
                ssrc,
                creator: respond_to,
                followers: Vec::new(),
            }),
        );

        let engine = Arc::clone(&self.engine);
        let capabilities = self.capabilities.clone();
        let listen_ip = self.config.plain_listen_ip.clone();
        let events = self.events_tx.clone();
        tokio::spawn(async move {
            let result = allocate_pipeline(engine.as_ref(), &capabilities, listen_ip, ssrc).await;
            let event = PipelineEvent::Allocated { name, result };
            if let Err(mpsc::error::SendError(PipelineEvent::Allocated {
                result: Ok(alloc),
                ..
            })) = events.send(event)
            {
                // Registry already gone; nobody owns this endpoint.
                engine.close_transport(alloc.transport_id).await;
            }
        });
    }

    fn draw_ssrc(&self) -> Result<u32, SfuError> {
        let used: HashSet<u32> = self.sources.values().map(SourceEntry::ssrc).collect();
        if used.len() >= SSRC_SPACE as usize {
            return Err(SfuError::EngineAllocation(
                "synchronization id space exhausted".to_string(),
            ));
        }

        let mut rng = rand::thread_rng();
        loop {
            let candidate = rng.gen_range(0..SSRC_SPACE);
            if !used.contains(&candidate) {
                return Ok(candidate);
            }
        }
    }

    fn lookup_stream(&self, name: &str) -> Result<StreamHandle, SfuError> {
        match self.sources.get(name) {
            Some(SourceEntry::Ready(pipeline)) => Ok(StreamHandle {
                source: name.to_string(),
                producer_id: pipeline.alloc.producer_id,
                kind: MediaKind::Video,
            }),
            Some(SourceEntry::Pending(_)) | None => Err(SfuError::SourceNotFound(name.to_string())),
        }
    }

    fn source_info(&self, name: &str) -> Option<SourceInfo> {
        self.sources.get(name).map(|entry| match entry {
            SourceEntry::Pending(pending) => SourceInfo {
                name: name.to_string(),
                origin_url: pending.origin_url.clone(),
                state: PipelineState::Pending,
                ssrc: pending.ssrc,
                rtp_port: None,
                rtcp_port: None,
                producer_id: None,
                restarts: 0,
                created_at: 0,
            },
            SourceEntry::Ready(pipeline) => SourceInfo {
                name: name.to_string(),
                origin_url: pipeline.origin_url.clone(),
                state: pipeline.state.clone(),
                ssrc: pipeline.ssrc,
                rtp_port: Some(pipeline.alloc.rtp_port),
                rtcp_port: pipeline.alloc.rtcp_port,
                producer_id: Some(pipeline.alloc.producer_id),
                restarts: pipeline.restarts,
                created_at: pipeline.created_at,
            },
        })
    }

    async fn handle_event(&mut self, event: PipelineEvent) {
        match event {
            PipelineEvent::Allocated { name, result } => {
                self.on_allocated(name, result).await;
            }
            PipelineEvent::EncoderExited {
                name,
                attempt,
                outcome,
            } => {
                self.on_encoder_exited(&name, attempt, outcome);
            }
            PipelineEvent::RestartDue { name, attempt } => {
                self.on_restart_due(&name, attempt);
            }
        }
    }

    async fn on_allocated(&mut self, name: String, result: Result<AllocatedPipeline, SfuError>) {
        let pending = match self.sources.remove(&name) {
            Some(SourceEntry::Pending(pending)) => pending,
            Some(ready @ SourceEntry::Ready(_)) => {
                self.sources.insert(name, ready);
                if let Ok(alloc) = result {
                    self.engine.close_transport(alloc.transport_id).await;
                }
                return;
            }
            None => {
                if let Ok(alloc) = result {
                    self.engine.close_transport(alloc.transport_id).await;
                }
                return;
            }
        };

        let alloc = match result {
            Ok(alloc) => alloc,
            Err(e) => {
                warn!(
                    target: "sfu.actor.registry",
                    source = %name,
                    error = %e,
                    waiters = pending.followers.len() + 1,
                    "Pipeline allocation failed, source rolled back"
                );
                let _ = pending.creator.send(Err(e.clone()));
                for follower in pending.followers {
                    let _ = follower.send(Err(e.clone()));
                }
                return;
            }
        };

        self.sources.insert(
            name.clone(),
            SourceEntry::Ready(Pipeline {
                origin_url: pending.origin_url,
                ssrc: pending.ssrc,
                alloc,
                state: PipelineState::Pending,
                attempt: 0,
                restarts: 0,
                encoder_token: None,
                created_at: chrono::Utc::now().timestamp(),
            }),
        );
        self.metrics.source_registered();

        info!(
            target: "sfu.actor.registry",
            source = %name,
            ssrc = pending.ssrc,
            total_sources = self.sources.len(),
            "Source registered"
        );

        self.start_encoder(&name);

        let _ = pending.creator.send(Ok(true));
        for follower in pending.followers {
            let _ = follower.send(Ok(false));
        }
    }

    /// Spawn the encoder for a ready pipeline and its supervisor task.
    fn start_encoder(&mut self, name: &str) {
        let Some(SourceEntry::Ready(pipeline)) = self.sources.get_mut(name) else {
            return;
        };

        let command = EncoderCommand::ffmpeg(
            &self.config.ffmpeg_path,
            &pipeline.origin_url,
            pipeline.ssrc,
            ENCODER_PAYLOAD_TYPE,
            &RtpTarget {
                host: self.config.encoder_target_host.clone(),
                rtp_port: pipeline.alloc.rtp_port,
                rtcp_port: pipeline.alloc.rtcp_port,
            },
        );
        let attempt = pipeline.attempt;

        match self.launcher.launch(&command) {
            Ok(process) => {
                let pid = process.id();
                let token = self.cancel_token.child_token();
                pipeline.state = PipelineState::Running { pid };
                pipeline.encoder_token = Some(token.clone());

                info!(
                    target: "sfu.actor.registry",
                    source = %name,
                    pid = ?pid,
                    attempt,
                    "Encoder spawned"
                );

                let events = self.events_tx.clone();
                let source = name.to_string();
                tokio::spawn(async move {
                    if let Some(outcome) = supervise(source.clone(), process, token).await {
                        let _ = events.send(PipelineEvent::EncoderExited {
                            name: source,
                            attempt,
                            outcome,
                        });
                    }
                });
            }
            Err(e) => {
                error!(
                    target: "sfu.actor.registry",
                    source = %name,
                    program = %command.program,
                    error = %e,
                    "Failed to spawn encoder"
                );
                let _ = self.events_tx.send(PipelineEvent::EncoderExited {
                    name: name.to_string(),
                    attempt,
                    outcome: ExitOutcome::Crashed {
                        code: None,
                        reason: format!("spawn failed: {e}"),
                    },
                });
            }
        }
    }

    fn on_encoder_exited(&mut self, name: &str, attempt: u32, outcome: ExitOutcome) {
        let Some(SourceEntry::Ready(pipeline)) = self.sources.get_mut(name) else {
            return;
        };
        if pipeline.attempt != attempt {
            debug!(
                target: "sfu.actor.registry",
                source = %name,
                attempt,
                current_attempt = pipeline.attempt,
                "Ignoring exit of a superseded encoder"
            );
            return;
        }

        observability::record_encoder_exit(outcome.as_str());
        pipeline.encoder_token = None;
        pipeline.state = match &outcome {
            ExitOutcome::Exited => PipelineState::Exited,
            ExitOutcome::Crashed { reason, .. } => PipelineState::Crashed {
                reason: reason.clone(),
            },
        };

        warn!(
            target: "sfu.actor.registry",
            source = %name,
            outcome = outcome.as_str(),
            restarts = pipeline.restarts,
            "Encoder terminated"
        );

        let policy = self.config.restart_policy;
        match policy.next_delay(pipeline.restarts) {
            Some(delay) => {
                info!(
                    target: "sfu.actor.registry",
                    source = %name,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    "Scheduling encoder restart"
                );
                let events = self.events_tx.clone();
                let token = self.cancel_token.child_token();
                let name = name.to_string();
                tokio::spawn(async move {
                    tokio::select! {
                        () = token.cancelled() => {}
                        () = tokio::time::sleep(delay) => {
                            let _ = events.send(PipelineEvent::RestartDue { name, attempt });
                        }
                    }
                });
            }
            None if policy == RestartPolicy::Never => {
                info!(
                    target: "sfu.actor.registry",
                    source = %name,
                    "Encoder not restarted (restart policy: never)"
                );
            }
            None => {
                warn!(
                    target: "sfu.actor.registry",
                    source = %name,
                    restarts = pipeline.restarts,
                    "Encoder restart budget exhausted"
                );
            }
        }
    }

    fn on_restart_due(&mut self, name: &str, attempt: u32) {
        let Some(SourceEntry::Ready(pipeline)) = self.sources.get_mut(name) else {
            return;
        };
        if pipeline.attempt != attempt || matches!(pipeline.state, PipelineState::Running { .. })
        {
            return;
        }

        pipeline.attempt += 1;
        pipeline.restarts += 1;
        observability::record_encoder_restart();

        info!(
            target: "sfu.actor.registry",
            source = %name,
            restarts = pipeline.restarts,
            "Restarting encoder"
        );
        self.start_encoder(name);
    }

    async fn graceful_shutdown(&mut self) {
        info!(
            target: "sfu.actor.registry",
            instance_id = %self.instance_id,
            source_count = self.sources.len(),
            "Stopping ingestion pipelines"
        );

        for (name, entry) in self.sources.drain() {
            match entry {
                SourceEntry::Pending(pending) => {
                    let _ = pending.creator.send(Err(SfuError::Draining));
                    for follower in pending.followers {
                        let _ = follower.send(Err(SfuError::Draining));
                    }
                }
                SourceEntry::Ready(pipeline) => {
                    if let Some(token) = pipeline.encoder_token {
                        token.cancel();
                    }
                    self.engine.close_transport(pipeline.alloc.transport_id).await;
                    self.metrics.source_removed();
                    debug!(
                        target: "sfu.actor.registry",
                        source = %name,
                        "Pipeline stopped"
                    );
                }
            }
        }
    }
}

/// Allocate the receiver endpoint and publish the stream on it.
///
/// Nothing is allocated when the router cannot take the encoder's codec.
/// A transport allocated before a failed publish is closed again.
async fn allocate_pipeline(
    engine: &dyn MediaEngine,
    capabilities: &CapabilityRegistry,
    listen_ip: String,
    ssrc: u32,
) -> Result<AllocatedPipeline, SfuError> {
    let rtp_parameters = RtpParameters {
        mid: None,
        codecs: vec![RtpCodecParameters {
            mime_type: ENCODER_MIME_TYPE.to_string(),
            payload_type: ENCODER_PAYLOAD_TYPE,
            clock_rate: ENCODER_CLOCK_RATE,
            parameters: serde_json::Map::new(),
            rtcp_feedback: Vec::new(),
        }],
        encodings: vec![RtpEncodingParameters { ssrc: Some(ssrc) }],
        rtcp: RtcpParameters {
            cname: None,
            reduced_size: true,
        },
    };
    if !capabilities.supports(&rtp_parameters) {
        return Err(SfuError::EngineAllocation(format!(
            "router does not accept {ENCODER_MIME_TYPE}/{ENCODER_CLOCK_RATE}"
        )));
    }

    let started = Instant::now();
    let transport = engine
        .create_plain_transport(PlainTransportOptions {
            listen_ip,
            rtcp_mux: false,
            comedia: true,
        })
        .await
        .map_err(|e| SfuError::EngineAllocation(e.to_string()))?;
    observability::record_engine_call("create_plain_transport", started.elapsed());

    let started = Instant::now();
    let producer_id = match engine
        .produce(transport.id, MediaKind::Video, rtp_parameters)
        .await
    {
        Ok(producer_id) => producer_id,
        Err(e) => {
            engine.close_transport(transport.id).await;
            return Err(SfuError::EngineAllocation(e.to_string()));
        }
    };
    observability::record_engine_call("produce", started.elapsed());

    Ok(AllocatedPipeline {
        transport_id: transport.id,
        rtp_port: transport.rtp_port,
        rtcp_port: transport.rtcp_port,
        producer_id,
    })
}
