//! `SessionManagerActor` - owns every viewer session and the consumer index.
//!
//! Consumer ids are process-global, so `resume` is routed by looking the id
//! up here rather than trusting the calling peer. Sessions report consumers
//! they create or drop over a weak back-channel.

use super::messages::{SessionManagerMessage, SessionManagerStatus};
use super::metrics::{ActorMetrics, ActorType, MailboxMonitor};
use super::session::{SessionContext, ViewerSessionActor, ViewerSessionHandle};
use crate::errors::SfuError;

use common::types::{ConsumerId, PeerId};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

const SESSIONS_CHANNEL_BUFFER: usize = 1024;

/// How long a disconnect waits for the session to release its resources.
const SESSION_TEARDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// How long shutdown waits for all sessions.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// Handle to the `SessionManagerActor`.
#[derive(Debug, Clone)]
pub struct SessionManagerHandle {
    sender: mpsc::Sender<SessionManagerMessage>,
    cancel_token: CancellationToken,
}

impl SessionManagerHandle {
    /// Spawn the session manager.
    #[must_use]
    pub fn spawn(
        instance_id: String,
        ctx: SessionContext,
        cancel_token: CancellationToken,
    ) -> (Self, JoinHandle<()>) {
        let (sender, receiver) = mpsc::channel(SESSIONS_CHANNEL_BUFFER);

        let actor = SessionManagerActor {
            mailbox: MailboxMonitor::new(ActorType::SessionManager, &instance_id),
            instance_id,
            receiver,
            self_sender: sender.downgrade(),
            cancel_token: cancel_token.clone(),
            metrics: Arc::clone(&ctx.metrics),
            ctx,
            sessions: HashMap::new(),
            consumer_index: HashMap::new(),
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

    /// Open a session for a newly connected peer.
    pub async fn register_peer(&self, peer_id: PeerId) -> Result<ViewerSessionHandle, SfuError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(SessionManagerMessage::RegisterPeer {
                peer_id,
                respond_to: tx,
            })
            .await
            .map_err(|e| SfuError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| SfuError::Internal(format!("response receive failed: {e}")))?
    }

    /// Find the session that owns `consumer_id`.
    pub async fn resolve_consumer(
        &self,
        consumer_id: ConsumerId,
    ) -> Result<ViewerSessionHandle, SfuError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(SessionManagerMessage::ResolveConsumer {
                consumer_id,
                respond_to: tx,
            })
            .await
            .map_err(|e| SfuError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| SfuError::Internal(format!("response receive failed: {e}")))?
    }

    /// Tear down the peer's session. Returns once its resources are released.
    pub async fn disconnect(&self, peer_id: PeerId) -> Result<(), SfuError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(SessionManagerMessage::Disconnect {
                peer_id,
                respond_to: tx,
            })
            .await
            .map_err(|e| SfuError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| SfuError::Internal(format!("response receive failed: {e}")))
    }

    pub async fn get_status(&self) -> Result<SessionManagerStatus, SfuError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(SessionManagerMessage::GetStatus { respond_to: tx })
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

struct ManagedSession {
    handle: ViewerSessionHandle,
    task_handle: JoinHandle<()>,
}

/// The `SessionManagerActor` implementation.
pub struct SessionManagerActor {
    instance_id: String,
    receiver: mpsc::Receiver<SessionManagerMessage>,
    /// Handed to sessions; weak so the mailbox still closes with the last handle.
    self_sender: mpsc::WeakSender<SessionManagerMessage>,
    cancel_token: CancellationToken,
    ctx: SessionContext,
    sessions: HashMap<PeerId, ManagedSession>,
    consumer_index: HashMap<ConsumerId, PeerId>,
    metrics: Arc<ActorMetrics>,
    mailbox: MailboxMonitor,
}

impl SessionManagerActor {
    #[instrument(skip_all, name = "sfu.actor.sessions", fields(instance_id = %self.instance_id))]
    async fn run(mut self) {
        info!(
            target: "sfu.actor.sessions",
            instance_id = %self.instance_id,
            "SessionManagerActor started"
        );

        loop {
            tokio::select! {
                () = self.cancel_token.cancelled() => {
                    info!(
                        target: "sfu.actor.sessions",
                        instance_id = %self.instance_id,
                        "SessionManagerActor received cancellation signal"
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
                                target: "sfu.actor.sessions",
                                instance_id = %self.instance_id,
                                "SessionManagerActor channel closed, exiting"
                            );
                            self.graceful_shutdown().await;
                            break;
                        }
                    }
                }
            }
        }

        info!(
            target: "sfu.actor.sessions",
            instance_id = %self.instance_id,
            messages_processed = self.mailbox.messages_processed(),
            "SessionManagerActor stopped"
        );
    }

    fn handle_message(&mut self, message: SessionManagerMessage) {
        match message {
            SessionManagerMessage::RegisterPeer {
                peer_id,
                respond_to,
            } => {
                let result = self.register_peer(peer_id);
                let _ = respond_to.send(result);
            }

            SessionManagerMessage::ResolveConsumer {
                consumer_id,
                respond_to,
            } => {
                let result = self
                    .consumer_index
                    .get(&consumer_id)
                    .and_then(|peer_id| self.sessions.get(peer_id))
                    .map(|managed| managed.handle.clone())
                    .ok_or(SfuError::ConsumerNotFound(consumer_id));
                let _ = respond_to.send(result);
            }

            SessionManagerMessage::ConsumerCreated {
                peer_id,
                consumer_id,
            } => {
                if self.sessions.contains_key(&peer_id) {
                    self.consumer_index.insert(consumer_id, peer_id);
                }
            }

            SessionManagerMessage::ConsumersReleased {
                peer_id,
                consumer_ids,
            } => {
                for consumer_id in consumer_ids {
                    if self.consumer_index.get(&consumer_id) == Some(&peer_id) {
                        self.consumer_index.remove(&consumer_id);
                    }
                }
            }

            SessionManagerMessage::Disconnect {
                peer_id,
                respond_to,
            } => {
                self.disconnect(peer_id, respond_to);
            }

            SessionManagerMessage::GetStatus { respond_to } => {
                let _ = respond_to.send(SessionManagerStatus {
                    session_count: self.sessions.len(),
                    consumer_count: self.consumer_index.len(),
                    mailbox_depth: self.mailbox.current_depth(),
                });
            }
        }
    }

    fn register_peer(&mut self, peer_id: PeerId) -> Result<ViewerSessionHandle, SfuError> {
        if let Some(existing) = self.sessions.get(&peer_id) {
            return Ok(existing.handle.clone());
        }

        let (handle, task_handle) = ViewerSessionActor::spawn(
            peer_id,
            self.ctx.clone(),
            self.self_sender.clone(),
            self.cancel_token.child_token(),
        );

        self.sessions.insert(
            peer_id,
            ManagedSession {
                handle: handle.clone(),
                task_handle,
            },
        );
        self.metrics.session_opened();

        info!(
            target: "sfu.actor.sessions",
            peer_id = %peer_id,
            total_sessions = self.sessions.len(),
            "Viewer session opened"
        );

        Ok(handle)
    }

    fn disconnect(&mut self, peer_id: PeerId, respond_to: oneshot::Sender<()>) {
        let Some(managed) = self.sessions.remove(&peer_id) else {
            debug!(
                target: "sfu.actor.sessions",
                peer_id = %peer_id,
                "Disconnect for unknown peer, nothing to release"
            );
            let _ = respond_to.send(());
            return;
        };

        self.consumer_index.retain(|_, owner| *owner != peer_id);
        managed.handle.cancel();
        self.metrics.session_closed();

        info!(
            target: "sfu.actor.sessions",
            peer_id = %peer_id,
            total_sessions = self.sessions.len(),
            "Viewer session closed"
        );

        // Wait for teardown off the message loop
        let metrics = Arc::clone(&self.metrics);
        tokio::spawn(async move {
            match tokio::time::timeout(SESSION_TEARDOWN_TIMEOUT, managed.task_handle).await {
                Ok(Ok(())) => {
                    debug!(
                        target: "sfu.actor.sessions",
                        peer_id = %peer_id,
                        "Session task completed cleanly"
                    );
                }
                Ok(Err(e)) => {
                    if e.is_panic() {
                        metrics.record_panic(ActorType::Session);
                    }
                    warn!(
                        target: "sfu.actor.sessions",
                        peer_id = %peer_id,
                        error = ?e,
                        "Session task failed during teardown"
                    );
                }
                Err(_) => {
                    warn!(
                        target: "sfu.actor.sessions",
                        peer_id = %peer_id,
                        "Session teardown timed out"
                    );
                }
            }
            let _ = respond_to.send(());
        });
    }

    async fn graceful_shutdown(&mut self) {
        info!(
            target: "sfu.actor.sessions",
            instance_id = %self.instance_id,
            session_count = self.sessions.len(),
            "Closing viewer sessions"
        );

        for managed in self.sessions.values() {
            managed.handle.cancel();
        }

        for (peer_id, managed) in self.sessions.drain() {
            match tokio::time::timeout(SHUTDOWN_TIMEOUT, managed.task_handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!(
                        target: "sfu.actor.sessions",
                        peer_id = %peer_id,
                        error = ?e,
                        "Session task failed during shutdown"
                    );
                }
                Err(_) => {
                    warn!(
                        target: "sfu.actor.sessions",
                        peer_id = %peer_id,
                        "Session shutdown timed out"
                    );
                }
            }
            self.metrics.session_closed();
        }
        self.consumer_index.clear();
    }
}
