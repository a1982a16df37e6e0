//! WebSocket signaling server.
//!
//! One connection is one peer. Frames of a connection are handled strictly
//! one at a time; connections run on their own tasks. When the socket closes
//! (or fails) the peer's session is torn down.

use super::handler::{SignalingContext, SignalingHandler};
use super::protocol::ReplyFrame;
use crate::errors::SfuError;

use common::types::PeerId;
use futures_util::{SinkExt, StreamExt};
use std::io;
use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::{accept_async, tungstenite::Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Accept loop for signaling connections.
pub struct SignalingServer {
    listener: TcpListener,
    ctx: SignalingContext,
    cancel_token: CancellationToken,
}

impl SignalingServer {
    #[must_use]
    pub fn new(
        listener: TcpListener,
        ctx: SignalingContext,
        cancel_token: CancellationToken,
    ) -> Self {
        Self {
            listener,
            ctx,
            cancel_token,
        }
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept connections until cancelled.
    pub async fn run(self) {
        let local_addr = self.listener.local_addr().ok();
        info!(
            target: "sfu.signaling",
            addr = ?local_addr,
            "Signaling server accepting connections"
        );

        loop {
            tokio::select! {
                () = self.cancel_token.cancelled() => {
                    info!(target: "sfu.signaling", "Signaling server stopping");
                    break;
                }

                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, remote_addr)) => {
                            let ctx = self.ctx.clone();
                            let cancel = self.cancel_token.child_token();
                            tokio::spawn(handle_connection(stream, remote_addr, ctx, cancel));
                        }
                        Err(e) => {
                            error!(
                                target: "sfu.signaling",
                                error = %e,
                                "Failed to accept signaling connection"
                            );
                        }
                    }
                }
            }
        }
    }
}

#[instrument(skip_all, name = "sfu.signaling.connection", fields(remote_addr = %remote_addr))]
async fn handle_connection(
    stream: TcpStream,
    remote_addr: SocketAddr,
    ctx: SignalingContext,
    cancel: CancellationToken,
) {
    let ws_stream = match accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            debug!(
                target: "sfu.signaling",
                remote_addr = %remote_addr,
                error = %e,
                "WebSocket handshake failed"
            );
            return;
        }
    };

    let peer_id = PeerId::new();
    let session = match ctx.sessions.register_peer(peer_id).await {
        Ok(session) => session,
        Err(e) => {
            warn!(
                target: "sfu.signaling",
                remote_addr = %remote_addr,
                error = %e,
                "Could not open viewer session"
            );
            return;
        }
    };

    info!(
        target: "sfu.signaling",
        peer_id = %peer_id,
        remote_addr = %remote_addr,
        "Peer connected"
    );

    let sessions = ctx.sessions.clone();
    let handler = SignalingHandler::new(session, ctx);
    let (mut ws_tx, mut ws_rx) = ws_stream.split();

    loop {
        tokio::select! {
            () = cancel.cancelled() => {
                let _ = ws_tx.send(Message::Close(None)).await;
                break;
            }

            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        let reply = handler.handle_text(&text).await;
                        if let Err(e) = ws_tx.send(Message::Text(reply.to_text())).await {
                            debug!(
                                target: "sfu.signaling",
                                peer_id = %peer_id,
                                error = %e,
                                "Failed to send reply"
                            );
                            break;
                        }
                    }
                    Some(Ok(Message::Binary(_))) => {
                        let reply = ReplyFrame::failure(
                            None,
                            &SfuError::BadRequest("binary frames are not supported".to_string()),
                        );
                        if ws_tx.send(Message::Text(reply.to_text())).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        let _ = ws_tx.send(Message::Pong(data)).await;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        debug!(
                            target: "sfu.signaling",
                            peer_id = %peer_id,
                            error = %e,
                            "WebSocket read failed"
                        );
                        break;
                    }
                }
            }
        }
    }

    if let Err(e) = sessions.disconnect(peer_id).await {
        warn!(
            target: "sfu.signaling",
            peer_id = %peer_id,
            error = %e,
            "Disconnect failed"
        );
    }

    info!(
        target: "sfu.signaling",
        peer_id = %peer_id,
        "Peer disconnected"
    );
}
