//! End-to-end tests over a real WebSocket connection.
//!
//! Starts `SignalingServer` on an ephemeral port and talks to it with a
//! tokio-tungstenite client.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]

use std::net::SocketAddr;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use sfu_service::signaling::SignalingServer;
use sfu_test_utils::{dtls_parameters, h264_capabilities, TestSfu, TestSource};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn start_server(sfu: &TestSfu) -> (SocketAddr, CancellationToken, JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let token = CancellationToken::new();
    let server = SignalingServer::new(listener, sfu.signaling_context(), token.clone());
    let addr = server.local_addr().unwrap();
    let task = tokio::spawn(server.run());
    (addr, token, task)
}

async fn connect(addr: SocketAddr) -> Client {
    let (ws, _) = connect_async(format!("ws://{addr}")).await.unwrap();
    ws
}

/// Send a request and wait for its reply.
async fn request(ws: &mut Client, id: u64, method: &str, data: Value) -> Value {
    let text = json!({ "id": id, "method": method, "data": data }).to_string();
    ws.send(Message::Text(text)).await.unwrap();
    next_reply(ws).await
}

async fn next_reply(ws: &mut Client) -> Value {
    let message = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match ws.next().await.expect("connection closed").unwrap() {
                Message::Text(text) => return text,
                Message::Ping(_) | Message::Pong(_) => continue,
                other => panic!("unexpected message: {other:?}"),
            }
        }
    })
    .await
    .expect("no reply");
    serde_json::from_str(&message).unwrap()
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached");
}

#[tokio::test]
async fn test_full_viewer_flow_over_websocket() {
    let sfu = TestSfu::start();
    let (addr, token, task) = start_server(&sfu).await;
    let mut ws = connect(addr).await;

    let reply = request(
        &mut ws,
        1,
        "createSource",
        json!({ "name": "cam1", "originUrl": "rtmp://host/live" }),
    )
    .await;
    assert_eq!(reply["id"], 1);
    assert_eq!(reply["ok"], true);

    let reply = request(&mut ws, 2, "getRouterRtpCapabilities", Value::Null).await;
    assert_eq!(reply["ok"], true);
    assert!(reply["data"]["codecs"].is_array());

    let reply = request(&mut ws, 3, "createConsumerTransport", Value::Null).await;
    assert_eq!(reply["ok"], true);
    let transport = reply["data"].clone();
    assert!(transport["iceParameters"]["usernameFragment"].is_string());
    assert!(transport["iceCandidates"].is_array());
    assert!(transport["dtlsParameters"]["fingerprints"].is_array());

    let reply = request(
        &mut ws,
        4,
        "connectConsumerTransport",
        json!({ "transportId": transport["id"], "dtlsParameters": dtls_parameters() }),
    )
    .await;
    assert_eq!(reply["ok"], true);

    let reply = request(
        &mut ws,
        5,
        "consume",
        json!({
            "source": "cam1",
            "transportId": transport["id"],
            "rtpCapabilities": h264_capabilities(),
        }),
    )
    .await;
    assert_eq!(reply["ok"], true);
    assert_eq!(reply["data"]["producerPaused"], true);
    assert_eq!(reply["data"]["type"], "simple");

    let reply = request(
        &mut ws,
        6,
        "resume",
        json!({ "consumerId": reply["data"]["id"] }),
    )
    .await;
    assert_eq!(reply["ok"], true);

    ws.close(None).await.unwrap();
    token.cancel();
    task.await.unwrap();
    sfu.shutdown().await;
}

#[tokio::test]
async fn test_error_reply_shape() {
    let sfu = TestSfu::start();
    let (addr, token, task) = start_server(&sfu).await;
    let mut ws = connect(addr).await;

    let reply = request(&mut ws, 9, "produce", Value::Null).await;
    assert_eq!(reply["id"], 9);
    assert_eq!(reply["ok"], false);
    assert_eq!(reply["error"]["code"], "BAD_REQUEST");
    assert!(reply["error"]["message"].is_string());
    assert!(reply.get("data").is_none());

    ws.send(Message::Binary(vec![1, 2, 3])).await.unwrap();
    let reply = next_reply(&mut ws).await;
    assert_eq!(reply["ok"], false);
    assert_eq!(reply["error"]["code"], "BAD_REQUEST");

    token.cancel();
    task.await.unwrap();
    sfu.shutdown().await;
}

#[tokio::test]
async fn test_disconnect_releases_peer_resources() {
    let sfu = TestSfu::start();
    assert!(sfu.create_source(&TestSource::new("cam1")).await);
    let (addr, token, task) = start_server(&sfu).await;
    let mut ws = connect(addr).await;

    let reply = request(&mut ws, 1, "createConsumerTransport", Value::Null).await;
    let transport_id = reply["data"]["id"].clone();
    request(
        &mut ws,
        2,
        "connectConsumerTransport",
        json!({ "transportId": transport_id, "dtlsParameters": dtls_parameters() }),
    )
    .await;
    let reply = request(
        &mut ws,
        3,
        "consume",
        json!({
            "source": "cam1",
            "transportId": transport_id,
            "rtpCapabilities": h264_capabilities(),
        }),
    )
    .await;
    assert_eq!(reply["ok"], true);
    let consumer_id = reply["data"]["id"].clone();

    // Ingest endpoint plus the peer transport.
    assert_eq!(sfu.engine.inner().transport_count(), 2);
    assert_eq!(sfu.engine.inner().consumer_count(), 1);
    assert_eq!(sfu.sessions.get_status().await.unwrap().session_count, 1);

    drop(ws);

    let engine = std::sync::Arc::clone(&sfu.engine);
    wait_until(|| engine.inner().consumer_count() == 0).await;
    assert_eq!(engine.inner().transport_count(), 1);

    let status = sfu.sessions.get_status().await.unwrap();
    assert_eq!(status.session_count, 0);
    assert_eq!(status.consumer_count, 0);

    // The source outlives the peer.
    assert_eq!(sfu.registry.list_sources().await.unwrap().len(), 1);

    // Handles of the departed peer are gone for everyone.
    let mut other = connect(addr).await;
    let reply = request(&mut other, 1, "resume", json!({ "consumerId": consumer_id })).await;
    assert_eq!(reply["ok"], false);
    assert_eq!(reply["error"]["code"], "NOT_FOUND");
    assert_eq!(engine.calls(sfu_test_utils::EngineOp::ResumeConsumer), 0);

    token.cancel();
    task.await.unwrap();
    sfu.shutdown().await;
}

#[tokio::test]
async fn test_peers_are_isolated() {
    let sfu = TestSfu::start();
    let (addr, token, task) = start_server(&sfu).await;
    let mut a = connect(addr).await;
    let mut b = connect(addr).await;

    let reply = request(&mut a, 1, "createConsumerTransport", Value::Null).await;
    let transport_a = reply["data"]["id"].clone();

    // B cannot connect A's transport.
    let reply = request(
        &mut b,
        1,
        "connectConsumerTransport",
        json!({ "transportId": transport_a, "dtlsParameters": dtls_parameters() }),
    )
    .await;
    assert_eq!(reply["ok"], false);
    assert_eq!(reply["error"]["code"], "NOT_FOUND");

    let reply = request(
        &mut a,
        2,
        "connectConsumerTransport",
        json!({ "transportId": transport_a, "dtlsParameters": dtls_parameters() }),
    )
    .await;
    assert_eq!(reply["ok"], true);

    token.cancel();
    task.await.unwrap();
    sfu.shutdown().await;
}

#[tokio::test]
async fn test_server_shutdown_closes_connections() {
    let sfu = TestSfu::start();
    let (addr, token, task) = start_server(&sfu).await;
    let mut ws = connect(addr).await;
    request(&mut ws, 1, "createConsumerTransport", Value::Null).await;

    token.cancel();
    task.await.unwrap();

    let closed = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match ws.next().await {
                None | Some(Err(_)) | Some(Ok(Message::Close(_))) => return,
                Some(Ok(_)) => continue,
            }
        }
    })
    .await;
    assert!(closed.is_ok());

    let engine = std::sync::Arc::clone(&sfu.engine);
    wait_until(|| engine.inner().transport_count() == 0).await;
    sfu.shutdown().await;
}
