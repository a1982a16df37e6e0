//! Integration tests for the signaling request flow.
//!
//! Drives `SignalingHandler` with raw text frames against a registry and
//! session manager wired to the mock engine, the way a WebSocket
//! connection would.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]

use serde_json::{json, Value};
use sfu_service::actors::PipelineState;
use sfu_service::signaling::{ReplyFrame, SignalingHandler};
use sfu_test_utils::{
    dtls_parameters, h264_capabilities, vp8_only_capabilities, EngineOp, MockEngine, TestSfu,
};

fn frame(id: u64, method: &str, data: Value) -> String {
    json!({ "id": id, "method": method, "data": data }).to_string()
}

fn error_code(reply: &ReplyFrame) -> &'static str {
    reply.error.as_ref().expect("error body").code
}

async fn create_source(peer: &SignalingHandler, id: u64, name: &str) -> ReplyFrame {
    peer.handle_text(&frame(
        id,
        "createSource",
        json!({ "name": name, "originUrl": "rtmp://host/live" }),
    ))
    .await
}

/// Create and connect a consumer transport, returning its id.
async fn connected_transport(peer: &SignalingHandler) -> Value {
    let reply = peer
        .handle_text(r#"{"id": 10, "method": "createConsumerTransport"}"#)
        .await;
    assert!(reply.ok, "createConsumerTransport failed: {reply:?}");
    let transport_id = reply.data.unwrap()["id"].clone();

    let reply = peer
        .handle_text(&frame(
            11,
            "connectConsumerTransport",
            json!({ "transportId": transport_id, "dtlsParameters": dtls_parameters() }),
        ))
        .await;
    assert!(reply.ok, "connectConsumerTransport failed: {reply:?}");
    transport_id
}

// ============================================================================
// Source creation
// ============================================================================

#[tokio::test]
async fn test_create_source_twice_is_noop() {
    let sfu = TestSfu::start();
    let peer = sfu.connect_peer().await;

    let first = create_source(&peer, 1, "cam1").await;
    let second = create_source(&peer, 2, "cam1").await;

    assert!(first.ok);
    assert!(second.ok);
    assert_eq!(second.id, Some(2));
    assert_eq!(second.data, Some(Value::Null));

    let sources = sfu.registry.list_sources().await.unwrap();
    assert_eq!(sources.len(), 1);
    assert_eq!(sources[0].name, "cam1");
    assert_eq!(sfu.launcher.launch_count(), 1);
    assert_eq!(sfu.engine.calls(EngineOp::CreatePlainTransport), 1);
    assert_eq!(sfu.engine.inner().producer_count(), 1);

    sfu.shutdown().await;
}

#[tokio::test]
async fn test_create_source_from_two_peers_builds_one_pipeline() {
    let sfu = TestSfu::start();
    let peer_a = sfu.connect_peer().await;
    let peer_b = sfu.connect_peer().await;

    let (a, b) = tokio::join!(
        create_source(&peer_a, 1, "cam1"),
        create_source(&peer_b, 1, "cam1")
    );

    assert!(a.ok && b.ok);
    assert_eq!(sfu.registry.list_sources().await.unwrap().len(), 1);
    assert_eq!(sfu.engine.inner().producer_count(), 1);
    assert_eq!(sfu.launcher.launch_count(), 1);

    sfu.shutdown().await;
}

#[tokio::test]
async fn test_create_source_rolls_back_on_engine_failure() {
    let engine = MockEngine::builder().fail_produce().build();
    let sfu = TestSfu::builder().engine(engine).build();
    let peer = sfu.connect_peer().await;

    let reply = create_source(&peer, 1, "cam1").await;

    assert!(!reply.ok);
    assert_eq!(error_code(&reply), "ENGINE_UNAVAILABLE");
    assert!(sfu.registry.list_sources().await.unwrap().is_empty());
    assert_eq!(sfu.engine.inner().transport_count(), 0);
    assert_eq!(sfu.launcher.launch_count(), 0);

    // Once the engine recovers the same name can be created.
    sfu.engine.set_fail_produce(false);
    let reply = create_source(&peer, 2, "cam1").await;
    assert!(reply.ok);
    let info = sfu.registry.get_source("cam1".to_string()).await.unwrap();
    assert!(matches!(info.state, PipelineState::Running { .. }));

    sfu.shutdown().await;
}

#[tokio::test]
async fn test_create_source_requires_payload() {
    let sfu = TestSfu::start();
    let peer = sfu.connect_peer().await;

    let reply = peer
        .handle_text(r#"{"id": 4, "method": "createSource", "data": {"name": "cam1"}}"#)
        .await;

    assert!(!reply.ok);
    assert_eq!(reply.id, Some(4));
    assert_eq!(error_code(&reply), "BAD_REQUEST");

    sfu.shutdown().await;
}

// ============================================================================
// Consume / resume
// ============================================================================

#[tokio::test]
async fn test_router_capabilities_advertise_h264() {
    let sfu = TestSfu::start();
    let peer = sfu.connect_peer().await;

    let reply = peer
        .handle_text(r#"{"id": 1, "method": "getRouterRtpCapabilities"}"#)
        .await;

    assert!(reply.ok);
    let codecs = reply.data.unwrap()["codecs"].clone();
    assert!(codecs
        .as_array()
        .unwrap()
        .iter()
        .any(|c| c["mimeType"] == "video/H264"));

    sfu.shutdown().await;
}

#[tokio::test]
async fn test_consume_then_resume() {
    let sfu = TestSfu::start();
    let peer = sfu.connect_peer().await;
    assert!(create_source(&peer, 1, "cam1").await.ok);
    let transport_id = connected_transport(&peer).await;

    let reply = peer
        .handle_text(&frame(
            20,
            "consume",
            json!({
                "source": "cam1",
                "transportId": transport_id,
                "rtpCapabilities": h264_capabilities(),
            }),
        ))
        .await;
    assert!(reply.ok, "consume failed: {reply:?}");
    let data = reply.data.unwrap();
    assert_eq!(data["producerPaused"], true);
    assert_eq!(data["kind"], "video");
    assert!(data["producerId"].is_string());
    assert!(data["rtpParameters"]["codecs"].is_array());
    let consumer_id = data["id"].clone();

    let parsed: common::types::ConsumerId = serde_json::from_value(consumer_id.clone()).unwrap();
    assert_eq!(sfu.engine.inner().consumer_paused(parsed), Some(true));

    let reply = peer
        .handle_text(&frame(21, "resume", json!({ "consumerId": consumer_id })))
        .await;
    assert!(reply.ok, "resume failed: {reply:?}");
    assert_eq!(sfu.engine.inner().consumer_paused(parsed), Some(false));

    // Resuming an active handle is a no-op.
    let reply = peer
        .handle_text(&frame(22, "resume", json!({ "consumerId": consumer_id })))
        .await;
    assert!(reply.ok);
    assert_eq!(sfu.engine.calls(EngineOp::ResumeConsumer), 1);

    sfu.shutdown().await;
}

#[tokio::test]
async fn test_consume_unknown_source_is_not_found() {
    let sfu = TestSfu::start();
    let peer = sfu.connect_peer().await;
    let transport_id = connected_transport(&peer).await;

    let reply = peer
        .handle_text(&frame(
            5,
            "consume",
            json!({
                "source": "doesNotExist",
                "transportId": transport_id,
                "rtpCapabilities": h264_capabilities(),
            }),
        ))
        .await;

    assert!(!reply.ok);
    assert_eq!(error_code(&reply), "NOT_FOUND");
    assert_eq!(sfu.engine.inner().consumer_count(), 0);
    assert_eq!(sfu.engine.calls(EngineOp::Consume), 0);

    sfu.shutdown().await;
}

#[tokio::test]
async fn test_consume_before_connect_is_rejected() {
    let sfu = TestSfu::start();
    let peer = sfu.connect_peer().await;
    assert!(create_source(&peer, 1, "cam1").await.ok);

    let reply = peer
        .handle_text(r#"{"id": 2, "method": "createConsumerTransport"}"#)
        .await;
    let transport_id = reply.data.unwrap()["id"].clone();

    let reply = peer
        .handle_text(&frame(
            3,
            "consume",
            json!({
                "source": "cam1",
                "transportId": transport_id,
                "rtpCapabilities": h264_capabilities(),
            }),
        ))
        .await;

    assert!(!reply.ok);
    assert_eq!(error_code(&reply), "PRECONDITION_FAILED");
    assert_eq!(sfu.engine.inner().consumer_count(), 0);

    sfu.shutdown().await;
}

#[tokio::test]
async fn test_consume_with_incompatible_capabilities() {
    let sfu = TestSfu::start();
    let peer = sfu.connect_peer().await;
    assert!(create_source(&peer, 1, "cam1").await.ok);
    let transport_id = connected_transport(&peer).await;

    let reply = peer
        .handle_text(&frame(
            20,
            "consume",
            json!({
                "source": "cam1",
                "transportId": transport_id,
                "rtpCapabilities": vp8_only_capabilities(),
            }),
        ))
        .await;

    assert!(!reply.ok);
    assert_eq!(error_code(&reply), "INCOMPATIBLE_CAPABILITIES");
    assert_eq!(sfu.engine.inner().consumer_count(), 0);

    sfu.shutdown().await;
}

#[tokio::test]
async fn test_resume_from_other_peer_is_routed_to_owner() {
    let sfu = TestSfu::start();
    let owner = sfu.connect_peer().await;
    let other = sfu.connect_peer().await;
    assert!(create_source(&owner, 1, "cam1").await.ok);
    let transport_id = connected_transport(&owner).await;

    let reply = owner
        .handle_text(&frame(
            2,
            "consume",
            json!({
                "source": "cam1",
                "transportId": transport_id,
                "rtpCapabilities": h264_capabilities(),
            }),
        ))
        .await;
    let consumer_id = reply.data.unwrap()["id"].clone();

    let reply = other
        .handle_text(&frame(3, "resume", json!({ "consumerId": consumer_id })))
        .await;

    assert!(reply.ok, "resume failed: {reply:?}");
    assert_eq!(sfu.engine.calls(EngineOp::ResumeConsumer), 1);

    sfu.shutdown().await;
}

#[tokio::test]
async fn test_resume_after_owner_disconnect_is_not_found() {
    let sfu = TestSfu::start();
    let owner = sfu.connect_peer().await;
    let other = sfu.connect_peer().await;
    assert!(create_source(&owner, 1, "cam1").await.ok);
    let transport_id = connected_transport(&owner).await;

    let reply = owner
        .handle_text(&frame(
            2,
            "consume",
            json!({
                "source": "cam1",
                "transportId": transport_id,
                "rtpCapabilities": h264_capabilities(),
            }),
        ))
        .await;
    let consumer_id = reply.data.unwrap()["id"].clone();

    sfu.sessions.disconnect(owner.peer_id()).await.unwrap();

    let reply = other
        .handle_text(&frame(3, "resume", json!({ "consumerId": consumer_id })))
        .await;
    assert!(!reply.ok);
    assert_eq!(error_code(&reply), "NOT_FOUND");
    assert_eq!(sfu.engine.calls(EngineOp::ResumeConsumer), 0);

    sfu.shutdown().await;
}

#[tokio::test]
async fn test_resume_unknown_consumer_is_not_found() {
    let sfu = TestSfu::start();
    let peer = sfu.connect_peer().await;

    let reply = peer
        .handle_text(&frame(
            1,
            "resume",
            json!({ "consumerId": common::types::ConsumerId::new() }),
        ))
        .await;

    assert!(!reply.ok);
    assert_eq!(error_code(&reply), "NOT_FOUND");

    sfu.shutdown().await;
}

// ============================================================================
// Malformed traffic
// ============================================================================

#[tokio::test]
async fn test_malformed_frames_get_error_replies() {
    let sfu = TestSfu::start();
    let peer = sfu.connect_peer().await;

    let reply = peer.handle_text("{not json").await;
    assert!(!reply.ok);
    assert_eq!(reply.id, None);
    assert_eq!(error_code(&reply), "BAD_REQUEST");

    let reply = peer.handle_text(r#"{"id": 7}"#).await;
    assert!(!reply.ok);
    assert_eq!(reply.id, Some(7));
    assert_eq!(error_code(&reply), "BAD_REQUEST");

    let reply = peer.handle_text(r#"{"id": 8, "method": "produce"}"#).await;
    assert!(!reply.ok);
    assert_eq!(reply.id, Some(8));
    assert_eq!(error_code(&reply), "BAD_REQUEST");

    // The session keeps working after bad frames.
    let reply = peer
        .handle_text(r#"{"id": 9, "method": "getRouterRtpCapabilities"}"#)
        .await;
    assert!(reply.ok);

    sfu.shutdown().await;
}

#[tokio::test]
async fn test_error_replies_do_not_leak_internals() {
    let engine = MockEngine::builder().fail_webrtc_transport().build();
    let sfu = TestSfu::builder().engine(engine).build();
    let peer = sfu.connect_peer().await;

    let reply = peer
        .handle_text(r#"{"id": 1, "method": "createConsumerTransport"}"#)
        .await;

    assert!(!reply.ok);
    let error = reply.error.unwrap();
    assert_eq!(error.code, "ENGINE_UNAVAILABLE");
    assert!(!error.message.contains("injected"));

    sfu.shutdown().await;
}
