//! Relay SFU
//!
//! Signaling and session orchestration for RTMP-ingested live sources.
//!
//! # Servers
//!
//! - WebSocket signaling server (default: 0.0.0.0:3000)
//! - HTTP server for health endpoints and metrics (default: 0.0.0.0:8081)
//!
//! # Startup Flow
//!
//! 1. Load configuration from environment
//! 2. Initialize tracing and the Prometheus metrics recorder
//! 3. Create the media engine
//! 4. Spawn the source registry and session manager actors
//! 5. Start health HTTP server (liveness, readiness, metrics)
//! 6. Bind the signaling listener, mark ready
//! 7. Wait for shutdown signal, then drain sessions and encoders

#![warn(clippy::pedantic)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use sfu_service::actors::{
    ActorMetrics, IngestConfig, SessionContext, SessionManagerHandle, SourceRegistryHandle,
};
use sfu_service::capabilities::CapabilityRegistry;
use sfu_service::config::Config;
use sfu_service::engine::{LocalEngine, LocalEngineConfig, MediaEngine};
use sfu_service::ingest::ProcessLauncher;
use sfu_service::observability::{health_router, init_metrics_recorder, HealthState};
use sfu_service::signaling::{SignalingContext, SignalingServer};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// How long shutdown waits for each actor to drain.
const ACTOR_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::from_env()?;

    // Initialize tracing
    let filter = tracing_subscriber::EnvFilter::try_new(&config.observability.log_filter)
        .unwrap_or_else(|_| common::config::DEFAULT_LOG_FILTER.into());
    let subscriber = tracing_subscriber::registry().with(filter);
    if config.observability.json_logs {
        subscriber
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        subscriber.with(tracing_subscriber::fmt::layer()).init();
    }

    info!("Starting Relay SFU");
    info!(
        instance_id = %config.instance_id,
        signaling_bind_address = %config.signaling_bind_address,
        health_bind_address = %config.health_bind_address,
        rtc_min_port = config.rtc_min_port,
        rtc_max_port = config.rtc_max_port,
        ffmpeg_path = %config.ffmpeg_path,
        restart_policy = ?config.restart_policy,
        "Configuration loaded successfully"
    );

    // Must happen before any metrics are recorded
    let prometheus_handle = init_metrics_recorder().map_err(|e| {
        error!(error = %e, "Failed to install Prometheus metrics recorder");
        e
    })?;

    let health_state = Arc::new(HealthState::new(config.instance_id.clone()));
    let root_token = CancellationToken::new();

    let engine: Arc<dyn MediaEngine> = Arc::new(LocalEngine::new(LocalEngineConfig {
        rtc_min_port: config.rtc_min_port,
        rtc_max_port: config.rtc_max_port,
        webrtc_listen_ip: config.webrtc_listen_ip.clone(),
        ..LocalEngineConfig::default()
    }));
    let capabilities = CapabilityRegistry::new(Arc::clone(&engine));

    // Initialize actor system
    let actor_metrics = ActorMetrics::new();
    let (registry, registry_task) = SourceRegistryHandle::spawn(
        config.instance_id.clone(),
        Arc::clone(&engine),
        Arc::new(ProcessLauncher),
        IngestConfig::from(&config),
        root_token.child_token(),
        Arc::clone(&actor_metrics),
    );
    let (sessions, sessions_task) = SessionManagerHandle::spawn(
        config.instance_id.clone(),
        SessionContext {
            engine: Arc::clone(&engine),
            capabilities: capabilities.clone(),
            registry: registry.clone(),
            metrics: Arc::clone(&actor_metrics),
        },
        root_token.child_token(),
    );
    info!("Actor system initialized");

    // Start health HTTP server (liveness, readiness, /metrics)
    let health_addr: SocketAddr = config.health_bind_address.parse().map_err(|e| {
        error!(error = %e, addr = %config.health_bind_address, "Invalid health bind address");
        format!("Invalid health bind address: {e}")
    })?;

    let metrics_router = Router::new().route(
        "/metrics",
        axum::routing::get(move || {
            let handle = prometheus_handle.clone();
            async move { handle.render() }
        }),
    );
    let app = health_router(Arc::clone(&health_state))
        .merge(metrics_router)
        .layer(TraceLayer::new_for_http());

    // Bind listener BEFORE spawning to fail fast on bind errors
    let health_listener = tokio::net::TcpListener::bind(health_addr)
        .await
        .map_err(|e| {
            error!(error = %e, addr = %health_addr, "Failed to bind health server");
            format!("Failed to bind health server to {health_addr}: {e}")
        })?;

    let health_shutdown_token = root_token.child_token();
    let health_task = tokio::spawn(async move {
        info!(addr = %health_addr, "Health server starting");
        let server = axum::serve(health_listener, app).with_graceful_shutdown(async move {
            health_shutdown_token.cancelled().await;
            info!("Health server shutting down");
        });
        if let Err(e) = server.await {
            error!(error = %e, "Health server failed");
        }
    });

    // Start signaling server
    let signaling_listener = tokio::net::TcpListener::bind(&config.signaling_bind_address)
        .await
        .map_err(|e| {
            error!(
                error = %e,
                addr = %config.signaling_bind_address,
                "Failed to bind signaling server"
            );
            format!(
                "Failed to bind signaling server to {}: {e}",
                config.signaling_bind_address
            )
        })?;

    let signaling_token = root_token.child_token();
    let server = SignalingServer::new(
        signaling_listener,
        SignalingContext {
            registry: registry.clone(),
            sessions: sessions.clone(),
            capabilities,
        },
        signaling_token.clone(),
    );
    let signaling_task = tokio::spawn(server.run());

    health_state.set_ready();
    info!("Relay SFU running - press Ctrl+C to shutdown");

    shutdown_signal().await;
    info!("Shutdown signal received, initiating graceful shutdown...");

    // Mark as not ready immediately so load balancers stop sending peers
    health_state.set_not_ready();

    // Stop accepting peers first, then drain sessions before encoders
    signaling_token.cancel();
    let _ = signaling_task.await;

    sessions.cancel();
    if tokio::time::timeout(ACTOR_SHUTDOWN_TIMEOUT, sessions_task)
        .await
        .is_err()
    {
        warn!("Session manager shutdown timed out");
    }

    registry.cancel();
    if tokio::time::timeout(ACTOR_SHUTDOWN_TIMEOUT, registry_task)
        .await
        .is_err()
    {
        warn!("Source registry shutdown timed out");
    }

    root_token.cancel();
    let _ = health_task.await;

    info!("Relay SFU shutdown complete");
    Ok(())
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM).
///
/// # Panics
///
/// Panics if signal handlers cannot be installed. This is acceptable because
/// without signal handlers, we cannot gracefully shut down the service.
async fn shutdown_signal() {
    let ctrl_c = async {
        #[expect(
            clippy::expect_used,
            reason = "Signal handler installation is critical - panic is appropriate if it fails"
        )]
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        #[expect(
            clippy::expect_used,
            reason = "Signal handler installation is critical - panic is appropriate if it fails"
        )]
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}
