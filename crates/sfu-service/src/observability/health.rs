//! Health endpoints for the SFU service.
//!
//! - `GET /health` - liveness (process is running)
//! - `GET /ready` - readiness (signaling listener bound, not shutting down)
//!
//! Both answer with a small JSON body naming the instance. `/metrics` is
//! mounted next to these by the binary.

use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Liveness and readiness flags of one SFU instance.
#[derive(Debug)]
pub struct HealthState {
    instance_id: String,
    live: AtomicBool,
    /// Set once the signaling listener is bound, cleared on shutdown.
    ready: AtomicBool,
}

impl HealthState {
    /// Create a new health state (live=true, ready=false).
    #[must_use]
    pub fn new(instance_id: impl Into<String>) -> Self {
        Self {
            instance_id: instance_id.into(),
            live: AtomicBool::new(true),
            ready: AtomicBool::new(false),
        }
    }

    pub fn set_ready(&self) {
        self.ready.store(true, Ordering::SeqCst);
    }

    /// Mark the service as not ready (e.g., during shutdown).
    pub fn set_not_ready(&self) {
        self.ready.store(false, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }
}

/// Create the health router with liveness and readiness endpoints.
pub fn health_router(health_state: Arc<HealthState>) -> Router {
    Router::new()
        .route("/health", get(liveness_handler))
        .route("/ready", get(readiness_handler))
        .with_state(health_state)
}

async fn liveness_handler(State(state): State<Arc<HealthState>>) -> (StatusCode, Json<Value>) {
    let live = state.is_live();
    let code = if live {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        code,
        Json(json!({ "live": live, "instance_id": state.instance_id() })),
    )
}

async fn readiness_handler(State(state): State<Arc<HealthState>>) -> (StatusCode, Json<Value>) {
    let ready = state.is_ready();
    let code = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        code,
        Json(json!({ "ready": ready, "instance_id": state.instance_id() })),
    )
}
