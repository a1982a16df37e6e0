//! Observability for the SFU service: Prometheus metrics and health checks.
//!
//! Metric labels are bounded (actor types, encoder outcomes, signaling
//! methods and error codes, engine operations). Source names and peer ids
//! never appear as labels.
//!
//! | Metric | Type | Labels |
//! |--------|------|--------|
//! | `sfu_sources_active` | Gauge | none |
//! | `sfu_sessions_active` | Gauge | none |
//! | `sfu_actor_mailbox_depth` | Gauge | `actor_type` |
//! | `sfu_encoder_exits_total` | Counter | `outcome` |
//! | `sfu_encoder_restarts_total` | Counter | none |
//! | `sfu_consumers_created_total` | Counter | none |
//! | `sfu_engine_call_duration_seconds` | Histogram | `operation` |
//! | `sfu_signaling_requests_total` | Counter | `method`, `status` |
//! | `sfu_signaling_request_duration_seconds` | Histogram | `method` |
//! | `sfu_actor_panics_total` | Counter | `actor_type` |

pub mod health;
pub mod metrics;

pub use health::{health_router, HealthState};
pub use metrics::{
    init_metrics_recorder, record_actor_panic, record_consumer_created, record_encoder_exit,
    record_encoder_restart, record_engine_call, record_signaling_request,
    set_actor_mailbox_depth, set_sessions_active, set_sources_active,
};
