//! SFU service configuration.
//!
//! Configuration is loaded from environment variables with defaults for
//! every field; malformed values are rejected rather than silently replaced.

use crate::engine::local::{DEFAULT_RTC_MAX_PORT, DEFAULT_RTC_MIN_PORT};
use crate::ingest::RestartPolicy;
use common::config::ObservabilityConfig;
use std::collections::HashMap;
use std::env;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Default WebSocket signaling bind address.
pub const DEFAULT_SIGNALING_BIND_ADDRESS: &str = "0.0.0.0:3000";

/// Default health/metrics endpoint bind address.
pub const DEFAULT_HEALTH_BIND_ADDRESS: &str = "0.0.0.0:8081";

/// Default IP advertised in peer transport ICE candidates.
pub const DEFAULT_WEBRTC_LISTEN_IP: &str = "127.0.0.1";

/// Default listen IP of the encoder ingress endpoint.
pub const DEFAULT_PLAIN_LISTEN_IP: &str = "0.0.0.0";

/// Default host the encoder pushes RTP to.
pub const DEFAULT_ENCODER_TARGET_HOST: &str = "127.0.0.1";

/// Default encoder binary.
pub const DEFAULT_FFMPEG_PATH: &str = "ffmpeg";

/// Default restart attempts when the backoff policy is enabled.
pub const DEFAULT_ENCODER_MAX_RESTARTS: u32 = 5;

/// Default initial restart delay in milliseconds.
pub const DEFAULT_ENCODER_BACKOFF_MS: u64 = 1000;

/// Upper bound for a single restart delay.
pub const MAX_ENCODER_BACKOFF: Duration = Duration::from_secs(30);

/// Default SFU instance ID prefix.
pub const DEFAULT_SFU_ID_PREFIX: &str = "sfu";

/// SFU service configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// WebSocket signaling bind address (default: "0.0.0.0:3000").
    pub signaling_bind_address: String,

    /// Health and metrics bind address (default: "0.0.0.0:8081").
    pub health_bind_address: String,

    /// First port of the RTC range (default: 30000).
    pub rtc_min_port: u16,

    /// Last port of the RTC range, inclusive (default: 31000).
    pub rtc_max_port: u16,

    pub webrtc_listen_ip: String,

    pub plain_listen_ip: String,

    pub encoder_target_host: String,

    pub ffmpeg_path: String,

    /// What to do when an encoder exits.
    pub restart_policy: RestartPolicy,

    /// Unique identifier for this SFU instance.
    pub instance_id: String,

    pub observability: ObservabilityConfig,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),
}

fn parse_var<T: FromStr>(
    vars: &HashMap<String, String>,
    key: &str,
    default: T,
) -> Result<T, ConfigError> {
    match vars.get(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidValue(format!("{key}={raw}"))),
        None => Ok(default),
    }
}

fn string_var(vars: &HashMap<String, String>, key: &str, default: &str) -> String {
    vars.get(key)
        .cloned()
        .unwrap_or_else(|| default.to_string())
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(&env::vars().collect())
    }

    /// Load configuration from a `HashMap` (for testing).
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let signaling_bind_address = string_var(
            vars,
            "SFU_SIGNALING_BIND_ADDRESS",
            DEFAULT_SIGNALING_BIND_ADDRESS,
        );
        let health_bind_address =
            string_var(vars, "SFU_HEALTH_BIND_ADDRESS", DEFAULT_HEALTH_BIND_ADDRESS);

        let rtc_min_port = parse_var(vars, "RTC_MIN_PORT", DEFAULT_RTC_MIN_PORT)?;
        let rtc_max_port = parse_var(vars, "RTC_MAX_PORT", DEFAULT_RTC_MAX_PORT)?;
        if rtc_min_port == 0 || rtc_min_port > rtc_max_port {
            return Err(ConfigError::InvalidValue(format!(
                "RTC port range {rtc_min_port}-{rtc_max_port}"
            )));
        }

        let webrtc_listen_ip = string_var(vars, "SFU_WEBRTC_LISTEN_IP", DEFAULT_WEBRTC_LISTEN_IP);
        let plain_listen_ip = string_var(vars, "SFU_PLAIN_LISTEN_IP", DEFAULT_PLAIN_LISTEN_IP);
        let encoder_target_host =
            string_var(vars, "SFU_ENCODER_TARGET_HOST", DEFAULT_ENCODER_TARGET_HOST);
        let ffmpeg_path = string_var(vars, "SFU_FFMPEG_PATH", DEFAULT_FFMPEG_PATH);

        let restart_policy = match vars
            .get("SFU_ENCODER_RESTART")
            .map(|s| s.trim().to_ascii_lowercase())
            .as_deref()
        {
            None | Some("never") => RestartPolicy::Never,
            Some("backoff") => {
                let max_attempts = parse_var(
                    vars,
                    "SFU_ENCODER_MAX_RESTARTS",
                    DEFAULT_ENCODER_MAX_RESTARTS,
                )?;
                let backoff_ms =
                    parse_var(vars, "SFU_ENCODER_BACKOFF_MS", DEFAULT_ENCODER_BACKOFF_MS)?;
                RestartPolicy::Backoff {
                    initial: Duration::from_millis(backoff_ms),
                    max: MAX_ENCODER_BACKOFF.max(Duration::from_millis(backoff_ms)),
                    max_attempts,
                }
            }
            Some(other) => {
                return Err(ConfigError::InvalidValue(format!(
                    "SFU_ENCODER_RESTART={other} (expected never or backoff)"
                )));
            }
        };

        // Generate SFU instance ID
        let instance_id = vars.get("SFU_INSTANCE_ID").cloned().unwrap_or_else(|| {
            let hostname = env::var("HOSTNAME").unwrap_or_else(|_| "unknown".to_string());
            let uuid_suffix = uuid::Uuid::new_v4().to_string();
            let short_suffix = uuid_suffix.get(..8).unwrap_or("00000000");
            format!("{DEFAULT_SFU_ID_PREFIX}-{hostname}-{short_suffix}")
        });

        Ok(Config {
            signaling_bind_address,
            health_bind_address,
            rtc_min_port,
            rtc_max_port,
            webrtc_listen_ip,
            plain_listen_ip,
            encoder_target_host,
            ffmpeg_path,
            restart_policy,
            instance_id,
            observability: ObservabilityConfig::from_vars(vars),
        })
    }
}
