//! Common configuration types for Relay components.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Default tracing filter when `RUST_LOG` is not set.
pub const DEFAULT_LOG_FILTER: &str = "sfu_service=debug,tower_http=debug";

/// Observability configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Log filter directive (same syntax as `RUST_LOG`)
    pub log_filter: String,
    /// Enable JSON-formatted logs
    pub json_logs: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_filter: DEFAULT_LOG_FILTER.to_string(),
            json_logs: false,
        }
    }
}

impl ObservabilityConfig {
    /// Build from an environment-style variable map.
    ///
    /// Reads `RUST_LOG` and `SFU_LOG_JSON` (`true`/`1` enables JSON output).
    #[must_use]
    pub fn from_vars(vars: &HashMap<String, String>) -> Self {
        let log_filter = vars
            .get("RUST_LOG")
            .cloned()
            .unwrap_or_else(|| DEFAULT_LOG_FILTER.to_string());

        let json_logs = vars
            .get("SFU_LOG_JSON")
            .is_some_and(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "yes"));

        Self {
            log_filter,
            json_logs,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ObservabilityConfig::from_vars(&HashMap::new());
        assert_eq!(config.log_filter, DEFAULT_LOG_FILTER);
        assert!(!config.json_logs);
    }

    #[test]
    fn test_json_logs_flag() {
        let vars = HashMap::from([
            ("SFU_LOG_JSON".to_string(), "true".to_string()),
            ("RUST_LOG".to_string(), "info".to_string()),
        ]);
        let config = ObservabilityConfig::from_vars(&vars);
        assert!(config.json_logs);
        assert_eq!(config.log_filter, "info");
    }
}
