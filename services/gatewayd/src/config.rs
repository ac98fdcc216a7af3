//! Process-level configuration: log level, RTU bus device paths, and the
//! defaults used before `ConfigStore` has anything loaded. Grounded on
//! `netsrv::config::Config::new`/`modsrv::config::Config::new` (TOML via
//! the `config` crate, falling back to `Config::default()` on failure).

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayProcessConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_rtu_port1")]
    pub rtu_port1_path: String,
    #[serde(default = "default_rtu_port2")]
    pub rtu_port2_path: String,
    #[serde(default = "default_retry_store_path")]
    pub retry_store_path: String,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

fn default_log_level() -> String {
    "info".to_string()
}
fn default_rtu_port1() -> String {
    "/dev/ttyUSB0".to_string()
}
fn default_rtu_port2() -> String {
    "/dev/ttyUSB1".to_string()
}
fn default_retry_store_path() -> String {
    "/var/lib/gatewayd/retry".to_string()
}
fn default_queue_capacity() -> usize {
    512
}

impl Default for GatewayProcessConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            rtu_port1_path: default_rtu_port1(),
            rtu_port2_path: default_rtu_port2(),
            retry_store_path: default_retry_store_path(),
            queue_capacity: default_queue_capacity(),
        }
    }
}

impl GatewayProcessConfig {
    /// Loads from `path`, falling back to defaults with a warning on any
    /// failure (missing file, parse error) rather than refusing to start.
    pub fn load(path: &str) -> Self {
        let result = config::Config::builder()
            .add_source(config::File::with_name(path).required(false))
            .build()
            .and_then(|c| c.try_deserialize::<GatewayProcessConfig>());

        match result {
            Ok(cfg) => cfg,
            Err(e) => {
                log::warn!("failed to load config from {path}, using defaults: {e}");
                Self::default()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_falls_back_to_default() {
        let cfg = GatewayProcessConfig::load("/nonexistent/path/gatewayd");
        assert_eq!(cfg.log_level, "info");
        assert_eq!(cfg.queue_capacity, 512);
    }
}
