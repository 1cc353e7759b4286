//! On-disk configuration, loaded from TOML.
//!
//! Grounded in the daemon workspace's use of `toml` for on-disk config
//! (`oj-runbook` parses its runbooks as structured text, but the daemon's
//! own settings — state dir, timeouts — are env-driven per `env.rs`; here
//! those same knobs are made config-file driven per the design notes,
//! since this daemon has no per-environment override mechanism of its
//! own yet). Field names spell out units (`_secs`) rather than reaching
//! for a duration-deserializing crate the rest of the workspace doesn't
//! use.

use crate::error::ConfigError;
use gpuq_core::ServiceClass;
use indexmap::IndexMap;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

fn default_listen() -> String {
    "0.0.0.0:8000".to_string()
}
fn default_debounce_secs() -> u64 {
    1
}
fn default_cleanup_timeout_secs() -> u64 {
    30
}
fn default_leave_cleanup_secs() -> u64 {
    3
}
fn default_join_cleanup_secs() -> u64 {
    30
}
fn default_poll_interval_secs() -> u64 {
    1
}
fn default_stuck_job_timeout_secs() -> u64 {
    600
}
fn default_restart_command() -> String {
    "restart".to_string()
}
fn default_watchdog_fifo() -> String {
    "/var/run/gpuqd/control.fifo".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct BackendConfig {
    pub base_url: String,
    /// Best-effort teardown endpoint invoked when this class's cleanup
    /// hook fires. `None` means no network teardown is needed.
    #[serde(default)]
    pub unload_path: Option<String>,
    #[serde(default = "default_join_cleanup_secs")]
    pub join_cleanup_secs: u64,
    #[serde(default = "default_leave_cleanup_secs")]
    pub leave_cleanup_secs: u64,
    #[serde(default = "default_cleanup_timeout_secs")]
    pub response_cleanup_timeout_secs: u64,
    #[serde(default = "default_true")]
    pub close_on_body: bool,
    #[serde(default)]
    pub post_body_wait_secs: u64,
}

fn default_true() -> bool {
    true
}

impl BackendConfig {
    pub fn join_cleanup(&self) -> Duration {
        Duration::from_secs(self.join_cleanup_secs)
    }
    pub fn leave_cleanup(&self) -> Duration {
        Duration::from_secs(self.leave_cleanup_secs)
    }
    pub fn response_cleanup_timeout(&self) -> Duration {
        Duration::from_secs(self.response_cleanup_timeout_secs)
    }
    pub fn post_body_wait(&self) -> Duration {
        Duration::from_secs(self.post_body_wait_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProgressConfig {
    /// Which configured backend's progress endpoint is polled.
    pub target: String,
    pub url: String,
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_stuck_job_timeout_secs")]
    pub stuck_job_timeout_secs: u64,
    #[serde(default = "default_restart_command")]
    pub restart_command: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GpuMonitorConfig {
    pub command: Vec<String>,
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GpuqConfig {
    #[serde(default = "default_listen")]
    pub listen: String,
    pub backends: IndexMap<String, BackendConfig>,
    #[serde(default = "default_debounce_secs")]
    pub debounce_interval_secs: u64,
    #[serde(default = "default_watchdog_fifo")]
    pub watchdog_fifo_path: String,
    pub progress: ProgressConfig,
    pub gpu_monitor: GpuMonitorConfig,
}

impl GpuqConfig {
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let config: GpuqConfig = toml::from_str(s)?;
        for name in config.backends.keys() {
            ServiceClass::parse_backend_name(name)?;
        }
        if !config.backends.contains_key(&config.progress.target) {
            return Err(ConfigError::UnknownBackend(config.progress.target.clone()));
        }
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io { path: path.display().to_string(), source })?;
        Self::from_toml_str(&text)
    }

    pub fn debounce_interval(&self) -> Duration {
        Duration::from_secs(self.debounce_interval_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
        listen = "0.0.0.0:9000"

        [backends.sd]
        base_url = "http://stablediff-cuda:7860"
        unload_path = "/sdapi/v1/unload-checkpoint"

        [backends.llm]
        base_url = "http://llm-backend:8080"

        [progress]
        target = "sd"
        url = "http://stablediff-cuda:7860/sdapi/v1/progress"

        [gpu_monitor]
        command = ["nvidia-smi", "--query-gpu=memory.used,memory.free,memory.total,power.draw", "--format=csv,noheader,nounits"]
    "#;

    #[test]
    fn parses_sample_config_with_defaults() {
        let config = GpuqConfig::from_toml_str(SAMPLE).unwrap();
        assert_eq!(config.listen, "0.0.0.0:9000");
        assert_eq!(config.backends.len(), 2);
        assert_eq!(config.backends["sd"].join_cleanup_secs, 30);
        assert!(config.backends["sd"].close_on_body);
        assert_eq!(config.debounce_interval_secs, 1);
    }

    #[test]
    fn rejects_progress_target_not_in_backends() {
        let bad = SAMPLE.replace(r#"target = "sd""#, r#"target = "video""#);
        assert!(GpuqConfig::from_toml_str(&bad).is_err());
    }

    #[test]
    fn rejects_backend_name_colliding_with_reserved_route() {
        let bad = SAMPLE.replace("[backends.sd]", "[backends.internal]").replace("target = \"sd\"", "target = \"internal\"");
        assert!(matches!(GpuqConfig::from_toml_str(&bad), Err(ConfigError::InvalidBackendName(_))));
    }
}
