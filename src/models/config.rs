use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Orchestrator tunables. Everything has a default; a config file is
/// optional and absent fields fall back field by field.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OrchestratorConfig {
    /// Durable account store, written wholesale on every mutation
    #[serde(default = "default_accounts_file")]
    pub accounts_file: PathBuf,
    /// One `host:port:username:password` proxy per line
    #[serde(default = "default_proxies_file")]
    pub proxies_file: PathBuf,

    /// Per-account request cap inside the sliding window
    #[serde(default = "default_requests_per_window")]
    pub requests_per_window: usize,
    #[serde(default = "default_rate_window_secs")]
    pub rate_window_secs: u64,
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,

    /// Attempts per dispatch before giving up
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_breaker_failure_threshold")]
    pub breaker_failure_threshold: u32,
    #[serde(default = "default_breaker_open_secs")]
    pub breaker_open_secs: u64,

    /// None = `max(50, cpu_count × 4)`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gate_capacity: Option<usize>,
    #[serde(default = "default_gate_acquire_timeout_secs")]
    pub gate_acquire_timeout_secs: u64,

    /// Minimum spacing between requests through the same proxy
    #[serde(default = "default_proxy_spacing_ms")]
    pub proxy_spacing_ms: u64,

    #[serde(default = "default_login_timeout_secs")]
    pub login_timeout_secs: u64,
    /// Anti-burst pause before a credential login
    #[serde(default = "default_login_pause_ms")]
    pub login_pause_ms: u64,

    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    #[serde(default = "default_stats_interval_secs")]
    pub stats_interval_secs: u64,
    #[serde(default = "default_rate_adjust_interval_secs")]
    pub rate_adjust_interval_secs: u64,

    /// AUTH errors inside the 24 h window that disable an account
    #[serde(default = "default_auth_disable_threshold")]
    pub auth_disable_threshold: usize,
    #[serde(default = "default_auth_error_window_secs")]
    pub auth_error_window_secs: u64,
    /// Error counters idle this long are reset by the sweep
    #[serde(default = "default_idle_counter_reset_secs")]
    pub idle_counter_reset_secs: u64,

    /// Consecutive AUTH failures before a cooldown
    #[serde(default = "default_auth_cooldown_failures")]
    pub auth_cooldown_failures: u32,
    /// Consecutive NETWORK failures before probation
    #[serde(default = "default_network_probation_failures")]
    pub network_probation_failures: u32,
    /// Consecutive UNKNOWN failures before probation
    #[serde(default = "default_unknown_probation_failures")]
    pub unknown_probation_failures: u32,
    /// Consecutive successes that promote PROBATION back to HEALTHY
    #[serde(default = "default_probation_promote_successes")]
    pub probation_promote_successes: u32,

    /// Batches at or below this size run as independent dispatches
    #[serde(default = "default_batch_parallel_threshold")]
    pub batch_parallel_threshold: usize,
    #[serde(default = "default_batch_chunk_size")]
    pub batch_chunk_size: usize,

    /// Starting point for the adaptive global dispatch rate (req/s)
    #[serde(default = "default_initial_global_rate")]
    pub initial_global_rate: f64,
}

fn default_accounts_file() -> PathBuf {
    PathBuf::from("data.json")
}
fn default_proxies_file() -> PathBuf {
    PathBuf::from("proxies.txt")
}
fn default_requests_per_window() -> usize {
    200
}
fn default_rate_window_secs() -> u64 {
    15 * 60
}
fn default_cooldown_secs() -> u64 {
    120
}
fn default_max_attempts() -> u32 {
    10
}
fn default_breaker_failure_threshold() -> u32 {
    15
}
fn default_breaker_open_secs() -> u64 {
    60
}
fn default_gate_acquire_timeout_secs() -> u64 {
    10
}
fn default_proxy_spacing_ms() -> u64 {
    1000
}
fn default_login_timeout_secs() -> u64 {
    45
}
fn default_login_pause_ms() -> u64 {
    1000
}
fn default_sweep_interval_secs() -> u64 {
    120
}
fn default_stats_interval_secs() -> u64 {
    300
}
fn default_rate_adjust_interval_secs() -> u64 {
    60
}
fn default_auth_disable_threshold() -> usize {
    50
}
fn default_auth_error_window_secs() -> u64 {
    24 * 3600
}
fn default_idle_counter_reset_secs() -> u64 {
    15 * 60
}
fn default_auth_cooldown_failures() -> u32 {
    5
}
fn default_network_probation_failures() -> u32 {
    10
}
fn default_unknown_probation_failures() -> u32 {
    50
}
fn default_probation_promote_successes() -> u32 {
    3
}
fn default_batch_parallel_threshold() -> usize {
    5
}
fn default_batch_chunk_size() -> usize {
    10
}
fn default_initial_global_rate() -> f64 {
    10.0
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        serde_json::from_str("{}").expect("empty config object must deserialize")
    }
}

impl OrchestratorConfig {
    pub fn rate_window(&self) -> Duration {
        Duration::from_secs(self.rate_window_secs)
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }

    pub fn proxy_spacing(&self) -> Duration {
        Duration::from_millis(self.proxy_spacing_ms)
    }

    pub fn gate_acquire_timeout(&self) -> Duration {
        Duration::from_secs(self.gate_acquire_timeout_secs)
    }

    pub fn login_timeout(&self) -> Duration {
        Duration::from_secs(self.login_timeout_secs)
    }

    pub fn login_pause(&self) -> Duration {
        Duration::from_millis(self.login_pause_ms)
    }
}

/// Load config from a JSON file. A missing file yields the defaults; a
/// present but malformed file is an error.
pub fn load_config(path: &Path) -> Result<OrchestratorConfig, String> {
    if !path.exists() {
        tracing::debug!("Config file {:?} not found, using defaults", path);
        return Ok(OrchestratorConfig::default());
    }
    let content =
        std::fs::read_to_string(path).map_err(|e| format!("Failed to read config file: {}", e))?;
    serde_json::from_str(&content).map_err(|e| format!("Failed to parse config file: {}", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_contract() {
        let cfg = OrchestratorConfig::default();
        assert_eq!(cfg.requests_per_window, 200);
        assert_eq!(cfg.rate_window_secs, 900);
        assert_eq!(cfg.cooldown_secs, 120);
        assert_eq!(cfg.max_attempts, 10);
        assert_eq!(cfg.breaker_failure_threshold, 15);
        assert_eq!(cfg.breaker_open_secs, 60);
        assert_eq!(cfg.proxy_spacing_ms, 1000);
        assert_eq!(cfg.login_timeout_secs, 45);
        assert_eq!(cfg.gate_acquire_timeout_secs, 10);
        assert_eq!(cfg.auth_disable_threshold, 50);
        assert_eq!(cfg.batch_parallel_threshold, 5);
        assert_eq!(cfg.batch_chunk_size, 10);
        assert!(cfg.gate_capacity.is_none());
    }

    #[test]
    fn test_partial_file_falls_back_per_field() {
        let cfg: OrchestratorConfig =
            serde_json::from_str(r#"{"requests_per_window": 2, "cooldown_secs": 5}"#).unwrap();
        assert_eq!(cfg.requests_per_window, 2);
        assert_eq!(cfg.cooldown_secs, 5);
        assert_eq!(cfg.max_attempts, 10);
        assert_eq!(cfg.accounts_file, PathBuf::from("data.json"));
    }

    #[test]
    fn test_load_config_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = load_config(&dir.path().join("nope.json")).unwrap();
        assert_eq!(cfg, OrchestratorConfig::default());
    }

    #[test]
    fn test_load_config_rejects_malformed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("orchestrator.json");
        std::fs::write(&path, "not json").unwrap();
        assert!(load_config(&path).is_err());
    }
}
