use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};

use domain::anomaly::AnomalyConfig;

/// Locally-configured MQTT override. Normally the broker settings arrive
/// with the registration response; a local section wins for air-gapped
/// setups.
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct MqttConfig {
    pub broker_url: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub ca_cert_path: Option<String>,
    #[serde(default = "default_verify_certificate")]
    pub verify_certificate: bool,
}

fn default_verify_certificate() -> bool {
    true
}

/// Host firewall behavior applied by the post-provision hook.
#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum FirewallMode {
    On,
    Off,
    Auto,
    Disabled,
}

impl Default for FirewallMode {
    fn default() -> Self {
        Self::Auto
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct AgentConfig {
    /// Cloud API endpoint; absent means local-only mode.
    #[serde(default)]
    pub api_endpoint: Option<String>,
    /// Fleet-wide bootstrap credential (one-time use).
    #[serde(default)]
    pub provisioning_key: Option<String>,
    #[serde(default)]
    pub application_id: Option<String>,
    #[serde(default)]
    pub device_name: Option<String>,
    #[serde(default = "default_device_type")]
    pub device_type: String,

    #[serde(default = "default_local_api_port")]
    pub local_api_port: u16,

    #[serde(default = "default_reconcile_interval_ms")]
    pub reconcile_interval_ms: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_report_interval_ms")]
    pub report_interval_ms: u64,
    #[serde(default = "default_metrics_interval_ms")]
    pub metrics_interval_ms: u64,

    #[serde(default)]
    pub mqtt: Option<MqttConfig>,

    #[serde(default)]
    pub anomaly: AnomalyConfig,

    #[serde(default)]
    pub firewall_mode: FirewallMode,

    /// Healthcheck: allowed RSS growth over the post-warm-up baseline.
    #[serde(default = "default_memory_threshold_mb")]
    pub memory_threshold_mb: u64,

    #[serde(default = "default_data_dir")]
    pub data_dir: String,
    #[serde(default)]
    pub log_persistence_path: Option<String>,

    /// Refuse to start unprovisioned (exit code 1).
    #[serde(default)]
    pub require_provisioning: bool,
}

fn default_device_type() -> String {
    "generic-x86_64".to_string()
}
fn default_local_api_port() -> u16 {
    48484
}
fn default_reconcile_interval_ms() -> u64 {
    60_000
}
fn default_poll_interval_ms() -> u64 {
    60_000
}
fn default_report_interval_ms() -> u64 {
    60_000
}
fn default_metrics_interval_ms() -> u64 {
    10_000
}
fn default_memory_threshold_mb() -> u64 {
    256
}
fn default_data_dir() -> String {
    "data".to_string()
}

impl AgentConfig {
    /// Layered load: defaults, then config files, then `EDGE__`-prefixed
    /// environment variables (e.g. `EDGE__API_ENDPOINT=https://...`).
    pub fn load(config_dir: &str) -> Result<Self, ConfigError> {
        let run_mode = std::env::var("RUN_MODE").unwrap_or_else(|_| "production".into());

        let s = Config::builder()
            .add_source(File::with_name(&format!("{config_dir}/default")).required(false))
            // Persisted config from the control plane (second priority)
            .add_source(File::with_name(&format!("{config_dir}/last_known")).required(false))
            // Mode-specific file (first priority)
            .add_source(File::with_name(&format!("{config_dir}/{run_mode}")).required(false))
            .add_source(Environment::with_prefix("EDGE").separator("__"))
            .build()?;

        s.try_deserialize()
    }
}
