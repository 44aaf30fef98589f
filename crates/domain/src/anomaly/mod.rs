mod alert;
mod buffer;
mod detector;

pub use alert::{Alert, AlertContext, Severity, Trend};
pub use buffer::StatBuffer;
pub use detector::{
    Detection, DetectorKind, DetectorThresholds, EwmaState, ewma, iqr, mad, rate_of_change, zscore,
};

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Per-metric overrides for the anomaly engine.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct MetricDetectorConfig {
    #[serde(default)]
    pub methods: Option<Vec<DetectorKind>>,
    #[serde(default)]
    pub window_size: Option<usize>,
}

/// Anomaly engine configuration (file- or target-state-provided).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AnomalyConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Window for system metrics (cpu, memory, ...).
    #[serde(default = "default_system_window")]
    pub system_window_size: usize,
    /// Window for sensor metrics.
    #[serde(default = "default_sensor_window")]
    pub sensor_window_size: usize,
    #[serde(default = "default_min_samples")]
    pub min_samples: usize,
    #[serde(default = "default_methods")]
    pub methods: Vec<DetectorKind>,
    #[serde(default)]
    pub thresholds: DetectorThresholds,
    /// Detections below this confidence are discarded.
    #[serde(default = "default_confidence_floor")]
    pub confidence_floor: f64,
    /// Sensitivity scales thresholds down (>1 means more sensitive).
    #[serde(default = "default_sensitivity")]
    pub sensitivity: f64,
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,
    #[serde(default = "default_queue_size")]
    pub queue_size: usize,
    #[serde(default)]
    pub per_metric: BTreeMap<String, MetricDetectorConfig>,
}

fn default_enabled() -> bool {
    true
}
fn default_system_window() -> usize {
    100
}
fn default_sensor_window() -> usize {
    500
}
fn default_min_samples() -> usize {
    10
}
fn default_methods() -> Vec<DetectorKind> {
    vec![DetectorKind::ZScore, DetectorKind::Mad, DetectorKind::Iqr]
}
fn default_confidence_floor() -> f64 {
    0.5
}
fn default_sensitivity() -> f64 {
    1.0
}
fn default_cooldown_secs() -> u64 {
    300
}
fn default_queue_size() -> usize {
    100
}

impl Default for AnomalyConfig {
    fn default() -> Self {
        serde_json::from_value(serde_json::json!({})).expect("defaults are total")
    }
}

impl AnomalyConfig {
    pub fn methods_for(&self, metric: &str) -> Vec<DetectorKind> {
        self.per_metric
            .get(metric)
            .and_then(|m| m.methods.clone())
            .unwrap_or_else(|| self.methods.clone())
    }

    pub fn window_for(&self, metric: &str, is_sensor: bool) -> usize {
        self.per_metric
            .get(metric)
            .and_then(|m| m.window_size)
            .unwrap_or(if is_sensor {
                self.sensor_window_size
            } else {
                self.system_window_size
            })
    }
}
