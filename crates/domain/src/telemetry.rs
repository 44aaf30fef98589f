use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::DomainError;
use crate::sensor::Quality;

/// Which side of the agent produced a metric sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricSource {
    System,
    Sensor,
}

/// One sample fed into the anomaly engine.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MetricSample {
    pub source: MetricSource,
    pub metric: String,
    pub value: f64,
    pub unit: String,
    pub quality: Quality,
}

impl MetricSample {
    pub fn system(metric: impl Into<String>, value: f64, unit: impl Into<String>) -> Self {
        Self {
            source: MetricSource::System,
            metric: metric.into(),
            value,
            unit: unit.into(),
            quality: Quality::Good,
        }
    }

    pub fn sensor(metric: impl Into<String>, value: f64, unit: impl Into<String>) -> Self {
        Self {
            source: MetricSource::Sensor,
            metric: metric.into(),
            value,
            unit: unit.into(),
            quality: Quality::Good,
        }
    }
}

/// A process visible in the system snapshot.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProcessInfo {
    pub pid: u32,
    pub name: String,
    pub cpu_percent: f64,
    pub memory_bytes: u64,
}

/// A network interface visible in the system snapshot.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NetworkInterfaceInfo {
    pub name: String,
    #[serde(default)]
    pub address: Option<String>,
    pub rx_bytes: u64,
    pub tx_bytes: u64,
}

/// Point-in-time host telemetry.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SystemSnapshot {
    pub cpu_percent: f64,
    pub memory_used: u64,
    pub memory_total: u64,
    pub memory_percent: f64,
    pub storage_used: u64,
    pub storage_total: u64,
    pub storage_percent: f64,
    pub uptime_secs: u64,
    #[serde(default)]
    pub temperature: Option<f64>,
    #[serde(default)]
    pub local_ip: Option<String>,
    pub os_version: String,
    #[serde(default)]
    pub load_average: Option<(f64, f64, f64)>,
    #[serde(default)]
    pub top_processes: Vec<ProcessInfo>,
    #[serde(default)]
    pub interfaces: Vec<NetworkInterfaceInfo>,
    /// Resident set size of this agent process (healthcheck input).
    pub process_rss_bytes: u64,
}

/// Host metrics collaborator (sysinfo in production, fixed values in tests).
#[async_trait]
pub trait SystemProbe: Send + Sync {
    async fn snapshot(&self) -> Result<SystemSnapshot, DomainError>;

    /// Hostname is effectively static and may be cached forever.
    fn hostname(&self) -> String;

    fn cpu_cores(&self) -> usize;
}
