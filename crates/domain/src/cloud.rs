use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::DomainError;
use crate::event::ConnectionStatus;
use crate::identity::BrokerConfig;
use crate::state::{CurrentState, DeviceConfig, TargetStateDocument};

/// Registration request body (`POST /device/register`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterRequest {
    pub uuid: String,
    #[serde(rename = "deviceName")]
    pub device_name: String,
    #[serde(rename = "deviceType")]
    pub device_type: String,
    #[serde(rename = "deviceKey")]
    pub device_key: String,
    #[serde(rename = "applicationId", skip_serializing_if = "Option::is_none")]
    pub application_id: Option<String>,
    #[serde(rename = "macAddress", skip_serializing_if = "Option::is_none")]
    pub mac_address: Option<String>,
    #[serde(rename = "osVersion", skip_serializing_if = "Option::is_none")]
    pub os_version: Option<String>,
    #[serde(rename = "agentVersion", skip_serializing_if = "Option::is_none")]
    pub agent_version: Option<String>,
}

/// MQTT section of a registration response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MqttProvision {
    pub username: String,
    pub password: String,
    pub broker: String,
    #[serde(rename = "brokerConfig", default)]
    pub broker_config: Option<serde_json::Value>,
}

impl MqttProvision {
    pub fn to_broker_config(&self) -> BrokerConfig {
        let ca_cert = self
            .broker_config
            .as_ref()
            .and_then(|c| c.get("caCert"))
            .and_then(|v| v.as_str())
            .map(String::from);
        let verify_certificate = self
            .broker_config
            .as_ref()
            .and_then(|c| c.get("verifyCertificate"))
            .and_then(|v| v.as_bool())
            .unwrap_or(true);
        BrokerConfig {
            url: self.broker.clone(),
            username: self.username.clone(),
            password: self.password.clone(),
            ca_cert,
            verify_certificate,
        }
    }
}

/// Registration response body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterResponse {
    pub id: serde_json::Value,
    pub uuid: String,
    #[serde(rename = "deviceName", default)]
    pub device_name: Option<String>,
    #[serde(rename = "deviceType", default)]
    pub device_type: Option<String>,
    #[serde(rename = "applicationId", default)]
    pub application_id: Option<String>,
    #[serde(default)]
    pub mqtt: Option<MqttProvision>,
    #[serde(default)]
    pub api: Option<serde_json::Value>,
    #[serde(rename = "vpnConfig", default)]
    pub vpn_config: Option<serde_json::Value>,
    #[serde(rename = "createdAt", default)]
    pub created_at: Option<DateTime<Utc>>,
}

impl RegisterResponse {
    /// The server id as a string regardless of wire type.
    pub fn device_id(&self) -> String {
        match &self.id {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }
}

/// Outcome of a registration attempt; a duplicate uuid (409) is handled as
/// "already registered" and lets provisioning resume at key exchange.
#[derive(Debug, Clone)]
pub enum RegisterOutcome {
    Registered(RegisterResponse),
    AlreadyRegistered,
}

/// Outcome of one target-state poll.
#[derive(Debug, Clone)]
pub enum PollOutcome {
    Changed {
        document: TargetStateDocument,
        etag: Option<String>,
    },
    NotModified,
}

/// Current-state report body (`POST /device/{uuid}/state`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StateReport {
    pub apps: CurrentState,
    pub config: DeviceConfig,
    pub version: u64,
    pub cpu_usage: f64,
    pub memory_usage: u64,
    pub memory_total: u64,
    pub storage_usage: u64,
    pub storage_total: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    pub is_online: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub local_ip: Option<String>,
    pub os_version: String,
    pub agent_version: String,
    pub uptime: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub anomaly_summary: Option<serde_json::Value>,
}

/// Point-in-time view of the sync plane.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionHealth {
    pub status: ConnectionStatus,
    pub last_poll_at: Option<DateTime<Utc>>,
    pub last_report_at: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
    pub next_attempt_at: Option<DateTime<Utc>>,
}

impl Default for ConnectionHealth {
    fn default() -> Self {
        Self {
            status: ConnectionStatus::Offline,
            last_poll_at: None,
            last_report_at: None,
            consecutive_failures: 0,
            next_attempt_at: None,
        }
    }
}

/// The cloud control plane as seen from the device (external HTTP peer).
#[cfg_attr(any(test, feature = "mockall"), mockall::automock)]
#[async_trait]
pub trait ControlPlane: Send + Sync {
    /// Phase 1: register with the fleet-wide provisioning key.
    async fn register(
        &self,
        provisioning_key: &str,
        request: &RegisterRequest,
    ) -> Result<RegisterOutcome, DomainError>;

    /// Phase 2: prove possession of the per-device key.
    async fn exchange_key(&self, uuid: &str, device_key: &str) -> Result<(), DomainError>;

    /// Long-poll the target state, honoring the ETag cache.
    async fn fetch_target_state(
        &self,
        uuid: &str,
        device_key: &str,
        etag: Option<String>,
    ) -> Result<PollOutcome, DomainError>;

    /// Push a current-state report.
    async fn report_state(
        &self,
        uuid: &str,
        device_key: &str,
        report: &StateReport,
    ) -> Result<(), DomainError>;

    /// Remove the device from the control plane (factory reset).
    async fn deprovision(&self, uuid: &str, device_key: &str) -> Result<(), DomainError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_response_numeric_id() {
        let json = serde_json::json!({
            "id": 42,
            "uuid": "u-1",
            "mqtt": {"username": "u", "password": "p", "broker": "mqtts://b:8883"}
        });
        let resp: RegisterResponse = serde_json::from_value(json).unwrap();
        assert_eq!(resp.device_id(), "42");
        let broker = resp.mqtt.unwrap().to_broker_config();
        assert_eq!(broker.url, "mqtts://b:8883");
        assert!(broker.verify_certificate);
    }

    #[test]
    fn test_state_report_omits_absent_optionals() {
        let report = StateReport {
            os_version: "linux".into(),
            agent_version: "1.0.0".into(),
            ..Default::default()
        };
        let json = serde_json::to_string(&report).unwrap();
        assert!(!json.contains("temperature"));
        assert!(!json.contains("anomaly_summary"));
    }
}
