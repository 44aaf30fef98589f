use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

mod publisher;
pub use publisher::EventPublisher;

use crate::anomaly::Alert;
use crate::sensor::SensorFrame;
use crate::state::TargetSource;

/// Cloud link status as exposed through connection health.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Connected,
    Degraded,
    Offline,
}

impl ConnectionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Connected => "connected",
            Self::Degraded => "degraded",
            Self::Offline => "offline",
        }
    }
}

/// Domain events broadcast between components.
///
/// Subscribers receive these over a broadcast channel owned by the
/// coordinator; every subscriber has an explicit lifecycle (subscribe on
/// start, drop the receiver on shutdown).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum AgentEvent {
    /// A new target state was adopted (validated and persisted).
    TargetStateChanged {
        version: u64,
        source: TargetSource,
        timestamp: DateTime<Utc>,
    },

    /// Two-phase provisioning completed.
    DeviceProvisioned {
        uuid: String,
        device_id: String,
        timestamp: DateTime<Utc>,
    },

    /// The control plane rejected our device key (401/403).
    AuthRevoked {
        context: String,
        timestamp: DateTime<Utc>,
    },

    /// The control plane no longer knows this device (404).
    DeviceUnknown { timestamp: DateTime<Utc> },

    /// One poll cycle worth of frames from a field device.
    SensorBatch {
        device_name: String,
        frames: Vec<SensorFrame>,
        timestamp: DateTime<Utc>,
    },

    /// A new or updated anomaly alert.
    AnomalyDetected { alert: Alert },

    /// Cloud connection health transition.
    ConnectionChanged {
        status: ConnectionStatus,
        timestamp: DateTime<Utc>,
    },

    /// Periodic liveness signal.
    AgentHeartbeat {
        uptime_secs: u64,
        agent_version: String,
        timestamp: DateTime<Utc>,
    },
}

impl AgentEvent {
    pub fn target_state_changed(version: u64, source: TargetSource) -> Self {
        Self::TargetStateChanged {
            version,
            source,
            timestamp: Utc::now(),
        }
    }

    pub fn device_provisioned(uuid: impl Into<String>, device_id: impl Into<String>) -> Self {
        Self::DeviceProvisioned {
            uuid: uuid.into(),
            device_id: device_id.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn auth_revoked(context: impl Into<String>) -> Self {
        Self::AuthRevoked {
            context: context.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn device_unknown() -> Self {
        Self::DeviceUnknown {
            timestamp: Utc::now(),
        }
    }

    pub fn sensor_batch(device_name: impl Into<String>, frames: Vec<SensorFrame>) -> Self {
        Self::SensorBatch {
            device_name: device_name.into(),
            frames,
            timestamp: Utc::now(),
        }
    }

    pub fn connection_changed(status: ConnectionStatus) -> Self {
        Self::ConnectionChanged {
            status,
            timestamp: Utc::now(),
        }
    }

    pub fn agent_heartbeat(uptime_secs: u64, agent_version: impl Into<String>) -> Self {
        Self::AgentHeartbeat {
            uptime_secs,
            agent_version: agent_version.into(),
            timestamp: Utc::now(),
        }
    }

    /// Get the event type as string
    pub fn event_type(&self) -> &str {
        match self {
            Self::TargetStateChanged { .. } => "TargetStateChanged",
            Self::DeviceProvisioned { .. } => "DeviceProvisioned",
            Self::AuthRevoked { .. } => "AuthRevoked",
            Self::DeviceUnknown { .. } => "DeviceUnknown",
            Self::SensorBatch { .. } => "SensorBatch",
            Self::AnomalyDetected { .. } => "AnomalyDetected",
            Self::ConnectionChanged { .. } => "ConnectionChanged",
            Self::AgentHeartbeat { .. } => "AgentHeartbeat",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_target_state_changed_event() {
        let event = AgentEvent::target_state_changed(7, TargetSource::Cloud);
        assert_eq!(event.event_type(), "TargetStateChanged");
        match event {
            AgentEvent::TargetStateChanged {
                version, source, ..
            } => {
                assert_eq!(version, 7);
                assert_eq!(source, TargetSource::Cloud);
            }
            _ => panic!("Wrong event type"),
        }
    }

    #[test]
    fn test_event_serialization() {
        let event = AgentEvent::auth_revoked("poll");
        let json = serde_json::to_string(&event).unwrap();
        let back: AgentEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back.event_type(), "AuthRevoked");
    }
}
