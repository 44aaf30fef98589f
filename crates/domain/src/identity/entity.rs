use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// MQTT broker credentials handed out by the control plane at registration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BrokerConfig {
    pub url: String,
    pub username: String,
    pub password: String,
    #[serde(default)]
    pub ca_cert: Option<String>,
    #[serde(default = "default_verify_certificate")]
    pub verify_certificate: bool,
}

fn default_verify_certificate() -> bool {
    true
}

/// The device's persisted identity (singleton row in the local store).
///
/// Lifecycle rules:
/// - `uuid` is generated once at first boot and never changes afterward.
/// - `device_key` is generated locally before any contact with the cloud.
/// - `provisioning_key` is a fleet-wide bootstrap credential; it is erased
///   the moment key exchange succeeds.
/// - `reset` clears server-assigned fields but keeps `uuid` and `device_key`.
/// - `factory_reset` keeps only `uuid`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeviceIdentity {
    pub uuid: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provisioning_key: Option<String>,
    pub device_key: String,
    #[serde(default)]
    pub device_id: Option<String>,
    pub device_name: String,
    pub device_type: String,
    #[serde(default)]
    pub api_endpoint: Option<String>,
    #[serde(default)]
    pub broker: Option<BrokerConfig>,
    pub agent_version: String,
    #[serde(default)]
    pub provisioned: bool,
    #[serde(default)]
    pub local_mode: bool,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub registered_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl DeviceIdentity {
    /// Create a fresh identity for a device that has never contacted the
    /// cloud. The caller supplies the generated uuid and device key so this
    /// type stays free of randomness.
    pub fn generate(
        uuid: String,
        device_key: String,
        device_name: String,
        device_type: String,
        agent_version: String,
        provisioning_key: Option<String>,
        api_endpoint: Option<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            uuid,
            provisioning_key,
            device_key,
            device_id: None,
            device_name,
            device_type,
            api_endpoint,
            broker: None,
            agent_version,
            provisioned: false,
            local_mode: false,
            created_at: now,
            registered_at: None,
            updated_at: now,
        }
    }

    /// Apply the registration response from the control plane. The device is
    /// not provisioned yet - key exchange must still succeed.
    pub fn apply_registration(
        &mut self,
        device_id: String,
        device_name: Option<String>,
        broker: Option<BrokerConfig>,
    ) {
        self.device_id = Some(device_id);
        if let Some(name) = device_name {
            self.device_name = name;
        }
        if broker.is_some() {
            self.broker = broker;
        }
        self.updated_at = Utc::now();
    }

    /// Key retirement: erase the fleet-wide provisioning key and mark the
    /// device provisioned. Only valid after register + key exchange succeeded.
    pub fn retire_provisioning_key(&mut self) {
        self.provisioning_key = None;
        self.provisioned = true;
        let now = Utc::now();
        self.registered_at = Some(now);
        self.updated_at = now;
    }

    /// Operate without a cloud endpoint; never polls or reports.
    pub fn mark_local_mode(&mut self) {
        self.local_mode = true;
        self.provisioned = false;
        self.updated_at = Utc::now();
    }

    /// Clear server-assigned fields and broker credentials. `uuid` and
    /// `device_key` survive so the device can re-provision as itself.
    pub fn reset(&mut self) {
        self.device_id = None;
        self.broker = None;
        self.provisioned = false;
        self.registered_at = None;
        self.local_mode = false;
        self.updated_at = Utc::now();
    }

    /// Wipe everything except the uuid. The device key is cleared too; the
    /// device manager regenerates it on the next initialize.
    pub fn factory_reset(&mut self) {
        let uuid = self.uuid.clone();
        let agent_version = self.agent_version.clone();
        let now = Utc::now();
        *self = Self {
            uuid,
            provisioning_key: None,
            device_key: String::new(),
            device_id: None,
            device_name: String::new(),
            device_type: String::new(),
            api_endpoint: None,
            broker: None,
            agent_version,
            provisioned: false,
            local_mode: false,
            created_at: now,
            registered_at: None,
            updated_at: now,
        };
    }

    pub fn update_agent_version(&mut self, version: impl Into<String>) {
        self.agent_version = version.into();
        self.updated_at = Utc::now();
    }

    pub fn has_device_key(&self) -> bool {
        !self.device_key.is_empty()
    }
}
