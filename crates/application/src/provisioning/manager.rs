use std::sync::Arc;

use async_trait::async_trait;
use rand::RngCore;
use tokio::sync::{RwLock, broadcast};
use tracing::{info, warn};

use domain::DomainError;
use domain::cloud::{ControlPlane, RegisterOutcome, RegisterRequest};
use domain::event::AgentEvent;
use domain::identity::DeviceIdentity;
use domain::store::DeviceStore;

/// Static device facts used when creating or repairing the identity.
#[derive(Debug, Clone)]
pub struct ProvisionSettings {
    pub device_name: String,
    pub device_type: String,
    pub agent_version: String,
    pub provisioning_key: Option<String>,
    pub api_endpoint: Option<String>,
    pub application_id: Option<String>,
    pub mac_address: Option<String>,
    pub os_version: Option<String>,
}

/// Optional collaborator invoked after successful provisioning when the
/// registration response carries a VPN config. Failures are non-fatal.
#[async_trait]
pub trait PostProvisionHook: Send + Sync {
    async fn on_provisioned(&self, vpn_config: &serde_json::Value) -> Result<(), DomainError>;
}

/// Default hook: log and move on. Actual VPN setup is an external script.
pub struct LoggingPostProvisionHook;

#[async_trait]
impl PostProvisionHook for LoggingPostProvisionHook {
    async fn on_provisioned(&self, vpn_config: &serde_json::Value) -> Result<(), DomainError> {
        info!(config = %vpn_config, "VPN config received, no hook configured");
        Ok(())
    }
}

/// Generate a fresh per-device credential: 32 random bytes, hex-encoded.
pub fn generate_device_key() -> String {
    let mut bytes = [0u8; 32];
    rand::rng().fill_bytes(&mut bytes);
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// Owns the device identity and the two-phase registration protocol.
///
/// Any step failure leaves the device resumable: the provisioning key is
/// only erased after both remote calls succeed.
pub struct DeviceManager {
    store: Arc<dyn DeviceStore>,
    cloud: Arc<dyn ControlPlane>,
    hook: Arc<dyn PostProvisionHook>,
    events: broadcast::Sender<AgentEvent>,
    identity: RwLock<Option<DeviceIdentity>>,
}

impl DeviceManager {
    pub fn new(
        store: Arc<dyn DeviceStore>,
        cloud: Arc<dyn ControlPlane>,
        hook: Arc<dyn PostProvisionHook>,
        events: broadcast::Sender<AgentEvent>,
    ) -> Self {
        Self {
            store,
            cloud,
            hook,
            events,
            identity: RwLock::new(None),
        }
    }

    /// Load the identity from the store, creating or repairing it as needed.
    /// The uuid is generated exactly once and never changes afterward.
    pub async fn initialize(
        &self,
        settings: &ProvisionSettings,
    ) -> Result<DeviceIdentity, DomainError> {
        let mut identity = match self.store.load_device().await? {
            Some(existing) => existing,
            None => {
                let identity = DeviceIdentity::generate(
                    uuid::Uuid::new_v4().to_string(),
                    generate_device_key(),
                    settings.device_name.clone(),
                    settings.device_type.clone(),
                    settings.agent_version.clone(),
                    settings.provisioning_key.clone(),
                    settings.api_endpoint.clone(),
                );
                info!(uuid = %identity.uuid, "🆕 Created device identity");
                identity
            }
        };

        // A factory reset leaves only the uuid behind; regenerate the key
        // before any cloud contact.
        if !identity.has_device_key() {
            identity.device_key = generate_device_key();
            identity.device_name = settings.device_name.clone();
            identity.device_type = settings.device_type.clone();
            info!(uuid = %identity.uuid, "🔑 Regenerated device key after factory reset");
        }

        // Adopt a newly-supplied provisioning key when unprovisioned.
        if !identity.provisioned
            && identity.provisioning_key.is_none()
            && settings.provisioning_key.is_some()
        {
            identity.provisioning_key = settings.provisioning_key.clone();
        }
        if identity.api_endpoint.is_none() {
            identity.api_endpoint = settings.api_endpoint.clone();
        }
        identity.update_agent_version(&settings.agent_version);

        self.store.save_device(&identity).await?;
        *self.identity.write().await = Some(identity.clone());
        Ok(identity)
    }

    pub async fn identity(&self) -> Result<DeviceIdentity, DomainError> {
        self.identity
            .read()
            .await
            .clone()
            .ok_or(DomainError::NotInitialized)
    }

    pub async fn is_provisioned(&self) -> bool {
        self.identity
            .read()
            .await
            .as_ref()
            .map(|i| i.provisioned)
            .unwrap_or(false)
    }

    async fn persist(&self, identity: &DeviceIdentity) -> Result<(), DomainError> {
        self.store.save_device(identity).await?;
        *self.identity.write().await = Some(identity.clone());
        Ok(())
    }

    /// Run the three-phase protocol: register, key exchange, key retirement.
    pub async fn provision(
        &self,
        settings: &ProvisionSettings,
    ) -> Result<DeviceIdentity, DomainError> {
        let mut identity = self.identity().await?;

        if identity.provisioned {
            return Ok(identity);
        }
        let provisioning_key = identity
            .provisioning_key
            .clone()
            .ok_or_else(|| DomainError::BadRequest("no provisioning key configured".into()))?;

        // Phase 1: register with the fleet credential.
        let request = RegisterRequest {
            uuid: identity.uuid.clone(),
            device_name: identity.device_name.clone(),
            device_type: identity.device_type.clone(),
            device_key: identity.device_key.clone(),
            application_id: settings.application_id.clone(),
            mac_address: settings.mac_address.clone(),
            os_version: settings.os_version.clone(),
            agent_version: Some(identity.agent_version.clone()),
        };

        let mut vpn_config = None;
        match self.cloud.register(&provisioning_key, &request).await? {
            RegisterOutcome::Registered(response) => {
                info!(device_id = %response.device_id(), "✅ Registered with control plane");
                let broker = response.mqtt.as_ref().map(|m| m.to_broker_config());
                vpn_config = response.vpn_config.clone();
                identity.apply_registration(
                    response.device_id(),
                    response.device_name.clone(),
                    broker,
                );
                self.persist(&identity).await?;
            }
            RegisterOutcome::AlreadyRegistered => {
                // Idempotent recovery: a previous run got this far. The
                // device key still matches, so proceed to key exchange.
                info!(uuid = %identity.uuid, "Device already registered, resuming at key exchange");
            }
        }

        // Phase 2: prove the per-device credential. On failure the
        // provisioning key is kept and the device stays resumable.
        self.cloud
            .exchange_key(&identity.uuid, &identity.device_key)
            .await?;

        // Phase 3: key retirement.
        identity.retire_provisioning_key();
        self.persist(&identity).await?;
        info!(uuid = %identity.uuid, "🔒 Provisioning complete, bootstrap key retired");

        let _ = self.events.send(AgentEvent::device_provisioned(
            &identity.uuid,
            identity.device_id.clone().unwrap_or_default(),
        ));

        if let Some(vpn) = vpn_config {
            let enabled = vpn.get("enabled").and_then(|v| v.as_bool()).unwrap_or(false);
            if enabled {
                if let Err(e) = self.hook.on_provisioned(&vpn).await {
                    warn!(error = %e, "post-provision hook failed (non-fatal)");
                }
            }
        }

        Ok(identity)
    }

    /// Operate without a cloud endpoint.
    pub async fn mark_local_mode(&self) -> Result<DeviceIdentity, DomainError> {
        let mut identity = self.identity().await?;
        identity.mark_local_mode();
        self.persist(&identity).await?;
        Ok(identity)
    }

    /// Clear server-assigned fields, keep uuid and device key.
    pub async fn reset(&self) -> Result<DeviceIdentity, DomainError> {
        let mut identity = self.identity().await?;
        identity.reset();
        self.persist(&identity).await?;
        info!(uuid = %identity.uuid, "Device reset to unprovisioned state");
        Ok(identity)
    }

    /// Best-effort cloud deprovision, then wipe everything except the uuid.
    pub async fn factory_reset(&self) -> Result<(), DomainError> {
        let mut identity = self.identity().await?;

        if identity.provisioned {
            if let Err(e) = self
                .cloud
                .deprovision(&identity.uuid, &identity.device_key)
                .await
            {
                warn!(error = %e, "cloud deprovision failed, continuing factory reset");
            }
        }

        identity.factory_reset();
        self.store.save_device(&identity).await?;
        self.store.clear_workload_state().await?;
        *self.identity.write().await = Some(identity);
        info!("🏭 Factory reset complete");
        Ok(())
    }

    pub async fn update_agent_version(&self, version: &str) -> Result<(), DomainError> {
        let mut identity = self.identity().await?;
        identity.update_agent_version(version);
        self.persist(&identity).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_key_is_64_hex_chars() {
        let key = generate_device_key();
        assert_eq!(key.len(), 64);
        assert!(key.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(key, generate_device_key());
    }
}
