use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::DomainError;
use crate::runtime::ContainerSpec;

/// Where a target state update came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TargetSource {
    Cloud,
    Local,
    Store,
}

/// One service of an app: a single container derived from an image.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Service {
    #[serde(rename = "serviceId")]
    pub service_id: String,
    #[serde(rename = "serviceName")]
    pub service_name: String,
    #[serde(rename = "imageName")]
    pub image_name: String,
    /// Desired runtime status ("running" unless specified otherwise).
    #[serde(default = "default_service_status")]
    pub status: String,
    #[serde(rename = "containerConfig", default)]
    pub container_config: ContainerSpec,
}

fn default_service_status() -> String {
    "running".to_string()
}

impl Service {
    pub fn wants_running(&self) -> bool {
        self.status.eq_ignore_ascii_case("running")
    }

    /// Stable hash of the full service definition. Stamped onto containers
    /// as a label so the executor can tell the old container from the new
    /// one without consulting the previous target.
    pub fn config_hash(&self) -> String {
        use std::hash::{Hash, Hasher};
        let canonical = serde_json::to_string(self).unwrap_or_default();
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        canonical.hash(&mut hasher);
        format!("{:016x}", hasher.finish())
    }

    /// The update strategy declared in the container config, if any.
    pub fn declared_update_strategy(&self) -> Option<&str> {
        self.container_config
            .labels
            .get("io.lattice.update-strategy")
            .map(String::as_str)
    }
}

/// A deployable application: a named group of services.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct App {
    pub name: String,
    #[serde(default)]
    pub services: Vec<Service>,
}

/// Effective device configuration: four sub-sections that the cloud may
/// update independently of each other.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct DeviceConfig {
    #[serde(default)]
    pub logging: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub sensors: Vec<serde_json::Value>,
    #[serde(default)]
    pub features: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub settings: BTreeMap<String, serde_json::Value>,
}

/// Partial configuration document as received from the cloud. Absent
/// sub-sections leave the stored value untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ConfigPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logging: Option<BTreeMap<String, serde_json::Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sensors: Option<Vec<serde_json::Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub features: Option<BTreeMap<String, serde_json::Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub settings: Option<BTreeMap<String, serde_json::Value>>,
}

impl DeviceConfig {
    /// Key-wise subset merge: only sub-sections present in the patch replace
    /// the stored value; the siblings keep their prior content.
    pub fn merge_from(&mut self, patch: ConfigPatch) {
        if let Some(logging) = patch.logging {
            self.logging = logging;
        }
        if let Some(sensors) = patch.sensors {
            self.sensors = sensors;
        }
        if let Some(features) = patch.features {
            self.features = features;
        }
        if let Some(settings) = patch.settings {
            self.settings = settings;
        }
    }

    fn settings_u64(&self, key: &str) -> Option<u64> {
        self.settings.get(key).and_then(|v| v.as_u64())
    }

    /// Poll cadence may be adjusted by the target state itself.
    pub fn poll_interval_ms(&self) -> Option<u64> {
        self.settings_u64("targetStatePollIntervalMs")
    }

    pub fn report_interval_ms(&self) -> Option<u64> {
        self.settings_u64("deviceReportIntervalMs")
    }

    pub fn reconcile_interval_ms(&self) -> Option<u64> {
        self.settings_u64("reconciliationIntervalMs")
    }

    /// Scheduled restart instant, RFC 3339.
    pub fn restart_at(&self) -> Option<DateTime<Utc>> {
        self.settings
            .get("restartAt")
            .and_then(|v| v.as_str())
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&Utc))
    }

    pub fn feature_enabled(&self, name: &str) -> bool {
        self.features
            .get(name)
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
    }
}

/// The declarative, cloud-owned desired state for this device.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TargetState {
    #[serde(default)]
    pub apps: BTreeMap<String, App>,
    #[serde(default)]
    pub config: DeviceConfig,
    #[serde(default)]
    pub version: u64,
    #[serde(default)]
    pub needs_deployment: bool,
    #[serde(default)]
    pub last_deployed_at: Option<DateTime<Utc>>,
}

/// Wire form of a poll response body: apps replace wholesale, config is a
/// subset patch.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TargetStateDocument {
    #[serde(default)]
    pub apps: BTreeMap<String, App>,
    #[serde(default)]
    pub config: ConfigPatch,
    #[serde(default)]
    pub version: u64,
    #[serde(default)]
    pub needs_deployment: bool,
    #[serde(default)]
    pub last_deployed_at: Option<DateTime<Utc>>,
}

impl TargetState {
    /// Fold a cloud document into the stored target: apps are replaced as a
    /// whole (absence means undeploy), config is merged key-wise.
    pub fn apply_document(&mut self, doc: TargetStateDocument) {
        self.apps = doc.apps;
        self.config.merge_from(doc.config);
        self.version = doc.version;
        self.needs_deployment = doc.needs_deployment;
        self.last_deployed_at = doc.last_deployed_at;
    }

    /// Structural validation; an invalid document must never replace a valid
    /// stored target.
    pub fn validate(&self) -> Result<(), DomainError> {
        for (app_id, app) in &self.apps {
            if app_id.is_empty() {
                return Err(DomainError::InvalidTargetState("empty app id".into()));
            }
            let mut seen = std::collections::BTreeSet::new();
            for service in &app.services {
                if service.service_name.is_empty() {
                    return Err(DomainError::InvalidTargetState(format!(
                        "app {app_id}: service with empty name"
                    )));
                }
                if service.image_name.is_empty() {
                    return Err(DomainError::InvalidTargetState(format!(
                        "app {app_id}/{}: empty image name",
                        service.service_name
                    )));
                }
                if !seen.insert(&service.service_name) {
                    return Err(DomainError::InvalidTargetState(format!(
                        "app {app_id}: duplicate service {}",
                        service.service_name
                    )));
                }
            }
        }
        Ok(())
    }

    /// Every image referenced by the target.
    pub fn images(&self) -> Vec<String> {
        self.apps
            .values()
            .flat_map(|a| a.services.iter().map(|s| s.image_name.clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn full_config() -> DeviceConfig {
        DeviceConfig {
            logging: BTreeMap::from([("level".to_string(), json!("info"))]),
            sensors: vec![json!({"id": "s1"})],
            features: BTreeMap::from([("x".to_string(), json!(true))]),
            settings: BTreeMap::from([("tz".to_string(), json!("UTC"))]),
        }
    }

    #[test]
    fn test_subset_merge_preserves_absent_sections() {
        let mut config = full_config();

        let patch = ConfigPatch {
            logging: Some(BTreeMap::from([("level".to_string(), json!("debug"))])),
            sensors: Some(vec![json!({"id": "s1"}), json!({"id": "s2"})]),
            features: None,
            settings: None,
        };
        config.merge_from(patch);

        assert_eq!(config.logging.get("level"), Some(&json!("debug")));
        assert_eq!(config.sensors.len(), 2);
        assert_eq!(config.features.get("x"), Some(&json!(true)));
        assert_eq!(config.settings.get("tz"), Some(&json!("UTC")));
    }

    #[test]
    fn test_apply_document_replaces_apps_wholesale() {
        let mut target = TargetState {
            apps: BTreeMap::from([(
                "1001".to_string(),
                App {
                    name: "legacy".into(),
                    services: vec![],
                },
            )]),
            config: full_config(),
            version: 1,
            ..Default::default()
        };

        let doc = TargetStateDocument {
            apps: BTreeMap::new(),
            config: ConfigPatch::default(),
            version: 2,
            ..Default::default()
        };
        target.apply_document(doc);

        assert!(target.apps.is_empty(), "absent app means undeploy");
        assert_eq!(target.version, 2);
        assert_eq!(target.config.settings.get("tz"), Some(&json!("UTC")));
    }

    #[test]
    fn test_validate_rejects_empty_image() {
        let target = TargetState {
            apps: BTreeMap::from([(
                "1001".to_string(),
                App {
                    name: "main".into(),
                    services: vec![Service {
                        service_id: "1".into(),
                        service_name: "web".into(),
                        image_name: "".into(),
                        status: "running".into(),
                        container_config: ContainerSpec::default(),
                    }],
                },
            )]),
            ..Default::default()
        };
        assert!(matches!(
            target.validate(),
            Err(DomainError::InvalidTargetState(_))
        ));
    }

    #[test]
    fn test_validate_rejects_duplicate_service() {
        let svc = Service {
            service_id: "1".into(),
            service_name: "web".into(),
            image_name: "nginx:1.24".into(),
            status: "running".into(),
            container_config: ContainerSpec::default(),
        };
        let target = TargetState {
            apps: BTreeMap::from([(
                "1001".to_string(),
                App {
                    name: "main".into(),
                    services: vec![svc.clone(), svc],
                },
            )]),
            ..Default::default()
        };
        assert!(target.validate().is_err());
    }

    #[test]
    fn test_settings_accessors() {
        let config = DeviceConfig {
            settings: BTreeMap::from([
                ("targetStatePollIntervalMs".to_string(), json!(30000)),
                ("restartAt".to_string(), json!("2026-03-01T04:00:00Z")),
            ]),
            ..Default::default()
        };
        assert_eq!(config.poll_interval_ms(), Some(30000));
        assert!(config.restart_at().is_some());
        assert_eq!(config.report_interval_ms(), None);
    }
}
