use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Observed container lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum ServiceStatus {
    Pending,
    Created,
    Running,
    Stopped,
    Exited,
    #[default]
    Unknown,
}

impl ServiceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Created => "created",
            Self::Running => "running",
            Self::Stopped => "stopped",
            Self::Exited => "exited",
            Self::Unknown => "unknown",
        }
    }

    /// Map a runtime state string (docker `State`) onto the agent's view.
    pub fn from_runtime_state(state: &str) -> Self {
        match state.to_ascii_lowercase().as_str() {
            "created" => Self::Created,
            "running" | "restarting" => Self::Running,
            "paused" | "stopped" => Self::Stopped,
            "exited" | "dead" => Self::Exited,
            _ => Self::Unknown,
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(self, Self::Running)
    }
}

/// One service as currently observed at the runtime.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ObservedService {
    pub service_id: String,
    pub service_name: String,
    pub image: String,
    #[serde(default)]
    pub image_digest: Option<String>,
    #[serde(default)]
    pub container_id: Option<String>,
    pub status: ServiceStatus,
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
    #[serde(default)]
    pub ports: Vec<String>,
    #[serde(default)]
    pub networks: Vec<String>,
    #[serde(default)]
    pub volumes: Vec<String>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

/// Observed services of one app.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ObservedApp {
    #[serde(default)]
    pub services: Vec<ObservedService>,
    /// Set when repeated step failures exceeded the retry threshold; the
    /// reconciler keeps going with the other apps.
    #[serde(default)]
    pub degraded: bool,
}

/// Runtime-derived view of what is actually running. Never persisted.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct CurrentState {
    #[serde(default)]
    pub apps: BTreeMap<String, ObservedApp>,
}

impl CurrentState {
    pub fn service(&self, app_id: &str, service_name: &str) -> Option<&ObservedService> {
        self.apps
            .get(app_id)?
            .services
            .iter()
            .find(|s| s.service_name == service_name)
    }

    pub fn running_services(&self) -> usize {
        self.apps
            .values()
            .flat_map(|a| a.services.iter())
            .filter(|s| s.status.is_running())
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_from_runtime_state() {
        assert_eq!(
            ServiceStatus::from_runtime_state("running"),
            ServiceStatus::Running
        );
        assert_eq!(
            ServiceStatus::from_runtime_state("Exited"),
            ServiceStatus::Exited
        );
        assert_eq!(
            ServiceStatus::from_runtime_state("restarting"),
            ServiceStatus::Running
        );
        assert_eq!(
            ServiceStatus::from_runtime_state("weird"),
            ServiceStatus::Unknown
        );
    }

    #[test]
    fn test_service_lookup() {
        let mut state = CurrentState::default();
        state.apps.insert(
            "1001".into(),
            ObservedApp {
                services: vec![ObservedService {
                    service_name: "web".into(),
                    status: ServiceStatus::Running,
                    ..Default::default()
                }],
                degraded: false,
            },
        );

        assert!(state.service("1001", "web").is_some());
        assert!(state.service("1001", "db").is_none());
        assert!(state.service("2002", "web").is_none());
        assert_eq!(state.running_services(), 1);
    }
}
