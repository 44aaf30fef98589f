use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::state::ServiceStatus;

/// Errors surfaced by the container runtime collaborator.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RuntimeError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Runtime unavailable: {0}")]
    Unavailable(String),

    #[error("Image pull failed: {0}")]
    ImagePullFailed(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Runtime error: {0}")]
    Other(String),
}

/// Everything needed to create one container for a service.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
    /// Port mappings as `host:container` strings.
    #[serde(default)]
    pub ports: Vec<String>,
    #[serde(default)]
    pub networks: Vec<String>,
    /// Volume mounts as `name-or-path:container-path` strings.
    #[serde(default)]
    pub volumes: Vec<String>,
    #[serde(default)]
    pub restart_policy: Option<String>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub command: Option<Vec<String>>,
    #[serde(default)]
    pub privileged: bool,
}

/// One container as observed at the runtime.
#[derive(Debug, Clone, Default)]
pub struct ContainerSummary {
    pub id: String,
    pub name: String,
    pub image: String,
    pub image_digest: Option<String>,
    pub status: ServiceStatus,
    pub environment: BTreeMap<String, String>,
    pub ports: Vec<String>,
    pub networks: Vec<String>,
    pub volumes: Vec<String>,
    pub labels: BTreeMap<String, String>,
}

/// Narrow interface to the container runtime (external collaborator).
///
/// The reconciler is agnostic to the implementation behind this trait; every
/// call must be safe to repeat (idempotency is enforced by the step
/// executor on top of the error classification here).
#[cfg_attr(any(test, feature = "mockall"), mockall::automock)]
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Cheap reachability probe.
    async fn ping(&self) -> Result<(), RuntimeError>;

    /// List containers carrying the given label (`key=value` selector).
    async fn list_containers(&self, label_selector: &str)
    -> Result<Vec<ContainerSummary>, RuntimeError>;

    /// Create a container and return its id.
    async fn create_container(&self, spec: &ContainerSpec) -> Result<String, RuntimeError>;

    async fn start_container(&self, id: &str) -> Result<(), RuntimeError>;

    async fn stop_container(&self, id: &str, timeout_secs: u64) -> Result<(), RuntimeError>;

    async fn kill_container(&self, id: &str) -> Result<(), RuntimeError>;

    async fn remove_container(&self, id: &str, force: bool) -> Result<(), RuntimeError>;

    async fn rename_container(&self, id: &str, name: &str) -> Result<(), RuntimeError>;

    async fn pull_image(&self, image: &str) -> Result<(), RuntimeError>;

    async fn image_present(&self, image: &str) -> Result<bool, RuntimeError>;

    async fn remove_image(&self, image: &str) -> Result<(), RuntimeError>;

    async fn create_network(&self, name: &str) -> Result<(), RuntimeError>;

    async fn remove_network(&self, name: &str) -> Result<(), RuntimeError>;

    async fn create_volume(&self, name: &str) -> Result<(), RuntimeError>;

    async fn remove_volume(&self, name: &str) -> Result<(), RuntimeError>;

    /// Fetch the last `tail` log lines of a container.
    async fn container_logs(&self, id: &str, tail: usize) -> Result<Vec<String>, RuntimeError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_runtime_error_display() {
        let e = RuntimeError::ImagePullFailed("nginx:1.25".into());
        assert_eq!(e.to_string(), "Image pull failed: nginx:1.25");
    }

    #[test]
    fn test_container_spec_roundtrip() {
        let spec = ContainerSpec {
            name: "1001_web".into(),
            image: "nginx:1.25".into(),
            ports: vec!["8080:80".into()],
            ..Default::default()
        };
        let json = serde_json::to_string(&spec).unwrap();
        let back: ContainerSpec = serde_json::from_str(&json).unwrap();
        assert_eq!(spec, back);
    }
}
