use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::current::ObservedService;
use super::target::Service;

/// One atomic, idempotent operation against the container runtime or its
/// associated resources. Each variant carries the minimum context needed to
/// execute without consulting the planner again.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "action")]
pub enum CompositionStep {
    TakeLock { app_id: String, force: bool },
    ReleaseLock { app_id: String },
    CreateNetwork { name: String },
    RemoveNetwork { name: String },
    CreateVolume { name: String },
    RemoveVolume { name: String },
    Fetch { image: String },
    RemoveImage { image: String },
    Start { app_id: String, service: Service },
    Stop { app_id: String, service_name: String },
    Kill { app_id: String, service_name: String },
    Remove { app_id: String, service_name: String },
    UpdateMetadata { app_id: String, service: Service },
}

impl CompositionStep {
    /// The app this step belongs to, when scoped to one.
    pub fn app_id(&self) -> Option<&str> {
        match self {
            Self::TakeLock { app_id, .. }
            | Self::ReleaseLock { app_id }
            | Self::Start { app_id, .. }
            | Self::Stop { app_id, .. }
            | Self::Kill { app_id, .. }
            | Self::Remove { app_id, .. }
            | Self::UpdateMetadata { app_id, .. } => Some(app_id),
            _ => None,
        }
    }

    pub fn action(&self) -> &'static str {
        match self {
            Self::TakeLock { .. } => "takeLock",
            Self::ReleaseLock { .. } => "releaseLock",
            Self::CreateNetwork { .. } => "createNetwork",
            Self::RemoveNetwork { .. } => "removeNetwork",
            Self::CreateVolume { .. } => "createVolume",
            Self::RemoveVolume { .. } => "removeVolume",
            Self::Fetch { .. } => "fetch",
            Self::RemoveImage { .. } => "removeImage",
            Self::Start { .. } => "start",
            Self::Stop { .. } => "stop",
            Self::Kill { .. } => "kill",
            Self::Remove { .. } => "remove",
            Self::UpdateMetadata { .. } => "updateMetadata",
        }
    }

    /// Destructive steps must execute under the app lock.
    pub fn is_destructive(&self) -> bool {
        matches!(
            self,
            Self::Stop { .. } | Self::Kill { .. } | Self::Remove { .. } | Self::RemoveVolume { .. }
        )
    }
}

/// How a changed service is swapped to its new definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UpdateStrategy {
    /// Pull the new image while the old container keeps running, then swap.
    DownloadThenKill,
    /// Stop the old container first (port/volume conflicts), then pull.
    KillThenDownload,
    /// Tear down containers and attached resources before pulling.
    DeleteThenDownload,
    /// Start the new container before stopping the old one. Only selected
    /// when the service declares it.
    Handover,
}

impl UpdateStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DownloadThenKill => "download-then-kill",
            Self::KillThenDownload => "kill-then-download",
            Self::DeleteThenDownload => "delete-then-download",
            Self::Handover => "handover",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "download-then-kill" => Some(Self::DownloadThenKill),
            "kill-then-download" => Some(Self::KillThenDownload),
            "delete-then-download" => Some(Self::DeleteThenDownload),
            "handover" => Some(Self::Handover),
            _ => None,
        }
    }

    /// Strategy selection driven by the diff: image-only changes keep the old
    /// container alive during the pull; port/volume changes must stop first;
    /// topology changes tear down; handover only when declared.
    pub fn select(diff: &ServiceDiff) -> Self {
        if let Some(declared) = diff.declared {
            return declared;
        }
        if diff.networks_changed {
            return Self::DeleteThenDownload;
        }
        if diff.ports_changed || diff.volumes_changed {
            return Self::KillThenDownload;
        }
        Self::DownloadThenKill
    }
}

/// Field-wise comparison between a target service and its observed
/// counterpart.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ServiceDiff {
    pub image_changed: bool,
    pub env_changed: bool,
    pub ports_changed: bool,
    pub volumes_changed: bool,
    pub networks_changed: bool,
    pub labels_changed: bool,
    pub status_changed: bool,
    pub declared: Option<UpdateStrategy>,
}

impl ServiceDiff {
    pub fn compute(target: &Service, current: &ObservedService) -> Self {
        let cfg = &target.container_config;

        let image_changed = target.image_name != current.image;
        // The runtime injects extra environment (PATH etc.); only keys the
        // target sets are compared.
        let env_changed = cfg
            .environment
            .iter()
            .any(|(k, v)| current.environment.get(k) != Some(v));
        let ports_changed = !same_set(&cfg.ports, &current.ports);
        let volumes_changed = !same_set(&cfg.volumes, &current.volumes);
        // A service with no declared networks lands on the runtime default
        // network; that is not a topology change.
        let networks_changed = if cfg.networks.is_empty() {
            false
        } else {
            let observed: Vec<String> = current
                .networks
                .iter()
                .filter(|n| !matches!(n.as_str(), "bridge" | "host" | "none" | "default"))
                .cloned()
                .collect();
            !same_set(&cfg.networks, &observed)
        };
        let labels_changed = labels_differ(&cfg.labels, &current.labels);
        let status_changed = target.wants_running() != current.status.is_running();

        let declared = target
            .declared_update_strategy()
            .and_then(UpdateStrategy::parse);

        Self {
            image_changed,
            env_changed,
            ports_changed,
            volumes_changed,
            networks_changed,
            labels_changed,
            status_changed,
            declared,
        }
    }

    /// Anything that requires replacing the container.
    pub fn requires_recreate(&self) -> bool {
        self.image_changed
            || self.env_changed
            || self.ports_changed
            || self.volumes_changed
            || self.networks_changed
    }

    /// Only labels or other non-runtime attributes differ.
    pub fn is_metadata_only(&self) -> bool {
        !self.requires_recreate() && !self.status_changed && self.labels_changed
    }

    pub fn is_unchanged(&self) -> bool {
        !self.requires_recreate() && !self.status_changed && !self.labels_changed
    }
}

fn same_set(a: &[String], b: &[String]) -> bool {
    let mut a: Vec<_> = a.to_vec();
    let mut b: Vec<_> = b.to_vec();
    a.sort();
    b.sort();
    a == b
}

fn labels_differ(target: &BTreeMap<String, String>, current: &BTreeMap<String, String>) -> bool {
    // Agent-owned labels are managed by the executor, not the user config.
    target
        .iter()
        .filter(|(k, _)| !k.starts_with("io.lattice."))
        .any(|(k, v)| current.get(k) != Some(v))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::ContainerSpec;
    use crate::state::current::ServiceStatus;

    fn target_service(image: &str) -> Service {
        Service {
            service_id: "1".into(),
            service_name: "web".into(),
            image_name: image.into(),
            status: "running".into(),
            container_config: ContainerSpec {
                ports: vec!["8080:80".into()],
                ..Default::default()
            },
        }
    }

    fn observed(image: &str) -> ObservedService {
        ObservedService {
            service_id: "1".into(),
            service_name: "web".into(),
            image: image.into(),
            status: ServiceStatus::Running,
            ports: vec!["8080:80".into()],
            ..Default::default()
        }
    }

    #[test]
    fn test_image_only_diff_selects_download_then_kill() {
        let diff = ServiceDiff::compute(&target_service("nginx:1.25"), &observed("nginx:1.24"));
        assert!(diff.image_changed);
        assert!(!diff.ports_changed);
        assert_eq!(UpdateStrategy::select(&diff), UpdateStrategy::DownloadThenKill);
    }

    #[test]
    fn test_port_change_selects_kill_then_download() {
        let mut target = target_service("nginx:1.25");
        target.container_config.ports = vec!["9090:80".into()];
        let diff = ServiceDiff::compute(&target, &observed("nginx:1.25"));
        assert!(diff.ports_changed);
        assert_eq!(UpdateStrategy::select(&diff), UpdateStrategy::KillThenDownload);
    }

    #[test]
    fn test_network_change_selects_delete_then_download() {
        let mut target = target_service("nginx:1.25");
        target.container_config.networks = vec!["backend".into()];
        let diff = ServiceDiff::compute(&target, &observed("nginx:1.25"));
        assert!(diff.networks_changed);
        assert_eq!(
            UpdateStrategy::select(&diff),
            UpdateStrategy::DeleteThenDownload
        );
    }

    #[test]
    fn test_declared_handover_wins() {
        let mut target = target_service("nginx:1.25");
        target
            .container_config
            .labels
            .insert("io.lattice.update-strategy".into(), "handover".into());
        let diff = ServiceDiff::compute(&target, &observed("nginx:1.24"));
        assert_eq!(UpdateStrategy::select(&diff), UpdateStrategy::Handover);
    }

    #[test]
    fn test_identical_service_is_unchanged() {
        let diff = ServiceDiff::compute(&target_service("nginx:1.25"), &observed("nginx:1.25"));
        assert!(diff.is_unchanged());
    }

    #[test]
    fn test_label_only_change_is_metadata() {
        let mut target = target_service("nginx:1.25");
        target
            .container_config
            .labels
            .insert("tier".into(), "frontend".into());
        let diff = ServiceDiff::compute(&target, &observed("nginx:1.25"));
        assert!(diff.is_metadata_only());
    }

    #[test]
    fn test_runtime_injected_env_is_ignored() {
        let target = target_service("nginx:1.25");
        let mut current = observed("nginx:1.25");
        current
            .environment
            .insert("PATH".into(), "/usr/bin".into());
        let diff = ServiceDiff::compute(&target, &current);
        assert!(!diff.env_changed);
    }
}
