use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::broadcast;

use application::reconciler::{ReconcilerSettings, StateReconciler};
use domain::DomainError;
use domain::identity::DeviceIdentity;
use domain::runtime::{ContainerRuntime, ContainerSpec, ContainerSummary, RuntimeError};
use domain::state::{App, Service, ServiceStatus, TargetSource, TargetState};
use domain::store::DeviceStore;

#[derive(Default)]
struct MemoryStore {
    device: Mutex<Option<DeviceIdentity>>,
    target: Mutex<Option<TargetState>>,
    meta: Mutex<HashMap<String, String>>,
}

#[async_trait]
impl DeviceStore for MemoryStore {
    async fn load_device(&self) -> Result<Option<DeviceIdentity>, DomainError> {
        Ok(self.device.lock().unwrap().clone())
    }
    async fn save_device(&self, identity: &DeviceIdentity) -> Result<(), DomainError> {
        *self.device.lock().unwrap() = Some(identity.clone());
        Ok(())
    }
    async fn load_target_state(&self) -> Result<Option<TargetState>, DomainError> {
        Ok(self.target.lock().unwrap().clone())
    }
    async fn save_target_state(&self, state: &TargetState) -> Result<(), DomainError> {
        *self.target.lock().unwrap() = Some(state.clone());
        Ok(())
    }
    async fn get_meta(&self, key: &str) -> Result<Option<String>, DomainError> {
        Ok(self.meta.lock().unwrap().get(key).cloned())
    }
    async fn set_meta(&self, key: &str, value: &str) -> Result<(), DomainError> {
        self.meta
            .lock()
            .unwrap()
            .insert(key.to_string(), value.to_string());
        Ok(())
    }
    async fn clear_workload_state(&self) -> Result<(), DomainError> {
        *self.target.lock().unwrap() = None;
        Ok(())
    }
}

#[derive(Default)]
struct FakeState {
    containers: HashMap<String, (ContainerSpec, ServiceStatus)>,
    images: HashSet<String>,
    networks: HashSet<String>,
    volumes: HashSet<String>,
    next_id: u64,
    ops: Vec<String>,
}

/// In-memory container runtime recording every operation.
#[derive(Default)]
struct FakeRuntime {
    state: Mutex<FakeState>,
    fail_pulls_matching: Mutex<Option<String>>,
}

impl FakeRuntime {
    fn ops(&self) -> Vec<String> {
        self.state.lock().unwrap().ops.clone()
    }

    fn clear_ops(&self) {
        self.state.lock().unwrap().ops.clear();
    }

    fn running_images(&self) -> Vec<String> {
        let state = self.state.lock().unwrap();
        state
            .containers
            .values()
            .filter(|(_, status)| status.is_running())
            .map(|(spec, _)| spec.image.clone())
            .collect()
    }

    fn summary(id: &str, spec: &ContainerSpec, status: ServiceStatus) -> ContainerSummary {
        ContainerSummary {
            id: id.to_string(),
            name: spec.name.clone(),
            image: spec.image.clone(),
            image_digest: None,
            status,
            environment: spec.environment.clone(),
            ports: spec.ports.clone(),
            networks: spec.networks.clone(),
            volumes: spec.volumes.clone(),
            labels: spec.labels.clone(),
        }
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn ping(&self) -> Result<(), RuntimeError> {
        Ok(())
    }

    async fn list_containers(
        &self,
        label_selector: &str,
    ) -> Result<Vec<ContainerSummary>, RuntimeError> {
        let (key, value) = label_selector.split_once('=').unwrap_or((label_selector, ""));
        let state = self.state.lock().unwrap();
        Ok(state
            .containers
            .iter()
            .filter(|(_, (spec, _))| spec.labels.get(key).map(String::as_str) == Some(value))
            .map(|(id, (spec, status))| Self::summary(id, spec, *status))
            .collect())
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String, RuntimeError> {
        let mut state = self.state.lock().unwrap();
        if state.containers.values().any(|(s, _)| s.name == spec.name) {
            return Err(RuntimeError::Conflict(spec.name.clone()));
        }
        state.next_id += 1;
        let id = format!("c{}", state.next_id);
        state.ops.push(format!("create:{}", spec.name));
        state
            .containers
            .insert(id.clone(), (spec.clone(), ServiceStatus::Created));
        Ok(id)
    }

    async fn start_container(&self, id: &str) -> Result<(), RuntimeError> {
        let mut state = self.state.lock().unwrap();
        let name = match state.containers.get_mut(id) {
            Some((spec, status)) => {
                *status = ServiceStatus::Running;
                spec.name.clone()
            }
            None => return Err(RuntimeError::NotFound(id.to_string())),
        };
        state.ops.push(format!("start:{name}"));
        Ok(())
    }

    async fn stop_container(&self, id: &str, _timeout_secs: u64) -> Result<(), RuntimeError> {
        let mut state = self.state.lock().unwrap();
        let name = match state.containers.get_mut(id) {
            Some((spec, status)) => {
                *status = ServiceStatus::Exited;
                spec.name.clone()
            }
            None => return Err(RuntimeError::NotFound(id.to_string())),
        };
        state.ops.push(format!("stop:{name}"));
        Ok(())
    }

    async fn kill_container(&self, id: &str) -> Result<(), RuntimeError> {
        self.stop_container(id, 0).await
    }

    async fn remove_container(&self, id: &str, _force: bool) -> Result<(), RuntimeError> {
        let mut state = self.state.lock().unwrap();
        match state.containers.remove(id) {
            Some((spec, _)) => {
                state.ops.push(format!("remove:{}", spec.name));
                Ok(())
            }
            None => Err(RuntimeError::NotFound(id.to_string())),
        }
    }

    async fn rename_container(&self, id: &str, name: &str) -> Result<(), RuntimeError> {
        let mut state = self.state.lock().unwrap();
        match state.containers.get_mut(id) {
            Some((spec, _)) => {
                spec.name = name.to_string();
                Ok(())
            }
            None => Err(RuntimeError::NotFound(id.to_string())),
        }
    }

    async fn pull_image(&self, image: &str) -> Result<(), RuntimeError> {
        if let Some(pattern) = self.fail_pulls_matching.lock().unwrap().as_deref() {
            if image.contains(pattern) {
                return Err(RuntimeError::ImagePullFailed(image.to_string()));
            }
        }
        let mut state = self.state.lock().unwrap();
        state.ops.push(format!("pull:{image}"));
        state.images.insert(image.to_string());
        Ok(())
    }

    async fn image_present(&self, image: &str) -> Result<bool, RuntimeError> {
        Ok(self.state.lock().unwrap().images.contains(image))
    }

    async fn remove_image(&self, image: &str) -> Result<(), RuntimeError> {
        let mut state = self.state.lock().unwrap();
        state.ops.push(format!("rmi:{image}"));
        state.images.remove(image);
        Ok(())
    }

    async fn create_network(&self, name: &str) -> Result<(), RuntimeError> {
        let mut state = self.state.lock().unwrap();
        if !state.networks.insert(name.to_string()) {
            return Err(RuntimeError::AlreadyExists(name.to_string()));
        }
        state.ops.push(format!("network:{name}"));
        Ok(())
    }

    async fn remove_network(&self, name: &str) -> Result<(), RuntimeError> {
        let mut state = self.state.lock().unwrap();
        if state.networks.remove(name) {
            Ok(())
        } else {
            Err(RuntimeError::NotFound(name.to_string()))
        }
    }

    async fn create_volume(&self, name: &str) -> Result<(), RuntimeError> {
        let mut state = self.state.lock().unwrap();
        state.volumes.insert(name.to_string());
        state.ops.push(format!("volume:{name}"));
        Ok(())
    }

    async fn remove_volume(&self, name: &str) -> Result<(), RuntimeError> {
        let mut state = self.state.lock().unwrap();
        if state.volumes.remove(name) {
            Ok(())
        } else {
            Err(RuntimeError::NotFound(name.to_string()))
        }
    }

    async fn container_logs(&self, _id: &str, _tail: usize) -> Result<Vec<String>, RuntimeError> {
        Ok(vec![])
    }
}

fn service(name: &str, image: &str) -> Service {
    Service {
        service_id: "1".into(),
        service_name: name.into(),
        image_name: image.into(),
        status: "running".into(),
        container_config: ContainerSpec::default(),
    }
}

fn target_with(app_id: &str, services: Vec<Service>) -> TargetState {
    TargetState {
        apps: BTreeMap::from([(
            app_id.to_string(),
            App {
                name: "main".into(),
                services,
            },
        )]),
        version: 1,
        ..Default::default()
    }
}

fn reconciler(
    runtime: Arc<FakeRuntime>,
) -> (
    Arc<StateReconciler>,
    Arc<MemoryStore>,
    broadcast::Receiver<domain::AgentEvent>,
) {
    let store = Arc::new(MemoryStore::default());
    let (tx, rx) = broadcast::channel(64);
    let reconciler = Arc::new(StateReconciler::new(
        store.clone(),
        runtime,
        tx,
        ReconcilerSettings::default(),
    ));
    (reconciler, store, rx)
}

#[tokio::test]
async fn test_fresh_app_is_deployed() {
    let runtime = Arc::new(FakeRuntime::default());
    let (reconciler, _store, _rx) = reconciler(runtime.clone());

    reconciler
        .set_target(target_with("1001", vec![service("web", "nginx:1.24")]), TargetSource::Local)
        .await
        .unwrap();
    reconciler.apply_target_state().await.unwrap();

    assert_eq!(runtime.running_images(), vec!["nginx:1.24".to_string()]);
    let current = reconciler.current_state().await.unwrap();
    let observed = current.service("1001", "web").unwrap();
    assert_eq!(observed.status, ServiceStatus::Running);
    assert_eq!(observed.image, "nginx:1.24");
}

#[tokio::test]
async fn test_apply_is_idempotent() {
    let runtime = Arc::new(FakeRuntime::default());
    let (reconciler, _store, _rx) = reconciler(runtime.clone());

    reconciler
        .set_target(target_with("1001", vec![service("web", "nginx:1.24")]), TargetSource::Local)
        .await
        .unwrap();
    reconciler.apply_target_state().await.unwrap();

    runtime.clear_ops();
    reconciler.apply_target_state().await.unwrap();
    assert!(
        runtime.ops().is_empty(),
        "second apply with stable target must be a no-op, got {:?}",
        runtime.ops()
    );
}

#[tokio::test]
async fn test_image_swap_pulls_before_stopping() {
    let runtime = Arc::new(FakeRuntime::default());
    let (reconciler, _store, _rx) = reconciler(runtime.clone());

    reconciler
        .set_target(target_with("1001", vec![service("web", "nginx:1.24")]), TargetSource::Local)
        .await
        .unwrap();
    reconciler.apply_target_state().await.unwrap();
    runtime.clear_ops();

    let mut updated = target_with("1001", vec![service("web", "nginx:1.25")]);
    updated.version = 2;
    reconciler
        .set_target(updated, TargetSource::Cloud)
        .await
        .unwrap();
    reconciler.apply_target_state().await.unwrap();

    let ops = runtime.ops();
    let pos = |needle: &str| {
        ops.iter()
            .position(|op| op.starts_with(needle))
            .unwrap_or_else(|| panic!("{needle} not in {ops:?}"))
    };
    // download-then-kill: the new image lands before the old container stops
    assert!(pos("pull:nginx:1.25") < pos("stop:"));
    assert!(pos("stop:") < pos("remove:"));
    assert!(pos("remove:") < pos("create:"));

    assert_eq!(runtime.running_images(), vec!["nginx:1.25".to_string()]);
}

#[tokio::test]
async fn test_absent_app_is_undeployed() {
    let runtime = Arc::new(FakeRuntime::default());
    let (reconciler, _store, _rx) = reconciler(runtime.clone());

    reconciler
        .set_target(target_with("1001", vec![service("web", "nginx:1.24")]), TargetSource::Local)
        .await
        .unwrap();
    reconciler.apply_target_state().await.unwrap();

    let mut empty = TargetState::default();
    empty.version = 2;
    reconciler
        .set_target(empty, TargetSource::Cloud)
        .await
        .unwrap();
    reconciler.apply_target_state().await.unwrap();

    assert!(runtime.running_images().is_empty());
    let current = reconciler.current_state().await.unwrap();
    assert!(current.apps.is_empty());
}

#[tokio::test]
async fn test_set_target_fires_event_and_persists() {
    let runtime = Arc::new(FakeRuntime::default());
    let (reconciler, store, mut rx) = reconciler(runtime);

    let target = target_with("1001", vec![service("web", "nginx:1.24")]);
    reconciler
        .set_target(target.clone(), TargetSource::Cloud)
        .await
        .unwrap();

    let event = rx.try_recv().unwrap();
    assert_eq!(event.event_type(), "TargetStateChanged");
    assert_eq!(store.target.lock().unwrap().clone().unwrap(), target);
}

#[tokio::test]
async fn test_invalid_target_is_refused() {
    let runtime = Arc::new(FakeRuntime::default());
    let (reconciler, store, mut rx) = reconciler(runtime);

    let good = target_with("1001", vec![service("web", "nginx:1.24")]);
    reconciler
        .set_target(good.clone(), TargetSource::Cloud)
        .await
        .unwrap();
    let _ = rx.try_recv();

    let bad = target_with("1001", vec![service("web", "")]);
    let err = reconciler
        .set_target(bad, TargetSource::Cloud)
        .await
        .unwrap_err();
    assert!(matches!(err, DomainError::InvalidTargetState(_)));

    // Prior valid target untouched, no event fired.
    assert_eq!(store.target.lock().unwrap().clone().unwrap(), good);
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn test_failing_app_is_degraded_but_does_not_block_others() {
    let runtime = Arc::new(FakeRuntime::default());
    let store = Arc::new(MemoryStore::default());
    let (tx, _rx) = broadcast::channel(64);
    let reconciler = Arc::new(StateReconciler::new(
        store,
        runtime.clone(),
        tx,
        ReconcilerSettings {
            failure_threshold: 1,
            ..Default::default()
        },
    ));

    // Both apps deploy fine initially.
    let mut target = target_with("1001", vec![service("web", "nginx:1.24")]);
    target.apps.insert(
        "2002".into(),
        App {
            name: "aux".into(),
            services: vec![service("worker", "ok:1")],
        },
    );
    reconciler
        .set_target(target, TargetSource::Local)
        .await
        .unwrap();
    reconciler.apply_target_state().await.unwrap();

    // The next version breaks 2002's image pull.
    *runtime.fail_pulls_matching.lock().unwrap() = Some("broken".to_string());
    let mut updated = target_with("1001", vec![service("web", "nginx:1.25")]);
    updated.apps.insert(
        "2002".into(),
        App {
            name: "aux".into(),
            services: vec![service("worker", "broken:latest")],
        },
    );
    updated.version = 2;
    reconciler
        .set_target(updated, TargetSource::Cloud)
        .await
        .unwrap();

    // The failing app lands in retry backoff; the pass still completes.
    reconciler.apply_target_state().await.unwrap();

    let mut running = runtime.running_images();
    running.sort();
    assert_eq!(running, vec!["nginx:1.25".to_string(), "ok:1".to_string()]);

    let current = reconciler.current_state().await.unwrap();
    assert!(current.apps["2002"].degraded, "failed app marked degraded");
    assert!(!current.apps["1001"].degraded);
}
