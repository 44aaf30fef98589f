mod locks;
mod planner;

pub use locks::AppLockRegistry;
pub use planner::{PlanOptions, plan_steps};

use std::collections::HashSet;
use std::sync::Mutex as StdMutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::{Mutex as TokioMutex, broadcast};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use domain::DomainError;
use domain::event::AgentEvent;
use domain::runtime::{ContainerRuntime, ContainerSpec, ContainerSummary, RuntimeError};
use domain::state::{
    CompositionStep, CurrentState, ObservedApp, ObservedService, Service, TargetSource,
    TargetState,
};
use domain::store::DeviceStore;
use infrastructure::runtime::{APP_ID_LABEL, MANAGED_LABEL, SERVICE_ID_LABEL, SERVICE_NAME_LABEL};

const CONFIG_HASH_LABEL: &str = "io.lattice.config-hash";

/// Reconciler tuning.
#[derive(Debug, Clone)]
pub struct ReconcilerSettings {
    /// Bounded number of plan/execute passes per apply call.
    pub max_passes: u32,
    pub stop_timeout_secs: u64,
    /// Step failures per app before it is marked degraded.
    pub failure_threshold: u32,
    pub retry_base: Duration,
    pub retry_cap: Duration,
}

impl Default for ReconcilerSettings {
    fn default() -> Self {
        Self {
            max_passes: 3,
            stop_timeout_secs: 10,
            failure_threshold: 5,
            retry_base: Duration::from_secs(10),
            retry_cap: Duration::from_secs(300),
        }
    }
}

struct AppFailure {
    count: u32,
    next_retry: Instant,
}

/// Drives the locally running workloads toward the target state.
///
/// The target is guarded by a single mutex; change notifications go out on
/// the broadcast channel after the guard is released. Apply passes are
/// serialized by their own guard so the ticker and API-triggered applies
/// never interleave steps for the same app.
pub struct StateReconciler {
    store: Arc<dyn DeviceStore>,
    runtime: Arc<dyn ContainerRuntime>,
    events: broadcast::Sender<AgentEvent>,
    settings: ReconcilerSettings,
    target: TokioMutex<TargetState>,
    locks: AppLockRegistry,
    failures: DashMap<String, AppFailure>,
    apply_guard: TokioMutex<()>,
    pass_counter: AtomicU64,
    auto_handle: StdMutex<Option<JoinHandle<()>>>,
}

fn container_name(app_id: &str, service: &Service) -> String {
    let hash = service.config_hash();
    format!("{app_id}_{}_{}", service.service_name, &hash[..8])
}

fn container_spec(app_id: &str, service: &Service) -> ContainerSpec {
    let mut spec = service.container_config.clone();
    spec.image = service.image_name.clone();
    spec.name = container_name(app_id, service);
    spec.labels
        .insert(MANAGED_LABEL.to_string(), "true".to_string());
    spec.labels
        .insert(APP_ID_LABEL.to_string(), app_id.to_string());
    spec.labels
        .insert(SERVICE_ID_LABEL.to_string(), service.service_id.clone());
    spec.labels.insert(
        SERVICE_NAME_LABEL.to_string(),
        service.service_name.clone(),
    );
    spec.labels
        .insert(CONFIG_HASH_LABEL.to_string(), service.config_hash());
    spec
}

fn observed_from(summary: &ContainerSummary) -> ObservedService {
    ObservedService {
        service_id: summary
            .labels
            .get(SERVICE_ID_LABEL)
            .cloned()
            .unwrap_or_default(),
        service_name: summary
            .labels
            .get(SERVICE_NAME_LABEL)
            .cloned()
            .unwrap_or_else(|| summary.name.clone()),
        image: summary.image.clone(),
        image_digest: summary.image_digest.clone(),
        container_id: Some(summary.id.clone()),
        status: summary.status,
        environment: summary.environment.clone(),
        ports: summary.ports.clone(),
        networks: summary.networks.clone(),
        volumes: summary.volumes.clone(),
        labels: summary.labels.clone(),
    }
}

impl StateReconciler {
    pub fn new(
        store: Arc<dyn DeviceStore>,
        runtime: Arc<dyn ContainerRuntime>,
        events: broadcast::Sender<AgentEvent>,
        settings: ReconcilerSettings,
    ) -> Self {
        Self {
            store,
            runtime,
            events,
            settings,
            target: TokioMutex::new(TargetState::default()),
            locks: AppLockRegistry::new(),
            failures: DashMap::new(),
            apply_guard: TokioMutex::new(()),
            pass_counter: AtomicU64::new(0),
            auto_handle: StdMutex::new(None),
        }
    }

    /// Load the persisted target as the initial snapshot (no event fires).
    pub async fn load_initial(&self) -> Result<(), DomainError> {
        if let Some(stored) = self.store.load_target_state().await? {
            info!(version = stored.version, "📋 Loaded persisted target state");
            *self.target.lock().await = stored;
        }
        Ok(())
    }

    /// Atomically replace the target: validate, write through to the store,
    /// then notify subscribers.
    pub async fn set_target(
        &self,
        state: TargetState,
        source: TargetSource,
    ) -> Result<(), DomainError> {
        state.validate()?;
        self.store.save_target_state(&state).await?;

        let version = state.version;
        {
            let mut guard = self.target.lock().await;
            *guard = state;
        }
        let _ = self
            .events
            .send(AgentEvent::target_state_changed(version, source));
        Ok(())
    }

    pub async fn target_state(&self) -> TargetState {
        self.target.lock().await.clone()
    }

    /// Derive the current state from the runtime (never persisted).
    pub async fn current_state(&self) -> Result<CurrentState, DomainError> {
        let containers = self
            .runtime
            .list_containers(&format!("{MANAGED_LABEL}=true"))
            .await?;

        let mut state = CurrentState::default();
        for summary in &containers {
            let Some(app_id) = summary.labels.get(APP_ID_LABEL) else {
                continue;
            };
            state
                .apps
                .entry(app_id.clone())
                .or_insert_with(ObservedApp::default)
                .services
                .push(observed_from(summary));
        }

        for (app_id, app) in state.apps.iter_mut() {
            app.degraded = self
                .failures
                .get(app_id)
                .map(|f| f.count >= self.settings.failure_threshold)
                .unwrap_or(false);
        }
        Ok(state)
    }

    fn record_failure(&self, app_id: &str) {
        let mut entry = self.failures.entry(app_id.to_string()).or_insert(AppFailure {
            count: 0,
            next_retry: Instant::now(),
        });
        entry.count += 1;
        let exp = entry.count.min(6);
        let backoff = (self.settings.retry_base * 2u32.pow(exp)).min(self.settings.retry_cap);
        entry.next_retry = Instant::now() + backoff;
        if entry.count == self.settings.failure_threshold {
            warn!(app_id, "app marked degraded after repeated step failures");
        }
    }

    /// Execute one composition step. Every arm is a no-op when the intended
    /// effect is already present.
    pub async fn execute_step(
        &self,
        step: &CompositionStep,
        holder: u64,
        target: &TargetState,
    ) -> Result<(), DomainError> {
        debug!(action = step.action(), "executing step");
        match step {
            CompositionStep::TakeLock { app_id, force } => {
                self.locks.acquire(app_id, holder, *force)
            }
            CompositionStep::ReleaseLock { app_id } => {
                self.locks.release(app_id, holder);
                Ok(())
            }
            CompositionStep::CreateNetwork { name } => {
                match self.runtime.create_network(name).await {
                    Ok(()) | Err(RuntimeError::AlreadyExists(_) | RuntimeError::Conflict(_)) => {
                        Ok(())
                    }
                    Err(e) => Err(e.into()),
                }
            }
            CompositionStep::RemoveNetwork { name } => {
                match self.runtime.remove_network(name).await {
                    Ok(()) | Err(RuntimeError::NotFound(_)) => Ok(()),
                    Err(e) => Err(e.into()),
                }
            }
            CompositionStep::CreateVolume { name } => {
                match self.runtime.create_volume(name).await {
                    Ok(()) | Err(RuntimeError::AlreadyExists(_) | RuntimeError::Conflict(_)) => {
                        Ok(())
                    }
                    Err(e) => Err(e.into()),
                }
            }
            CompositionStep::RemoveVolume { name } => {
                match self.runtime.remove_volume(name).await {
                    Ok(()) | Err(RuntimeError::NotFound(_)) => Ok(()),
                    Err(e) => Err(e.into()),
                }
            }
            CompositionStep::Fetch { image } => {
                if self.runtime.image_present(image).await? {
                    return Ok(());
                }
                self.runtime.pull_image(image).await.map_err(Into::into)
            }
            CompositionStep::RemoveImage { image } => {
                match self.runtime.remove_image(image).await {
                    Ok(()) | Err(RuntimeError::NotFound(_) | RuntimeError::Conflict(_)) => Ok(()),
                    Err(e) => Err(e.into()),
                }
            }
            CompositionStep::Start { app_id, service } => {
                self.start_service(app_id, service).await
            }
            CompositionStep::Stop {
                app_id,
                service_name,
            } => {
                for id in self.replaceable_containers(app_id, service_name, target).await? {
                    self.runtime
                        .stop_container(&id, self.settings.stop_timeout_secs)
                        .await?;
                }
                Ok(())
            }
            CompositionStep::Kill {
                app_id,
                service_name,
            } => {
                for id in self.replaceable_containers(app_id, service_name, target).await? {
                    match self.runtime.kill_container(&id).await {
                        Ok(()) | Err(RuntimeError::NotFound(_) | RuntimeError::Conflict(_)) => {}
                        Err(e) => return Err(e.into()),
                    }
                }
                Ok(())
            }
            CompositionStep::Remove {
                app_id,
                service_name,
            } => {
                for id in self.replaceable_containers(app_id, service_name, target).await? {
                    match self.runtime.remove_container(&id, false).await {
                        Ok(()) | Err(RuntimeError::NotFound(_)) => {}
                        Err(RuntimeError::Conflict(_)) => {
                            // Still running; stop first, then retry.
                            self.runtime
                                .stop_container(&id, self.settings.stop_timeout_secs)
                                .await?;
                            self.runtime.remove_container(&id, false).await?;
                        }
                        Err(e) => return Err(e.into()),
                    }
                }
                Ok(())
            }
            CompositionStep::UpdateMetadata { app_id, service } => {
                let containers = self.service_containers(app_id, &service.service_name).await?;
                let wanted = container_name(app_id, service);
                for summary in containers {
                    if summary.name != wanted {
                        self.runtime.rename_container(&summary.id, &wanted).await?;
                    }
                }
                Ok(())
            }
        }
    }

    async fn service_containers(
        &self,
        app_id: &str,
        service_name: &str,
    ) -> Result<Vec<ContainerSummary>, DomainError> {
        let containers = self
            .runtime
            .list_containers(&format!("{APP_ID_LABEL}={app_id}"))
            .await?;
        Ok(containers
            .into_iter()
            .filter(|c| c.labels.get(SERVICE_NAME_LABEL).map(String::as_str) == Some(service_name))
            .collect())
    }

    /// Containers of a service that are fair game for Stop/Kill/Remove: the
    /// one matching the target's definition is only touched when the target
    /// no longer wants it running (handover keeps the new container alive
    /// while the old one is swept).
    async fn replaceable_containers(
        &self,
        app_id: &str,
        service_name: &str,
        target: &TargetState,
    ) -> Result<Vec<String>, DomainError> {
        let target_service = target
            .apps
            .get(app_id)
            .and_then(|a| a.services.iter().find(|s| s.service_name == service_name));
        let protected_hash = target_service
            .filter(|s| s.wants_running())
            .map(|s| s.config_hash());

        Ok(self
            .service_containers(app_id, service_name)
            .await?
            .into_iter()
            .filter(|c| {
                c.labels.get(CONFIG_HASH_LABEL) != protected_hash.as_ref()
                    || protected_hash.is_none()
            })
            .map(|c| c.id)
            .collect())
    }

    async fn start_service(&self, app_id: &str, service: &Service) -> Result<(), DomainError> {
        let hash = service.config_hash();
        let existing = self
            .service_containers(app_id, &service.service_name)
            .await?
            .into_iter()
            .find(|c| c.labels.get(CONFIG_HASH_LABEL) == Some(&hash));

        let id = match existing {
            Some(summary) => {
                if summary.status.is_running() {
                    return Ok(());
                }
                summary.id
            }
            None => {
                let spec = container_spec(app_id, service);
                match self.runtime.create_container(&spec).await {
                    Ok(id) => id,
                    Err(RuntimeError::Conflict(_)) => {
                        // Name already taken by a container created in an
                        // interrupted earlier pass; reuse it.
                        self.service_containers(app_id, &service.service_name)
                            .await?
                            .into_iter()
                            .find(|c| c.name == spec.name)
                            .map(|c| c.id)
                            .ok_or_else(|| {
                                DomainError::Runtime(RuntimeError::Conflict(spec.name.clone()))
                            })?
                    }
                    Err(e) => return Err(e.into()),
                }
            }
        };

        self.runtime.start_container(&id).await.map_err(Into::into)
    }

    /// Plan and execute until current matches target or the bounded pass
    /// budget runs out.
    pub async fn apply_target_state(&self) -> Result<(), DomainError> {
        let _guard = self.apply_guard.lock().await;
        let holder = self.pass_counter.fetch_add(1, Ordering::Relaxed) + 1;
        let result = self.apply_inner(holder).await;
        // Never leak tickets out of a failed pass.
        self.locks.release_all(holder);
        result
    }

    async fn apply_inner(&self, holder: u64) -> Result<(), DomainError> {
        let opts = PlanOptions::default();

        for pass in 0..self.settings.max_passes {
            let target = self.target.lock().await.clone();
            let current = self.current_state().await?;

            // Apps in failure backoff sit this pass out.
            let now = Instant::now();
            let skipped: HashSet<String> = self
                .failures
                .iter()
                .filter(|f| f.next_retry > now)
                .map(|f| f.key().clone())
                .collect();

            let mut planned_target = target.clone();
            planned_target.apps.retain(|id, _| !skipped.contains(id));
            let mut planned_current = current.clone();
            planned_current.apps.retain(|id, _| !skipped.contains(id));

            let steps = plan_steps(&planned_current, &planned_target, &opts);
            if steps.is_empty() {
                if pass > 0 {
                    info!("✅ Reconciliation converged");
                }
                return Ok(());
            }

            info!(pass, steps = steps.len(), "🔧 Executing reconciliation steps");
            let mut failed_apps: HashSet<String> = HashSet::new();
            let mut touched_apps: HashSet<String> = HashSet::new();

            for step in &steps {
                if let Some(app_id) = step.app_id() {
                    touched_apps.insert(app_id.to_string());
                    let release = matches!(step, CompositionStep::ReleaseLock { .. });
                    if failed_apps.contains(app_id) && !release {
                        continue;
                    }
                }

                match self.execute_step(step, holder, &target).await {
                    Ok(()) => {}
                    Err(e @ DomainError::Runtime(RuntimeError::Unavailable(_))) => {
                        // Whole pass aborts; the next tick retries.
                        error!(error = %e, "runtime unavailable, aborting pass");
                        return Err(e);
                    }
                    Err(e) => {
                        warn!(action = step.action(), error = %e, "step failed");
                        if let Some(app_id) = step.app_id() {
                            self.record_failure(app_id);
                            failed_apps.insert(app_id.to_string());
                            self.locks.release(app_id, holder);
                        }
                    }
                }
            }

            for app_id in touched_apps.difference(&failed_apps) {
                self.failures.remove(app_id);
            }
        }

        // Out of passes: report convergence state honestly.
        let target = self.target.lock().await.clone();
        let current = self.current_state().await?;
        if plan_steps(&current, &target, &opts).is_empty() {
            Ok(())
        } else {
            Err(DomainError::Protocol(
                "reconciliation did not converge within pass budget".into(),
            ))
        }
    }

    /// Periodic reconcile trigger.
    pub fn start_auto_reconciliation(
        self: &Arc<Self>,
        interval: Duration,
        cancel: CancellationToken,
    ) {
        let reconciler = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                if let Err(e) = reconciler.apply_target_state().await {
                    if e.is_transient() {
                        debug!(error = %e, "reconcile tick skipped");
                    } else {
                        warn!(error = %e, "reconcile tick failed");
                    }
                }
            }
        });

        let mut guard = self.auto_handle.lock().expect("handle poisoned");
        if let Some(old) = guard.replace(handle) {
            old.abort();
        }
    }

    pub fn stop_auto_reconciliation(&self) {
        if let Some(handle) = self.auto_handle.lock().expect("handle poisoned").take() {
            handle.abort();
        }
    }

    /// Local API operation: start every container of an app.
    pub async fn start_app(&self, app_id: &str) -> Result<(), DomainError> {
        let target = self.target_state().await;
        let app = target
            .apps
            .get(app_id)
            .ok_or_else(|| DomainError::BadRequest(format!("unknown app {app_id}")))?;
        for service in &app.services {
            self.start_service(app_id, service).await?;
        }
        Ok(())
    }

    /// Local API operation: stop every container of an app.
    pub async fn stop_app(&self, app_id: &str) -> Result<(), DomainError> {
        let containers = self
            .runtime
            .list_containers(&format!("{APP_ID_LABEL}={app_id}"))
            .await?;
        for summary in containers {
            self.runtime
                .stop_container(&summary.id, self.settings.stop_timeout_secs)
                .await?;
        }
        Ok(())
    }

    pub async fn restart_app(&self, app_id: &str) -> Result<(), DomainError> {
        self.stop_app(app_id).await?;
        self.start_app(app_id).await
    }

    /// Local API operation: tear down an app's containers and volumes, then
    /// let the next reconcile pass recreate them from the target.
    pub async fn purge_app(&self, app_id: &str) -> Result<(), DomainError> {
        let containers = self
            .runtime
            .list_containers(&format!("{APP_ID_LABEL}={app_id}"))
            .await?;
        let mut volumes: HashSet<String> = HashSet::new();
        for summary in &containers {
            for volume in &summary.volumes {
                if let Some(name) = volume.split(':').next() {
                    if !name.is_empty() && !name.starts_with('/') {
                        volumes.insert(name.to_string());
                    }
                }
            }
        }
        for summary in containers {
            self.runtime
                .stop_container(&summary.id, self.settings.stop_timeout_secs)
                .await?;
            self.runtime.remove_container(&summary.id, true).await?;
        }
        for volume in volumes {
            match self.runtime.remove_volume(&volume).await {
                Ok(()) | Err(RuntimeError::NotFound(_)) => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    pub async fn app_logs(
        &self,
        app_id: &str,
        tail: usize,
    ) -> Result<Vec<(String, Vec<String>)>, DomainError> {
        let containers = self
            .runtime
            .list_containers(&format!("{APP_ID_LABEL}={app_id}"))
            .await?;
        let mut logs = Vec::new();
        for summary in containers {
            let lines = self.runtime.container_logs(&summary.id, tail).await?;
            logs.push((summary.name, lines));
        }
        Ok(logs)
    }
}
