use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast;

use application::anomaly::AnomalyEngine;
use application::metrics::MetricsCollector;
use application::provisioning::{
    DeviceManager, LoggingPostProvisionHook, PostProvisionHook, ProvisionSettings,
};
use application::reconciler::{ReconcilerSettings, StateReconciler};
use domain::DomainError;
use domain::anomaly::AnomalyConfig;
use domain::cloud::{
    ControlPlane, PollOutcome, RegisterOutcome, RegisterRequest, StateReport,
};
use domain::event::{AgentEvent, ConnectionStatus};
use domain::identity::DeviceIdentity;
use domain::runtime::{ContainerRuntime, ContainerSpec, ContainerSummary, RuntimeError};
use domain::state::{ConfigPatch, DeviceConfig, TargetSource, TargetState, TargetStateDocument};
use domain::store::DeviceStore;
use domain::telemetry::{SystemProbe, SystemSnapshot};
use edge_agent::sync::{SyncManager, SyncSettings};

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
        Ok(())
    }
}

struct StubRuntime;

#[async_trait]
impl ContainerRuntime for StubRuntime {
    async fn ping(&self) -> Result<(), RuntimeError> {
        Ok(())
    }
    async fn list_containers(&self, _s: &str) -> Result<Vec<ContainerSummary>, RuntimeError> {
        Ok(vec![])
    }
    async fn create_container(&self, spec: &ContainerSpec) -> Result<String, RuntimeError> {
        Ok(spec.name.clone())
    }
    async fn start_container(&self, _id: &str) -> Result<(), RuntimeError> {
        Ok(())
    }
    async fn stop_container(&self, _id: &str, _t: u64) -> Result<(), RuntimeError> {
        Ok(())
    }
    async fn kill_container(&self, _id: &str) -> Result<(), RuntimeError> {
        Ok(())
    }
    async fn remove_container(&self, _id: &str, _f: bool) -> Result<(), RuntimeError> {
        Ok(())
    }
    async fn rename_container(&self, _id: &str, _n: &str) -> Result<(), RuntimeError> {
        Ok(())
    }
    async fn pull_image(&self, _image: &str) -> Result<(), RuntimeError> {
        Ok(())
    }
    async fn image_present(&self, _image: &str) -> Result<bool, RuntimeError> {
        Ok(true)
    }
    async fn remove_image(&self, _image: &str) -> Result<(), RuntimeError> {
        Ok(())
    }
    async fn create_network(&self, _name: &str) -> Result<(), RuntimeError> {
        Ok(())
    }
    async fn remove_network(&self, _name: &str) -> Result<(), RuntimeError> {
        Ok(())
    }
    async fn create_volume(&self, _name: &str) -> Result<(), RuntimeError> {
        Ok(())
    }
    async fn remove_volume(&self, _name: &str) -> Result<(), RuntimeError> {
        Ok(())
    }
    async fn container_logs(&self, _id: &str, _t: usize) -> Result<Vec<String>, RuntimeError> {
        Ok(vec![])
    }
}

struct FixedProbe;

#[async_trait]
impl SystemProbe for FixedProbe {
    async fn snapshot(&self) -> Result<SystemSnapshot, DomainError> {
        Ok(SystemSnapshot {
            cpu_percent: 10.0,
            memory_used: 512,
            memory_total: 2048,
            memory_percent: 25.0,
            os_version: "test-os".into(),
            ..Default::default()
        })
    }
    fn hostname(&self) -> String {
        "test-host".into()
    }
    fn cpu_cores(&self) -> usize {
        2
    }
}

#[derive(Default)]
struct ScriptedCloud {
    polls: Mutex<VecDeque<Result<PollOutcome, DomainError>>>,
    poll_etags: Mutex<Vec<Option<String>>>,
    reports: Mutex<Vec<StateReport>>,
    fail_reports: Mutex<Option<DomainError>>,
}

#[async_trait]
impl ControlPlane for ScriptedCloud {
    async fn register(
        &self,
        _key: &str,
        _req: &RegisterRequest,
    ) -> Result<RegisterOutcome, DomainError> {
        Ok(RegisterOutcome::AlreadyRegistered)
    }
    async fn exchange_key(&self, _uuid: &str, _key: &str) -> Result<(), DomainError> {
        Ok(())
    }
    async fn fetch_target_state(
        &self,
        _uuid: &str,
        _key: &str,
        etag: Option<String>,
    ) -> Result<PollOutcome, DomainError> {
        self.poll_etags.lock().unwrap().push(etag);
        self.polls
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Ok(PollOutcome::NotModified))
    }
    async fn report_state(
        &self,
        _uuid: &str,
        _key: &str,
        report: &StateReport,
    ) -> Result<(), DomainError> {
        if let Some(e) = self.fail_reports.lock().unwrap().clone() {
            return Err(e);
        }
        self.reports.lock().unwrap().push(report.clone());
        Ok(())
    }
    async fn deprovision(&self, _uuid: &str, _key: &str) -> Result<(), DomainError> {
        Ok(())
    }
}

struct Fixture {
    sync: Arc<SyncManager>,
    reconciler: Arc<StateReconciler>,
    cloud: Arc<ScriptedCloud>,
    events: broadcast::Receiver<AgentEvent>,
}

async fn fixture() -> Fixture {
    let store = Arc::new(MemoryStore::default());

    // Seed a provisioned identity.
    let mut identity = DeviceIdentity::generate(
        "uuid-1".into(),
        "aa".repeat(32),
        "edge-01".into(),
        "raspberrypi4-64".into(),
        "1.0.0".into(),
        Some("K1".into()),
        Some("https://api.example.com".into()),
    );
    identity.apply_registration("42".into(), None, None);
    identity.retire_provisioning_key();
    store.save_device(&identity).await.unwrap();

    let cloud = Arc::new(ScriptedCloud::default());
    let (tx, rx) = broadcast::channel(64);
    let hook: Arc<dyn PostProvisionHook> = Arc::new(LoggingPostProvisionHook);
    let device = Arc::new(DeviceManager::new(
        store.clone(),
        cloud.clone(),
        hook,
        tx.clone(),
    ));
    device
        .initialize(&ProvisionSettings {
            device_name: "edge-01".into(),
            device_type: "raspberrypi4-64".into(),
            agent_version: "1.0.0".into(),
            provisioning_key: None,
            api_endpoint: Some("https://api.example.com".into()),
            application_id: None,
            mac_address: None,
            os_version: None,
        })
        .await
        .unwrap();

    let runtime = Arc::new(StubRuntime);
    let reconciler = Arc::new(StateReconciler::new(
        store.clone(),
        runtime,
        tx.clone(),
        ReconcilerSettings::default(),
    ));

    let engine = Arc::new(AnomalyEngine::new(AnomalyConfig::default()));
    let collector = Arc::new(MetricsCollector::new(Arc::new(FixedProbe), engine.clone()));

    let sync = Arc::new(SyncManager::new(
        cloud.clone(),
        device,
        reconciler.clone(),
        collector,
        engine,
        store,
        tx,
        None,
        SyncSettings {
            backoff_base: Duration::from_millis(50),
            ..Default::default()
        },
    ));

    Fixture {
        sync,
        reconciler,
        cloud,
        events: rx,
    }
}

fn full_config() -> DeviceConfig {
    DeviceConfig {
        logging: BTreeMap::from([("level".to_string(), serde_json::json!("info"))]),
        sensors: vec![serde_json::json!({"id": "s1"})],
        features: BTreeMap::from([("x".to_string(), serde_json::json!(true))]),
        settings: BTreeMap::from([("tz".to_string(), serde_json::json!("UTC"))]),
    }
}

fn drain(events: &mut broadcast::Receiver<AgentEvent>) -> Vec<String> {
    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        seen.push(event.event_type().to_string());
    }
    seen
}

#[tokio::test]
async fn test_partial_config_update_preserves_siblings() {
    let mut fx = fixture().await;

    fx.reconciler
        .set_target(
            TargetState {
                config: full_config(),
                version: 1,
                ..Default::default()
            },
            TargetSource::Local,
        )
        .await
        .unwrap();
    drain(&mut fx.events);

    // The cloud sends only two of the four config sub-keys.
    let document = TargetStateDocument {
        config: ConfigPatch {
            logging: Some(BTreeMap::from([(
                "level".to_string(),
                serde_json::json!("debug"),
            )])),
            sensors: Some(vec![
                serde_json::json!({"id": "s1"}),
                serde_json::json!({"id": "s2"}),
            ]),
            features: None,
            settings: None,
        },
        version: 2,
        ..Default::default()
    };
    fx.cloud.polls.lock().unwrap().push_back(Ok(PollOutcome::Changed {
        document,
        etag: Some("\"v2\"".into()),
    }));

    assert!(fx.sync.poll_once().await.unwrap());

    let target = fx.reconciler.target_state().await;
    assert_eq!(target.version, 2);
    assert_eq!(
        target.config.logging.get("level"),
        Some(&serde_json::json!("debug"))
    );
    assert_eq!(target.config.sensors.len(), 2);
    // Absent sub-keys retained their prior values.
    assert_eq!(
        target.config.features.get("x"),
        Some(&serde_json::json!(true))
    );
    assert_eq!(
        target.config.settings.get("tz"),
        Some(&serde_json::json!("UTC"))
    );

    assert!(drain(&mut fx.events).contains(&"TargetStateChanged".to_string()));
}

#[tokio::test]
async fn test_304_fires_no_event_but_updates_health() {
    let mut fx = fixture().await;

    fx.cloud.polls.lock().unwrap().push_back(Ok(PollOutcome::Changed {
        document: TargetStateDocument {
            version: 1,
            ..Default::default()
        },
        etag: Some("\"abc\"".into()),
    }));
    fx.sync.poll_once().await.unwrap();
    drain(&mut fx.events);

    let before = fx.sync.connection_health().last_poll_at;
    tokio::time::sleep(Duration::from_millis(5)).await;

    // Second poll: 304.
    fx.cloud
        .polls
        .lock()
        .unwrap()
        .push_back(Ok(PollOutcome::NotModified));
    assert!(!fx.sync.poll_once().await.unwrap());

    assert!(
        !drain(&mut fx.events).contains(&"TargetStateChanged".to_string()),
        "304 must not fire target-state-changed"
    );

    let health = fx.sync.connection_health();
    assert!(health.last_poll_at > before);
    assert_eq!(health.status, ConnectionStatus::Connected);

    // The cached ETag was echoed on the second request.
    let etags = fx.cloud.poll_etags.lock().unwrap().clone();
    assert_eq!(etags[0], None);
    assert_eq!(etags[1].as_deref(), Some("\"abc\""));
}

#[tokio::test]
async fn test_identical_document_fires_no_event() {
    let mut fx = fixture().await;

    let document = TargetStateDocument {
        version: 1,
        ..Default::default()
    };
    for _ in 0..2 {
        fx.cloud.polls.lock().unwrap().push_back(Ok(PollOutcome::Changed {
            document: document.clone(),
            etag: None,
        }));
    }

    assert!(fx.sync.poll_once().await.unwrap());
    drain(&mut fx.events);

    // Same content again (e.g. the server does not support ETags).
    assert!(!fx.sync.poll_once().await.unwrap());
    assert!(!drain(&mut fx.events).contains(&"TargetStateChanged".to_string()));
}

#[tokio::test]
async fn test_auth_revoked_keeps_last_known_target() {
    let mut fx = fixture().await;

    fx.reconciler
        .set_target(
            TargetState {
                config: full_config(),
                version: 7,
                ..Default::default()
            },
            TargetSource::Local,
        )
        .await
        .unwrap();
    drain(&mut fx.events);

    fx.cloud
        .polls
        .lock()
        .unwrap()
        .push_back(Err(DomainError::Unauthenticated("401".into())));

    let err = fx.sync.poll_once().await.unwrap_err();
    assert!(matches!(err, DomainError::Unauthenticated(_)));
    assert!(drain(&mut fx.events).contains(&"AuthRevoked".to_string()));

    // Stored target untouched.
    assert_eq!(fx.reconciler.target_state().await.version, 7);
}

#[tokio::test]
async fn test_transport_failures_back_off_and_go_offline() {
    let fx = fixture().await;

    for i in 1..=5u32 {
        fx.cloud
            .polls
            .lock()
            .unwrap()
            .push_back(Err(DomainError::Transport("connection refused".into())));
        let _ = fx.sync.poll_once().await;

        let health = fx.sync.connection_health();
        assert_eq!(health.consecutive_failures, i);
        assert!(health.next_attempt_at.is_some());
    }

    assert_eq!(fx.sync.connection_health().status, ConnectionStatus::Offline);

    // Recovery resets the failure counters.
    fx.cloud
        .polls
        .lock()
        .unwrap()
        .push_back(Ok(PollOutcome::NotModified));
    fx.sync.poll_once().await.unwrap();
    let health = fx.sync.connection_health();
    assert_eq!(health.consecutive_failures, 0);
    assert_eq!(health.status, ConnectionStatus::Connected);
}

#[tokio::test]
async fn test_report_contains_metrics_and_anomaly_summary() {
    let fx = fixture().await;

    fx.sync.report_once().await.unwrap();

    let reports = fx.cloud.reports.lock().unwrap();
    assert_eq!(reports.len(), 1);
    let report = &reports[0];
    assert!(report.is_online);
    assert_eq!(report.cpu_usage, 10.0);
    assert_eq!(report.memory_total, 2048);
    assert_eq!(report.os_version, "test-os");
    assert_eq!(report.agent_version, "1.0.0");
    let summary = report.anomaly_summary.as_ref().unwrap();
    assert_eq!(summary["enabled"], true);
}

#[tokio::test]
async fn test_failed_report_recovers_with_fresh_snapshot() {
    let fx = fixture().await;

    *fx.cloud.fail_reports.lock().unwrap() =
        Some(DomainError::Transport("connection refused".into()));
    assert!(fx.sync.report_once().await.is_err());
    assert_eq!(fx.sync.connection_health().consecutive_failures, 1);

    *fx.cloud.fail_reports.lock().unwrap() = None;
    fx.sync.report_once().await.unwrap();
    assert_eq!(fx.sync.connection_health().consecutive_failures, 0);
    assert_eq!(fx.cloud.reports.lock().unwrap().len(), 1);
}
