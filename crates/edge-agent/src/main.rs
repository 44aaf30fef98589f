use anyhow::Result;
use clap::Parser;
use dotenv::dotenv;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use application::anomaly::AnomalyEngine;
use application::metrics::MetricsCollector;
use application::provisioning::{DeviceManager, LoggingPostProvisionHook, ProvisionSettings};
use application::reconciler::{ReconcilerSettings, StateReconciler};
use application::sensing::SensorManager;
use domain::DomainError;
use domain::cloud::ControlPlane;
use domain::event::AgentEvent;
use domain::store::DeviceStore;
use domain::telemetry::SystemProbe;
use edge_agent::api::{ApiState, create_router};
use edge_agent::sync::{SyncManager, SyncSettings};
use infrastructure::config::AgentConfig;
use infrastructure::{CloudClient, DockerRuntime, MqttClient, SqliteStore, SysinfoProbe};
use infrastructure::mqtt::MqttSettings;

const AGENT_VERSION: &str = env!("CARGO_PKG_VERSION");
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to config directory
    #[arg(long, default_value = "config")]
    config_dir: String,

    /// Override data directory
    #[arg(long)]
    data_dir: Option<String>,

    /// Override cloud API endpoint
    #[arg(long)]
    api_endpoint: Option<String>,

    /// Override local API port
    #[arg(long)]
    local_api_port: Option<u16>,
}

/// Control-plane stand-in for devices running without a cloud endpoint.
struct DisabledControlPlane;

#[async_trait::async_trait]
impl ControlPlane for DisabledControlPlane {
    async fn register(
        &self,
        _provisioning_key: &str,
        _request: &domain::cloud::RegisterRequest,
    ) -> Result<domain::cloud::RegisterOutcome, DomainError> {
        Err(DomainError::BadRequest("no cloud endpoint configured".into()))
    }
    async fn exchange_key(&self, _uuid: &str, _device_key: &str) -> Result<(), DomainError> {
        Err(DomainError::BadRequest("no cloud endpoint configured".into()))
    }
    async fn fetch_target_state(
        &self,
        _uuid: &str,
        _device_key: &str,
        _etag: Option<String>,
    ) -> Result<domain::cloud::PollOutcome, DomainError> {
        Err(DomainError::BadRequest("no cloud endpoint configured".into()))
    }
    async fn report_state(
        &self,
        _uuid: &str,
        _device_key: &str,
        _report: &domain::cloud::StateReport,
    ) -> Result<(), DomainError> {
        Err(DomainError::BadRequest("no cloud endpoint configured".into()))
    }
    async fn deprovision(&self, _uuid: &str, _device_key: &str) -> Result<(), DomainError> {
        Ok(())
    }
}

fn status_topic(uuid: &str) -> String {
    format!("iot/device/{uuid}/agent/status")
}

async fn run() -> Result<i32> {
    dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "info,edge_agent=debug,application=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("🤖 Lattice Edge Agent v{} starting...", AGENT_VERSION);
    info!("🆔 Process ID: {}", std::process::id());

    // 0. Parse args and load configuration
    let args = Args::parse();
    let mut config = AgentConfig::load(&args.config_dir)?;
    if let Some(endpoint) = args.api_endpoint {
        config.api_endpoint = Some(endpoint);
    }
    if let Some(port) = args.local_api_port {
        config.local_api_port = port;
    }
    let data_dir = args.data_dir.unwrap_or_else(|| config.data_dir.clone());
    std::fs::create_dir_all(&data_dir)?;
    info!("📂 Data directory: {}", data_dir);

    // 1. Local store
    let db_path = format!("sqlite://{data_dir}/agent_storage.db?mode=rwc");
    info!("💾 Opening storage: {}", db_path);
    let store = Arc::new(
        SqliteStore::new(&db_path)
            .await
            .map_err(|e| anyhow::anyhow!("fatal: cannot open local store: {e}"))?,
    );

    let (events, _) = broadcast::channel::<AgentEvent>(256);
    let cancel = CancellationToken::new();
    let restart = CancellationToken::new();

    // 2. Device manager (provision if needed)
    let probe: Arc<dyn SystemProbe> = Arc::new(SysinfoProbe::new());
    let provision_settings = ProvisionSettings {
        device_name: config
            .device_name
            .clone()
            .unwrap_or_else(|| probe.hostname()),
        device_type: config.device_type.clone(),
        agent_version: AGENT_VERSION.to_string(),
        provisioning_key: config.provisioning_key.clone(),
        api_endpoint: config.api_endpoint.clone(),
        application_id: config.application_id.clone(),
        mac_address: None,
        os_version: None,
    };

    let cloud: Arc<dyn ControlPlane> = match &config.api_endpoint {
        Some(endpoint) => Arc::new(CloudClient::new(endpoint.clone(), Duration::from_secs(30))?),
        None => Arc::new(DisabledControlPlane),
    };
    let cloud_enabled = config.api_endpoint.is_some();

    let device = Arc::new(DeviceManager::new(
        store.clone(),
        cloud.clone(),
        Arc::new(LoggingPostProvisionHook),
        events.clone(),
    ));
    let identity = device.initialize(&provision_settings).await?;
    info!(uuid = %identity.uuid, provisioned = identity.provisioned, "✅ Identity ready");

    let require_provisioning =
        config.require_provisioning || std::env::var("REQUIRE_PROVISIONING").is_ok();
    if require_provisioning && !identity.provisioned && config.provisioning_key.is_none() {
        error!("REQUIRE_PROVISIONING is set but the device is unprovisioned and has no key");
        return Ok(1);
    }

    if !cloud_enabled {
        device.mark_local_mode().await?;
        info!("📴 No cloud endpoint configured, running in local mode");
    } else if !identity.provisioned && config.provisioning_key.is_some() {
        match device.provision(&provision_settings).await {
            Ok(id) => info!(device_id = ?id.device_id, "✅ Provisioned at startup"),
            Err(e) if e.is_transient() => {
                warn!(error = %e, "provisioning failed, retrying in background");
                let device = device.clone();
                let settings = provision_settings.clone();
                let retry_cancel = cancel.child_token();
                tokio::spawn(async move {
                    let mut backoff = Duration::from_secs(10);
                    loop {
                        tokio::select! {
                            _ = retry_cancel.cancelled() => break,
                            _ = tokio::time::sleep(backoff) => {}
                        }
                        match device.provision(&settings).await {
                            Ok(_) => {
                                info!("✅ Background provisioning succeeded");
                                break;
                            }
                            Err(e) if e.is_transient() => {
                                backoff = (backoff * 2).min(Duration::from_secs(300));
                                debug!(error = %e, "provision retry failed");
                            }
                            Err(e) => {
                                error!(error = %e, "provisioning rejected, giving up");
                                break;
                            }
                        }
                    }
                });
            }
            Err(e) => {
                error!(error = %e, "provisioning rejected");
            }
        }
    }
    let identity = device.identity().await?;

    // 3. MQTT (broker credentials arrive with registration)
    let broker = identity.broker.clone().or_else(|| {
        config.mqtt.as_ref().map(|m| domain::identity::BrokerConfig {
            url: m.broker_url.clone(),
            username: m.username.clone().unwrap_or_default(),
            password: m.password.clone().unwrap_or_default(),
            ca_cert: m
                .ca_cert_path
                .as_ref()
                .and_then(|p| std::fs::read_to_string(p).ok()),
            verify_certificate: m.verify_certificate,
        })
    });

    let mqtt = match &broker {
        Some(broker_config) => {
            info!(broker = %broker_config.url, "📨 Connecting to MQTT broker");
            let settings = MqttSettings {
                broker_url: broker_config.url.clone(),
                client_id: format!("edge-{}", identity.uuid),
                username: (!broker_config.username.is_empty())
                    .then(|| broker_config.username.clone()),
                password: (!broker_config.password.is_empty())
                    .then(|| broker_config.password.clone()),
                ca_cert_pem: broker_config.ca_cert.clone(),
                queue_capacity: 1000,
                last_will: Some((
                    status_topic(&identity.uuid),
                    serde_json::json!({ "status": "OFFLINE" }).to_string().into_bytes(),
                )),
            };
            match MqttClient::new(settings).await {
                Ok(client) => Some(client),
                Err(e) => {
                    warn!(error = %e, "MQTT unavailable, continuing without broker link");
                    None
                }
            }
        }
        None => None,
    };

    // 4. Container runtime + reconciler (initial snapshot)
    let runtime: Arc<dyn domain::runtime::ContainerRuntime> = Arc::new(
        DockerRuntime::connect()
            .map_err(|e| anyhow::anyhow!("fatal: container runtime unavailable: {e}"))?,
    );
    let reconciler = Arc::new(StateReconciler::new(
        store.clone(),
        runtime.clone(),
        events.clone(),
        ReconcilerSettings::default(),
    ));
    reconciler.load_initial().await?;
    if let Err(e) = reconciler.apply_target_state().await {
        warn!(error = %e, "initial reconciliation incomplete, will retry on ticks");
    }

    // 5. Anomaly engine, metrics, sensing
    let engine = Arc::new(AnomalyEngine::new(config.anomaly.clone()));
    let collector = Arc::new(MetricsCollector::new(probe, engine.clone()));
    collector.spawn(
        Duration::from_millis(config.metrics_interval_ms),
        cancel.child_token(),
    );

    let sensors = Arc::new(SensorManager::new(
        events.clone(),
        engine.clone(),
        Some(store.clone()),
        cancel.child_token(),
    ));
    {
        let target = reconciler.target_state().await;
        sensors.start_devices(&target.config.sensors).await;
    }

    // 6. Cloud sync plane (poll + report loops)
    let sync = if cloud_enabled {
        let sync = Arc::new(SyncManager::new(
            cloud.clone(),
            device.clone(),
            reconciler.clone(),
            collector.clone(),
            engine.clone(),
            store.clone() as Arc<dyn DeviceStore>,
            events.clone(),
            mqtt.clone(),
            SyncSettings {
                poll_interval: Duration::from_millis(config.poll_interval_ms),
                report_interval: Duration::from_millis(config.report_interval_ms),
                ..Default::default()
            },
        ));
        sync.spawn_poll_loop(cancel.child_token());
        sync.spawn_report_loop(cancel.child_token());
        Some(sync)
    } else {
        None
    };

    // 7. Auto-reconciliation ticker
    reconciler.start_auto_reconciliation(
        Duration::from_millis(config.reconcile_interval_ms),
        cancel.child_token(),
    );

    // 8. Local control API
    let api_state = Arc::new(ApiState {
        device: device.clone(),
        reconciler: reconciler.clone(),
        sync: sync.clone(),
        collector: collector.clone(),
        runtime: runtime.clone(),
        store: store.clone(),
        provision_settings: provision_settings.clone(),
        memory_threshold_mb: config.memory_threshold_mb,
        restart: restart.clone(),
    });
    let api_addr = format!("127.0.0.1:{}", config.local_api_port);
    let listener = tokio::net::TcpListener::bind(&api_addr).await?;
    info!("🌐 Local API listening on {}", api_addr);
    {
        let router = create_router(api_state);
        let api_cancel = cancel.child_token();
        tokio::spawn(async move {
            let server = axum::serve(listener, router)
                .with_graceful_shutdown(async move { api_cancel.cancelled().await });
            if let Err(e) = server.await {
                error!(error = %e, "local API server failed");
            }
        });
    }

    // 9. MQTT subscriptions and event fan-out
    if let Some(client) = &mqtt {
        let uuid = identity.uuid.clone();
        for topic in [
            format!("iot/device/{uuid}/agent/update"),
            format!("iot/device/{uuid}/sensor/config"),
            format!("iot/device/{uuid}/jobs/+"),
        ] {
            if let Err(e) = client.subscribe(&topic).await {
                warn!(topic = %topic, error = %e, "MQTT subscribe failed");
            }
        }

        spawn_mqtt_command_listener(
            client.clone(),
            identity.uuid.clone(),
            reconciler.clone(),
            sensors.clone(),
            cancel.child_token(),
        );
    }

    spawn_event_watcher(
        events.clone(),
        reconciler.clone(),
        sensors.clone(),
        engine.clone(),
        mqtt.clone(),
        identity.uuid.clone(),
        restart.clone(),
        cancel.child_token(),
    );

    // 10. Publish ONLINE status
    if let Some(client) = &mqtt {
        let payload = serde_json::json!({
            "status": "ONLINE",
            "version": AGENT_VERSION,
        })
        .to_string();
        if let Err(e) = client
            .publish(&status_topic(&identity.uuid), payload.as_bytes(), true)
            .await
        {
            warn!(error = %e, "failed to publish ONLINE status");
        }
    }

    // 11. Heartbeat loop
    {
        let mqtt = mqtt.clone();
        let uuid = identity.uuid.clone();
        let heartbeat_cancel = cancel.child_token();
        let started = std::time::Instant::now();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(30));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = heartbeat_cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                if let Some(client) = &mqtt {
                    let event =
                        AgentEvent::agent_heartbeat(started.elapsed().as_secs(), AGENT_VERSION);
                    if let Ok(payload) = serde_json::to_vec(&event) {
                        let _ = client
                            .publish_unqueued(&status_topic(&uuid), &payload, false)
                            .await;
                    }
                }
            }
        });
    }

    info!("✅ Agent initialized");

    // 12. Wait for shutdown or scheduled restart
    let exit_code = tokio::select! {
        result = tokio::signal::ctrl_c() => {
            match result {
                Ok(()) => info!("🛑 Shutdown signal received"),
                Err(e) => warn!(error = %e, "unable to listen for shutdown signal"),
            }
            0
        }
        _ = restart.cancelled() => {
            info!("🔄 Scheduled restart");
            0
        }
    };

    // Reverse-order shutdown with a bounded grace period.
    let shutdown = async {
        cancel.cancel();
        sensors.stop_all().await;
        reconciler.stop_auto_reconciliation();
        if let Some(client) = &mqtt {
            let payload = serde_json::json!({ "status": "OFFLINE" }).to_string();
            let _ = client
                .publish(&status_topic(&identity.uuid), payload.as_bytes(), true)
                .await;
            client.drain(Duration::from_secs(2)).await;
        }
    };

    match tokio::time::timeout(SHUTDOWN_GRACE, shutdown).await {
        Ok(()) => {
            info!("👋 Good bye!");
            Ok(exit_code)
        }
        Err(_) => {
            warn!("shutdown grace period exceeded, forcing exit");
            Ok(2)
        }
    }
}

/// Routes inbound MQTT commands: agent update triggers, sensor config
/// pushes, and app job messages.
fn spawn_mqtt_command_listener(
    client: MqttClient,
    uuid: String,
    reconciler: Arc<StateReconciler>,
    sensors: Arc<SensorManager>,
    cancel: CancellationToken,
) {
    let mut rx = client.subscribe_messages();
    tokio::spawn(async move {
        let update_topic = format!("iot/device/{uuid}/agent/update");
        let sensor_topic = format!("iot/device/{uuid}/sensor/config");
        let jobs_prefix = format!("iot/device/{uuid}/jobs/");

        loop {
            let msg = tokio::select! {
                _ = cancel.cancelled() => break,
                msg = rx.recv() => match msg {
                    Ok(msg) => msg,
                    Err(_) => continue,
                },
            };

            if msg.topic == update_topic {
                info!("📥 Agent update requested over MQTT");
                if let Err(e) = reconciler.apply_target_state().await {
                    warn!(error = %e, "MQTT-triggered reconcile failed");
                }
            } else if msg.topic == sensor_topic {
                match serde_json::from_slice::<Vec<serde_json::Value>>(&msg.payload) {
                    Ok(entries) => sensors.reload(&entries).await,
                    Err(e) => warn!(error = %e, "invalid sensor config payload"),
                }
            } else if let Some(job_id) = msg.topic.strip_prefix(&jobs_prefix) {
                let Ok(job) = serde_json::from_slice::<serde_json::Value>(&msg.payload) else {
                    warn!(job_id, "invalid job payload");
                    continue;
                };
                let action = job.get("action").and_then(|v| v.as_str()).unwrap_or("");
                let app_id = job.get("appId").and_then(|v| v.as_str()).unwrap_or("");
                info!(job_id, action, app_id, "📥 Job received");
                let result = match action {
                    "start" => reconciler.start_app(app_id).await,
                    "stop" => reconciler.stop_app(app_id).await,
                    "restart" => reconciler.restart_app(app_id).await,
                    "purge" => reconciler.purge_app(app_id).await,
                    _ => Err(DomainError::BadRequest(format!("unknown action {action}"))),
                };
                if let Err(e) = result {
                    warn!(job_id, error = %e, "job failed");
                }
            }
        }
    });
}

/// Reacts to broadcast events: re-arms the scheduled-restart timer, hot
/// reloads sensing, and mirrors sensor/anomaly data onto MQTT.
#[allow(clippy::too_many_arguments)]
fn spawn_event_watcher(
    events: broadcast::Sender<AgentEvent>,
    reconciler: Arc<StateReconciler>,
    sensors: Arc<SensorManager>,
    engine: Arc<AnomalyEngine>,
    mqtt: Option<MqttClient>,
    uuid: String,
    restart: CancellationToken,
    cancel: CancellationToken,
) {
    let mut rx = events.subscribe();
    tokio::spawn(async move {
        let mut restart_timer: Option<tokio::task::JoinHandle<()>> = None;
        let mut last_sensors = reconciler.target_state().await.config.sensors.clone();

        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => break,
                event = rx.recv() => match event {
                    Ok(event) => event,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(missed = n, "event watcher lagged");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            };

            match event {
                AgentEvent::TargetStateChanged { version, .. } => {
                    debug!(version, "target state changed, reconciling");
                    if let Err(e) = reconciler.apply_target_state().await {
                        warn!(error = %e, "reconcile after target change failed");
                    }

                    let config = reconciler.target_state().await.config;

                    // Sensor list changes hot-reload the sensing actors.
                    if config.sensors != last_sensors {
                        sensors.reload(&config.sensors).await;
                        last_sensors = config.sensors.clone();
                    }

                    // Anomaly settings may ride along in the config.
                    if let Some(anomaly) = config.settings.get("anomaly") {
                        match serde_json::from_value(anomaly.clone()) {
                            Ok(parsed) => engine.reload(parsed),
                            Err(e) => warn!(error = %e, "invalid anomaly settings"),
                        }
                    }

                    // Scheduled restart: clear any outstanding timer before
                    // arming a new one.
                    if let Some(timer) = restart_timer.take() {
                        timer.abort();
                    }
                    if let Some(at) = config.restart_at() {
                        let delay = (at - chrono::Utc::now()).to_std().ok();
                        if let Some(delay) = delay {
                            info!(restart_at = %at, "scheduled restart armed");
                            let restart = restart.clone();
                            restart_timer = Some(tokio::spawn(async move {
                                tokio::time::sleep(delay).await;
                                restart.cancel();
                            }));
                        }
                    }
                }
                AgentEvent::AnomalyDetected { alert } => {
                    if let Some(client) = &mqtt {
                        let topic = format!("iot/device/{uuid}/anomaly");
                        if let Ok(payload) = serde_json::to_vec(&alert) {
                            let _ = client.publish(&topic, &payload, false).await;
                        }
                    }
                }
                AgentEvent::SensorBatch { frames, .. } => {
                    if let Some(client) = &mqtt {
                        for frame in &frames {
                            let topic =
                                format!("iot/device/{uuid}/sensor/{}", frame.register_name);
                            if let Ok(payload) = serde_json::to_vec(frame) {
                                let _ = client.publish(&topic, &payload, false).await;
                            }
                        }
                    }
                }
                AgentEvent::DeviceProvisioned { .. } => {
                    if mqtt.is_none() {
                        // Broker credentials only arrived now; restart to
                        // wire the MQTT link.
                        info!("provisioned after startup, scheduling restart to attach broker");
                        restart.cancel();
                    }
                }
                AgentEvent::AuthRevoked { context, .. } => {
                    warn!(context, "⛔ Control plane revoked our credentials");
                }
                AgentEvent::DeviceUnknown { .. } => {
                    warn!("⛔ Control plane does not know this device");
                }
                _ => {}
            }
        }
    });
}

fn main() {
    let rt = tokio::runtime::Runtime::new().expect("failed to build runtime");
    match rt.block_on(run()) {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("❌ FATAL: {e:?}");
            std::process::exit(1);
        }
    }
}
