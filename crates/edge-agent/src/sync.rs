use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use application::anomaly::AnomalyEngine;
use application::metrics::MetricsCollector;
use application::provisioning::DeviceManager;
use application::reconciler::StateReconciler;
use domain::DomainError;
use domain::cloud::{ConnectionHealth, ControlPlane, PollOutcome, StateReport};
use domain::event::{AgentEvent, ConnectionStatus};
use domain::state::TargetSource;
use domain::store::{DeviceStore, meta_keys};
use infrastructure::MqttClient;

/// Failures past this count flip the health status to offline.
const OFFLINE_THRESHOLD: u32 = 3;

#[derive(Debug, Clone)]
pub struct SyncSettings {
    pub poll_interval: Duration,
    pub report_interval: Duration,
    /// Initial backoff cap after a failed poll/report; doubles while the
    /// failures continue.
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(60),
            report_interval: Duration::from_secs(60),
            backoff_base: Duration::from_secs(15),
            backoff_cap: Duration::from_secs(300),
        }
    }
}

struct SyncState {
    etag: Option<String>,
    last_poll_at: Option<DateTime<Utc>>,
    last_report_at: Option<DateTime<Utc>>,
    consecutive_failures: u32,
    next_attempt_at: Option<DateTime<Utc>>,
    backoff: Duration,
    status: ConnectionStatus,
    /// Only the most recent report survives an outage; there is no queue.
    pending_report: Option<StateReport>,
}

/// The only component that ingests target state and reports current state.
///
/// Two independent loops (poll and report) observe the shared cancellation
/// token. The ETag cache lives in memory only; the first poll after a
/// restart is unconditional.
pub struct SyncManager {
    cloud: Arc<dyn ControlPlane>,
    device: Arc<DeviceManager>,
    reconciler: Arc<StateReconciler>,
    collector: Arc<MetricsCollector>,
    engine: Arc<AnomalyEngine>,
    store: Arc<dyn DeviceStore>,
    events: broadcast::Sender<AgentEvent>,
    mqtt: Option<MqttClient>,
    settings: SyncSettings,
    state: Mutex<SyncState>,
    started_at: Instant,
}

impl SyncManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        cloud: Arc<dyn ControlPlane>,
        device: Arc<DeviceManager>,
        reconciler: Arc<StateReconciler>,
        collector: Arc<MetricsCollector>,
        engine: Arc<AnomalyEngine>,
        store: Arc<dyn DeviceStore>,
        events: broadcast::Sender<AgentEvent>,
        mqtt: Option<MqttClient>,
        settings: SyncSettings,
    ) -> Self {
        let backoff = settings.backoff_base;
        Self {
            cloud,
            device,
            reconciler,
            collector,
            engine,
            store,
            events,
            mqtt,
            settings,
            state: Mutex::new(SyncState {
                etag: None,
                last_poll_at: None,
                last_report_at: None,
                consecutive_failures: 0,
                next_attempt_at: None,
                backoff,
                status: ConnectionStatus::Offline,
                pending_report: None,
            }),
            started_at: Instant::now(),
        }
    }

    pub fn connection_health(&self) -> ConnectionHealth {
        let state = self.state.lock().expect("sync state poisoned");
        ConnectionHealth {
            status: state.status,
            last_poll_at: state.last_poll_at,
            last_report_at: state.last_report_at,
            consecutive_failures: state.consecutive_failures,
            next_attempt_at: state.next_attempt_at,
        }
    }

    fn record_success(&self, poll: bool) {
        let mut state = self.state.lock().expect("sync state poisoned");
        let now = Utc::now();
        if poll {
            state.last_poll_at = Some(now);
        } else {
            state.last_report_at = Some(now);
        }
        state.consecutive_failures = 0;
        state.next_attempt_at = None;
        state.backoff = self.settings.backoff_base;
        if state.status != ConnectionStatus::Connected {
            state.status = ConnectionStatus::Connected;
            drop(state);
            let _ = self
                .events
                .send(AgentEvent::connection_changed(ConnectionStatus::Connected));
        }
    }

    /// Returns the delay before the next attempt.
    fn record_failure(&self) -> Duration {
        let mut state = self.state.lock().expect("sync state poisoned");
        state.consecutive_failures += 1;
        let delay = state.backoff;
        state.backoff = (state.backoff * 2).min(self.settings.backoff_cap);
        state.next_attempt_at =
            Some(Utc::now() + chrono::Duration::from_std(delay).unwrap_or_default());

        let status = if state.consecutive_failures > OFFLINE_THRESHOLD {
            ConnectionStatus::Offline
        } else {
            ConnectionStatus::Degraded
        };
        if state.status != status {
            state.status = status;
            drop(state);
            let _ = self.events.send(AgentEvent::connection_changed(status));
        }
        delay
    }

    async fn bump_counter(&self, key: &str) {
        let next = self
            .store
            .get_meta(key)
            .await
            .ok()
            .flatten()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(0)
            + 1;
        let _ = self.store.set_meta(key, &next.to_string()).await;
    }

    /// One poll cycle. Returns true when a new target state was adopted.
    pub async fn poll_once(&self) -> Result<bool, DomainError> {
        let identity = self.device.identity().await?;
        if !identity.provisioned || identity.local_mode {
            return Ok(false);
        }

        let etag = self.state.lock().expect("sync state poisoned").etag.clone();

        match self
            .cloud
            .fetch_target_state(&identity.uuid, &identity.device_key, etag)
            .await
        {
            Ok(PollOutcome::NotModified) => {
                debug!("target state unchanged (304)");
                self.record_success(true);
                self.bump_counter(meta_keys::POLL_COUNT).await;
                Ok(false)
            }
            Ok(PollOutcome::Changed { document, etag }) => {
                let stored = self.reconciler.target_state().await;
                let mut next = stored.clone();
                next.apply_document(document);

                let changed = next != stored;
                if changed {
                    info!(version = next.version, "📥 New target state from cloud");
                    self.reconciler.set_target(next, TargetSource::Cloud).await?;
                    let _ = self
                        .store
                        .set_meta(
                            meta_keys::TARGET_STATE_VERSION,
                            &self.reconciler.target_state().await.version.to_string(),
                        )
                        .await;
                }

                {
                    let mut state = self.state.lock().expect("sync state poisoned");
                    state.etag = etag;
                }
                self.record_success(true);
                self.bump_counter(meta_keys::POLL_COUNT).await;
                Ok(changed)
            }
            Err(e @ DomainError::Unauthenticated(_)) => {
                // Keep operating on the last-known target.
                let _ = self.events.send(AgentEvent::auth_revoked("poll"));
                self.record_failure();
                Err(e)
            }
            Err(e @ DomainError::DeviceUnknown(_)) => {
                let _ = self.events.send(AgentEvent::device_unknown());
                self.record_failure();
                Err(e)
            }
            Err(e) => {
                self.record_failure();
                Err(e)
            }
        }
    }

    async fn build_report(&self) -> Result<StateReport, DomainError> {
        let identity = self.device.identity().await?;
        let target = self.reconciler.target_state().await;
        let apps = self.reconciler.current_state().await.unwrap_or_default();
        let snapshot = match self.collector.latest() {
            Some(snapshot) => snapshot,
            None => self.collector.sample_once().await?,
        };

        Ok(StateReport {
            apps,
            config: target.config.clone(),
            version: target.version,
            cpu_usage: snapshot.cpu_percent,
            memory_usage: snapshot.memory_used,
            memory_total: snapshot.memory_total,
            storage_usage: snapshot.storage_used,
            storage_total: snapshot.storage_total,
            temperature: snapshot.temperature,
            is_online: true,
            local_ip: snapshot.local_ip.clone(),
            os_version: snapshot.os_version.clone(),
            agent_version: identity.agent_version.clone(),
            uptime: self.started_at.elapsed().as_secs(),
            anomaly_summary: Some(self.engine.summary_for_report(10)),
        })
    }

    /// One report cycle: push over HTTP, mirror on MQTT. An MQTT failure
    /// never suppresses the HTTP report.
    pub async fn report_once(&self) -> Result<(), DomainError> {
        let identity = self.device.identity().await?;
        if !identity.provisioned || identity.local_mode {
            return Ok(());
        }

        // A failed snapshot falls back to the buffered one (most recent
        // only, never a queue).
        let report = match self.build_report().await {
            Ok(report) => report,
            Err(e) => {
                let pending = self
                    .state
                    .lock()
                    .expect("sync state poisoned")
                    .pending_report
                    .clone();
                match pending {
                    Some(report) => report,
                    None => return Err(e),
                }
            }
        };

        // Parallel MQTT copy, best effort and unqueued (HTTP is the
        // authoritative channel).
        if let Some(mqtt) = &self.mqtt {
            if mqtt.is_connected() {
                let topic = format!("iot/device/{}/state", identity.uuid);
                if let Ok(payload) = serde_json::to_vec(&report) {
                    if let Err(e) = mqtt.publish_unqueued(&topic, &payload, false).await {
                        debug!(error = %e, "MQTT state mirror failed");
                    }
                }
            }
        }

        match self
            .cloud
            .report_state(&identity.uuid, &identity.device_key, &report)
            .await
        {
            Ok(()) => {
                self.record_success(false);
                self.bump_counter(meta_keys::REPORT_COUNT).await;
                let mut state = self.state.lock().expect("sync state poisoned");
                state.pending_report = None;
                Ok(())
            }
            Err(e @ DomainError::Unauthenticated(_)) => {
                let _ = self.events.send(AgentEvent::auth_revoked("report"));
                self.record_failure();
                Err(e)
            }
            Err(e @ DomainError::DeviceUnknown(_)) => {
                let _ = self.events.send(AgentEvent::device_unknown());
                self.record_failure();
                Err(e)
            }
            Err(e) => {
                // Keep only the most recent snapshot for the next attempt.
                let mut state = self.state.lock().expect("sync state poisoned");
                state.pending_report = Some(report);
                drop(state);
                self.record_failure();
                Err(e)
            }
        }
    }

    /// The poll cadence can be adjusted by the target state itself.
    async fn effective_poll_interval(&self) -> Duration {
        self.reconciler
            .target_state()
            .await
            .config
            .poll_interval_ms()
            .map(Duration::from_millis)
            .unwrap_or(self.settings.poll_interval)
    }

    async fn effective_report_interval(&self) -> Duration {
        self.reconciler
            .target_state()
            .await
            .config
            .report_interval_ms()
            .map(Duration::from_millis)
            .unwrap_or(self.settings.report_interval)
    }

    pub fn spawn_poll_loop(self: &Arc<Self>, cancel: CancellationToken) {
        let sync = Arc::clone(self);
        tokio::spawn(async move {
            info!("🛰️ Target state poll loop started");
            loop {
                let delay = match sync.poll_once().await {
                    Ok(_) => sync.effective_poll_interval().await,
                    Err(e) => {
                        let backoff = sync
                            .state
                            .lock()
                            .expect("sync state poisoned")
                            .next_attempt_at
                            .and_then(|at| (at - Utc::now()).to_std().ok())
                            .unwrap_or(sync.settings.backoff_base);
                        warn!(error = %e, backoff_secs = backoff.as_secs(), "poll failed");
                        backoff
                    }
                };
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            info!("poll loop stopped");
        });
    }

    pub fn spawn_report_loop(self: &Arc<Self>, cancel: CancellationToken) {
        let sync = Arc::clone(self);
        tokio::spawn(async move {
            info!("📡 State report loop started");
            loop {
                let delay = match sync.report_once().await {
                    Ok(()) => sync.effective_report_interval().await,
                    Err(e) => {
                        warn!(error = %e, "report failed");
                        sync.state
                            .lock()
                            .expect("sync state poisoned")
                            .next_attempt_at
                            .and_then(|at| (at - Utc::now()).to_std().ok())
                            .unwrap_or(sync.settings.backoff_base)
                    }
                };
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            info!("report loop stopped");
        });
    }
}
