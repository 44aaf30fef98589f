use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, broadcast};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use domain::event::AgentEvent;
use domain::telemetry::MetricSample;

use infrastructure::SqliteStore;
use infrastructure::modbus::{ModbusChannel, ModbusDeviceConfig, ModbusDevicePoller};

use crate::anomaly::AnomalyEngine;

/// Manages one poll actor per configured field device.
///
/// Devices come from the target state's `config.sensors` list; a config
/// change stops all actors and starts fresh ones (hot reload).
pub struct SensorManager {
    events: broadcast::Sender<AgentEvent>,
    engine: Arc<AnomalyEngine>,
    store: Option<Arc<SqliteStore>>,
    actors: Mutex<HashMap<String, CancellationToken>>,
    cancel: CancellationToken,
}

impl SensorManager {
    pub fn new(
        events: broadcast::Sender<AgentEvent>,
        engine: Arc<AnomalyEngine>,
        store: Option<Arc<SqliteStore>>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            events,
            engine,
            store,
            actors: Mutex::new(HashMap::new()),
            cancel,
        }
    }

    /// Start one actor per sensor entry. Invalid entries are logged and
    /// skipped; they never stop the others.
    pub async fn start_devices(&self, sensors: &[serde_json::Value]) {
        let mut actors = self.actors.lock().await;

        for entry in sensors {
            let config = match ModbusDeviceConfig::from_value(entry) {
                Ok(config) => config,
                Err(e) => {
                    error!(error = %e, "skipping invalid sensor entry");
                    continue;
                }
            };

            if actors.contains_key(&config.name) {
                warn!(device = %config.name, "sensor actor already running");
                continue;
            }

            let channel = ModbusChannel::shared(
                config.transport.clone(),
                Duration::from_millis(config.timeout_ms),
            );
            let device_cancel = self.cancel.child_token();
            channel.spawn_keepalive(config.slave_id, device_cancel.clone());

            let name = config.name.clone();
            info!(device = %name, interval_ms = config.poll_interval_ms, "▶️ Starting sensor actor");

            let poller = ModbusDevicePoller::new(config, channel);
            let events = self.events.clone();
            let engine = self.engine.clone();
            let store = self.store.clone();
            let actor_cancel = device_cancel.clone();

            tokio::spawn(async move {
                run_actor(poller, events, engine, store, actor_cancel).await;
            });

            actors.insert(name, device_cancel);
        }
    }

    pub async fn stop_all(&self) {
        let mut actors = self.actors.lock().await;
        for (name, cancel) in actors.drain() {
            info!(device = %name, "Stopping sensor actor");
            cancel.cancel();
        }
    }

    /// Hot reload after a sensors config change.
    pub async fn reload(&self, sensors: &[serde_json::Value]) {
        info!(count = sensors.len(), "🔄 Reloading sensor devices");
        self.stop_all().await;
        self.start_devices(sensors).await;
    }

    pub async fn active_devices(&self) -> Vec<String> {
        self.actors.lock().await.keys().cloned().collect()
    }
}

async fn run_actor(
    mut poller: ModbusDevicePoller,
    events: broadcast::Sender<AgentEvent>,
    engine: Arc<AnomalyEngine>,
    store: Option<Arc<SqliteStore>>,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(poller.poll_interval());
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let frames = poller.poll_once().await;
        if frames.is_empty() {
            continue;
        }

        for frame in &frames {
            if let (Some(value), true) = (frame.value, frame.quality.is_usable()) {
                let sample = MetricSample::sensor(
                    format!("{}/{}", frame.device_name, frame.register_name),
                    value,
                    &frame.unit,
                );
                for alert in engine.record(&sample) {
                    let _ = events.send(AgentEvent::AnomalyDetected { alert });
                }
            }
            if let Some(store) = &store {
                if let Err(e) = store.record_sensor_output(frame).await {
                    warn!(error = %e, "failed to persist sensor frame");
                }
            }
        }

        let _ = events.send(AgentEvent::sensor_batch(
            poller.device_name().to_string(),
            frames,
        ));
    }

    info!(device = %poller.device_name(), "sensor actor stopped");
}
