use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use domain::DomainError;
use domain::telemetry::{MetricSample, SystemProbe, SystemSnapshot};

use crate::anomaly::AnomalyEngine;

/// RSS baseline is taken after this warm-up so allocator start-up noise
/// does not poison the healthcheck.
const RSS_WARMUP: Duration = Duration::from_secs(20);

/// Periodic host sampler feeding the anomaly engine and the state reports.
pub struct MetricsCollector {
    probe: Arc<dyn SystemProbe>,
    engine: Arc<AnomalyEngine>,
    latest: RwLock<Option<SystemSnapshot>>,
    started_at: Instant,
    rss_baseline: Mutex<Option<u64>>,
}

impl MetricsCollector {
    pub fn new(probe: Arc<dyn SystemProbe>, engine: Arc<AnomalyEngine>) -> Self {
        Self {
            probe,
            engine,
            latest: RwLock::new(None),
            started_at: Instant::now(),
            rss_baseline: Mutex::new(None),
        }
    }

    pub fn hostname(&self) -> String {
        self.probe.hostname()
    }

    /// Take one snapshot, feed the anomaly engine, and cache it for the
    /// report loop.
    pub async fn sample_once(&self) -> Result<SystemSnapshot, DomainError> {
        let snapshot = self.probe.snapshot().await?;

        for sample in Self::samples_from(&snapshot) {
            for alert in self.engine.record(&sample) {
                debug!(metric = %alert.metric, severity = %alert.severity, "system anomaly");
            }
        }

        if self.started_at.elapsed() >= RSS_WARMUP {
            let mut baseline = self.rss_baseline.lock().expect("baseline poisoned");
            if baseline.is_none() && snapshot.process_rss_bytes > 0 {
                debug!(rss = snapshot.process_rss_bytes, "captured RSS baseline");
                *baseline = Some(snapshot.process_rss_bytes);
            }
        }

        *self.latest.write().expect("latest poisoned") = Some(snapshot.clone());
        Ok(snapshot)
    }

    fn samples_from(snapshot: &SystemSnapshot) -> Vec<MetricSample> {
        let mut samples = vec![
            MetricSample::system("cpu_percent", snapshot.cpu_percent, "%"),
            MetricSample::system("memory_percent", snapshot.memory_percent, "%"),
            MetricSample::system("storage_percent", snapshot.storage_percent, "%"),
        ];
        if let Some(temperature) = snapshot.temperature {
            samples.push(MetricSample::system("temperature", temperature, "°C"));
        }
        if let Some((one, _, _)) = snapshot.load_average {
            samples.push(MetricSample::system("load_average_1m", one, ""));
        }
        samples
    }

    pub fn latest(&self) -> Option<SystemSnapshot> {
        self.latest.read().expect("latest poisoned").clone()
    }

    /// Healthcheck input: during warm-up the process is healthy by
    /// definition; afterwards RSS growth over the baseline must stay under
    /// the cap.
    pub fn memory_healthy(&self, threshold_mb: u64) -> bool {
        let baseline = *self.rss_baseline.lock().expect("baseline poisoned");
        let Some(baseline) = baseline else {
            return true;
        };
        let Some(snapshot) = self.latest() else {
            return true;
        };
        let growth = snapshot.process_rss_bytes.saturating_sub(baseline);
        growth < threshold_mb * 1024 * 1024
    }

    pub fn spawn(self: &Arc<Self>, interval: Duration, cancel: CancellationToken) {
        let collector = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                if let Err(e) = collector.sample_once().await {
                    warn!(error = %e, "metrics sample failed");
                }
            }
        });
    }
}
