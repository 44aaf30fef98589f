use std::sync::RwLock;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use serde_json::json;
use tracing::{debug, info};

use domain::anomaly::{
    Alert, AlertContext, AnomalyConfig, Detection, DetectorKind, EwmaState, Severity, StatBuffer,
    Trend, ewma, iqr, mad, rate_of_change, zscore,
};
use domain::telemetry::{MetricSample, MetricSource};

use super::alerts::{AlertManager, IngestOutcome};

struct MetricState {
    buffer: StatBuffer,
    ewma: EwmaState,
}

/// Per-metric rolling-window anomaly detection.
///
/// Samples are checked against the window *before* being folded in, so the
/// baseline is always the history excluding the suspect value. A metric
/// needs `min_samples` history before any detector activates.
pub struct AnomalyEngine {
    config: RwLock<AnomalyConfig>,
    metrics: DashMap<String, MetricState>,
    alerts: AlertManager,
}

impl AnomalyEngine {
    pub fn new(config: AnomalyConfig) -> Self {
        let alerts = AlertManager::new(
            Duration::from_secs(config.cooldown_secs),
            config.queue_size,
        );
        Self {
            config: RwLock::new(config),
            metrics: DashMap::new(),
            alerts,
        }
    }

    pub fn alerts(&self) -> &AlertManager {
        &self.alerts
    }

    /// Swap the detection configuration (buffers are kept; windows resize
    /// lazily as metrics re-register).
    pub fn reload(&self, config: AnomalyConfig) {
        info!("🔄 Reloading anomaly configuration");
        *self.config.write().expect("config poisoned") = config;
    }

    fn run_detector(
        state: &mut MetricState,
        method: DetectorKind,
        sample: &MetricSample,
        config: &AnomalyConfig,
    ) -> Detection {
        let thresholds = &config.thresholds;
        let sensitivity = config.sensitivity.max(0.1);
        match method {
            DetectorKind::ZScore => {
                zscore(&state.buffer, sample.value, thresholds.zscore / sensitivity)
            }
            DetectorKind::Mad => mad(
                &mut state.buffer,
                sample.value,
                thresholds.mad / sensitivity,
            ),
            DetectorKind::Iqr => iqr(
                &mut state.buffer,
                sample.value,
                thresholds.iqr_k / sensitivity,
            ),
            DetectorKind::RateOfChange => rate_of_change(
                &state.buffer,
                sample.value,
                Utc::now(),
                thresholds.rate_of_change / sensitivity,
            ),
            DetectorKind::Ewma => ewma(
                &mut state.ewma,
                &state.buffer,
                sample.value,
                thresholds.ewma_alpha,
                thresholds.ewma_multiplier / sensitivity,
            ),
        }
    }

    /// Feed one sample; returns alerts that created a NEW record (cooldown
    /// duplicates update the existing record silently).
    pub fn record(&self, sample: &MetricSample) -> Vec<Alert> {
        let config = self.config.read().expect("config poisoned").clone();
        if !config.enabled || !sample.quality.is_usable() {
            return Vec::new();
        }

        let is_sensor = sample.source == MetricSource::Sensor;
        let window = config.window_for(&sample.metric, is_sensor);

        let mut state = self
            .metrics
            .entry(sample.metric.clone())
            .or_insert_with(|| MetricState {
                buffer: StatBuffer::new(window),
                ewma: EwmaState::default(),
            });

        let mut created = Vec::new();
        if state.buffer.len() >= config.min_samples {
            for method in config.methods_for(&sample.metric) {
                let detection = Self::run_detector(&mut state, method, sample, &config);
                if !detection.is_anomaly || detection.confidence < config.confidence_floor {
                    continue;
                }
                let alert = Self::build_alert(&state.buffer, method, sample, &detection);
                debug!(
                    metric = %sample.metric,
                    method = %method,
                    severity = %alert.severity,
                    deviation = detection.deviation,
                    "anomaly detected"
                );
                if self.alerts.ingest(alert.clone()) == IngestOutcome::New {
                    created.push(alert);
                }
            }
        }

        state.buffer.push(sample.value, Utc::now());
        created
    }

    fn build_alert(
        buffer: &StatBuffer,
        method: DetectorKind,
        sample: &MetricSample,
        detection: &Detection,
    ) -> Alert {
        let severity = Severity::derive(detection.confidence, detection.deviation);
        let recent = buffer.recent(10);
        Alert {
            id: uuid::Uuid::new_v4().to_string(),
            severity,
            metric: sample.metric.clone(),
            value: sample.value,
            expected_range: detection.expected_range,
            deviation: detection.deviation,
            method,
            timestamp: Utc::now(),
            confidence: detection.confidence,
            context: AlertContext {
                trend: Trend::from_window(&recent),
                recent_values: recent,
                baseline: buffer.mean(),
                window_size: buffer.capacity(),
            },
            fingerprint: Alert::fingerprint_of(&sample.metric, method, severity),
            count: 1,
        }
    }

    pub fn metrics_tracked(&self) -> usize {
        self.metrics.len()
    }

    pub fn is_enabled(&self) -> bool {
        self.config.read().expect("config poisoned").enabled
    }

    /// The summary block attached to state reports.
    pub fn summary_for_report(&self, max_recent: usize) -> serde_json::Value {
        let stats = self.alerts.stats(self.metrics_tracked());
        json!({
            "enabled": self.is_enabled(),
            "stats": {
                "metricsTracked": stats.metrics_tracked,
                "totalAlerts": stats.total_alerts,
                "criticalCount": stats.critical_count,
                "warningCount": stats.warning_count,
                "infoCount": stats.info_count,
            },
            "recentAlerts": self.alerts.recent(max_recent),
        })
    }
}
