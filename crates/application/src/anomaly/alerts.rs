use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use chrono::Utc;

use domain::anomaly::{Alert, Severity};

/// Tail length of the `recent_values` context on an existing alert.
const RECENT_VALUES_TAIL: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    /// A new alert record was created.
    New,
    /// An existing record within the cooldown absorbed the hit.
    Updated,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct AlertStats {
    pub metrics_tracked: usize,
    pub total_alerts: u64,
    pub critical_count: usize,
    pub warning_count: usize,
    pub info_count: usize,
}

/// Deduplicating bounded alert store.
///
/// Alerts are keyed by fingerprint: within the cooldown window a duplicate
/// increments `count` and refreshes the timestamp on the existing record;
/// outside it a new record is created. The queue is bounded and evicts the
/// oldest record on overflow.
pub struct AlertManager {
    alerts: Mutex<VecDeque<Alert>>,
    cooldown: Duration,
    capacity: usize,
    total: Mutex<u64>,
}

impl AlertManager {
    pub fn new(cooldown: Duration, capacity: usize) -> Self {
        Self {
            alerts: Mutex::new(VecDeque::new()),
            cooldown,
            capacity: capacity.max(1),
            total: Mutex::new(0),
        }
    }

    pub fn ingest(&self, candidate: Alert) -> IngestOutcome {
        let mut alerts = self.alerts.lock().expect("alerts poisoned");
        *self.total.lock().expect("total poisoned") += 1;

        let now = Utc::now();
        let cooldown = chrono::Duration::from_std(self.cooldown).unwrap_or_default();

        if let Some(existing) = alerts
            .iter_mut()
            .rev()
            .find(|a| a.fingerprint == candidate.fingerprint && now - a.timestamp < cooldown)
        {
            existing.count += 1;
            existing.timestamp = candidate.timestamp;
            existing.value = candidate.value;
            existing.deviation = candidate.deviation;
            existing.confidence = existing.confidence.max(candidate.confidence);
            existing.context.recent_values.push(candidate.value);
            let overflow = existing
                .context
                .recent_values
                .len()
                .saturating_sub(RECENT_VALUES_TAIL);
            if overflow > 0 {
                existing.context.recent_values.drain(..overflow);
            }
            return IngestOutcome::Updated;
        }

        if alerts.len() == self.capacity {
            alerts.pop_front();
        }
        alerts.push_back(candidate);
        IngestOutcome::New
    }

    pub fn recent(&self, limit: usize) -> Vec<Alert> {
        let alerts = self.alerts.lock().expect("alerts poisoned");
        alerts.iter().rev().take(limit).cloned().collect()
    }

    pub fn find(&self, fingerprint: &str) -> Option<Alert> {
        let alerts = self.alerts.lock().expect("alerts poisoned");
        alerts
            .iter()
            .rev()
            .find(|a| a.fingerprint == fingerprint)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.alerts.lock().expect("alerts poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self, metrics_tracked: usize) -> AlertStats {
        let alerts = self.alerts.lock().expect("alerts poisoned");
        let count_of = |severity: Severity| alerts.iter().filter(|a| a.severity == severity).count();
        AlertStats {
            metrics_tracked,
            total_alerts: *self.total.lock().expect("total poisoned"),
            critical_count: count_of(Severity::Critical),
            warning_count: count_of(Severity::Warning),
            info_count: count_of(Severity::Info),
        }
    }
}
