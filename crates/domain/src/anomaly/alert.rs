use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::detector::DetectorKind;

/// Alert severity, derived from detector confidence and deviation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Critical => "critical",
        }
    }

    /// critical: confidence >= 0.85 or deviation >= 5
    /// warning:  confidence >= 0.7  or deviation >= 3
    pub fn derive(confidence: f64, deviation: f64) -> Self {
        if confidence >= 0.85 || deviation >= 5.0 {
            Self::Critical
        } else if confidence >= 0.7 || deviation >= 3.0 {
            Self::Warning
        } else {
            Self::Info
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Direction of the recent window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Trend {
    Rising,
    Falling,
    Stable,
}

impl Trend {
    /// Compare first- and second-half means of the window.
    pub fn from_window(values: &[f64]) -> Self {
        if values.len() < 4 {
            return Self::Stable;
        }
        let mid = values.len() / 2;
        let first: f64 = values[..mid].iter().sum::<f64>() / mid as f64;
        let second: f64 = values[mid..].iter().sum::<f64>() / (values.len() - mid) as f64;
        let scale = first.abs().max(1e-9);
        let delta = (second - first) / scale;
        if delta > 0.05 {
            Self::Rising
        } else if delta < -0.05 {
            Self::Falling
        } else {
            Self::Stable
        }
    }
}

/// Window context attached to an alert for operator triage.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AlertContext {
    pub recent_values: Vec<f64>,
    pub baseline: f64,
    pub trend: Trend,
    pub window_size: usize,
}

/// A deduplicated anomaly record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Alert {
    pub id: String,
    pub severity: Severity,
    pub metric: String,
    pub value: f64,
    pub expected_range: (f64, f64),
    pub deviation: f64,
    pub method: DetectorKind,
    pub timestamp: DateTime<Utc>,
    pub confidence: f64,
    pub context: AlertContext,
    /// Deterministic dedup key: `metric:method:severity`.
    pub fingerprint: String,
    /// How many times this fingerprint fired within the cooldown window.
    pub count: u32,
}

impl Alert {
    pub fn fingerprint_of(metric: &str, method: DetectorKind, severity: Severity) -> String {
        format!("{metric}:{method}:{severity}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_severity_derivation() {
        assert_eq!(Severity::derive(0.9, 1.0), Severity::Critical);
        assert_eq!(Severity::derive(0.2, 7.5), Severity::Critical);
        assert_eq!(Severity::derive(0.75, 1.0), Severity::Warning);
        assert_eq!(Severity::derive(0.2, 3.5), Severity::Warning);
        assert_eq!(Severity::derive(0.5, 1.0), Severity::Info);
    }

    #[test]
    fn test_fingerprint_is_deterministic() {
        let a = Alert::fingerprint_of("cpu_percent", DetectorKind::ZScore, Severity::Critical);
        let b = Alert::fingerprint_of("cpu_percent", DetectorKind::ZScore, Severity::Critical);
        assert_eq!(a, b);
        assert_eq!(a, "cpu_percent:zscore:critical");
    }

    #[test]
    fn test_trend() {
        assert_eq!(
            Trend::from_window(&[1.0, 1.0, 2.0, 2.0]),
            Trend::Rising
        );
        assert_eq!(
            Trend::from_window(&[2.0, 2.0, 1.0, 1.0]),
            Trend::Falling
        );
        assert_eq!(
            Trend::from_window(&[1.0, 1.0, 1.0, 1.0]),
            Trend::Stable
        );
        assert_eq!(Trend::from_window(&[1.0]), Trend::Stable);
    }
}
