use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::buffer::StatBuffer;

/// Detection methods the engine can apply to a metric.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectorKind {
    ZScore,
    Mad,
    Iqr,
    RateOfChange,
    Ewma,
}

impl DetectorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ZScore => "zscore",
            Self::Mad => "mad",
            Self::Iqr => "iqr",
            Self::RateOfChange => "rate_of_change",
            Self::Ewma => "ewma",
        }
    }
}

impl std::fmt::Display for DetectorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of applying one detector to one sample.
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    pub is_anomaly: bool,
    /// How certain the detector is, in [0, 1].
    pub confidence: f64,
    /// Normalized distance from the expected value (method-specific units).
    pub deviation: f64,
    pub expected_range: (f64, f64),
    pub message: String,
}

impl Detection {
    fn normal(expected_range: (f64, f64)) -> Self {
        Self {
            is_anomaly: false,
            confidence: 0.0,
            deviation: 0.0,
            expected_range,
            message: String::new(),
        }
    }
}

/// Detector thresholds; sensitivity scaling is applied by the engine.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DetectorThresholds {
    #[serde(default = "default_zscore")]
    pub zscore: f64,
    #[serde(default = "default_mad")]
    pub mad: f64,
    #[serde(default = "default_iqr_k")]
    pub iqr_k: f64,
    /// Percent change per second.
    #[serde(default = "default_roc")]
    pub rate_of_change: f64,
    #[serde(default = "default_ewma_alpha")]
    pub ewma_alpha: f64,
    /// Residual limit as a multiple of the window std-dev.
    #[serde(default = "default_ewma_multiplier")]
    pub ewma_multiplier: f64,
}

fn default_zscore() -> f64 {
    3.0
}
fn default_mad() -> f64 {
    3.0
}
fn default_iqr_k() -> f64 {
    1.5
}
fn default_roc() -> f64 {
    50.0
}
fn default_ewma_alpha() -> f64 {
    0.3
}
fn default_ewma_multiplier() -> f64 {
    3.0
}

impl Default for DetectorThresholds {
    fn default() -> Self {
        Self {
            zscore: default_zscore(),
            mad: default_mad(),
            iqr_k: default_iqr_k(),
            rate_of_change: default_roc(),
            ewma_alpha: default_ewma_alpha(),
            ewma_multiplier: default_ewma_multiplier(),
        }
    }
}

fn confidence_from(deviation: f64, threshold: f64) -> f64 {
    (deviation / (2.0 * threshold.max(f64::EPSILON))).clamp(0.0, 1.0)
}

/// Z-score test against the window mean and std-dev. A constant baseline
/// (zero variance) flags any deviation from the mean.
pub fn zscore(buffer: &StatBuffer, value: f64, threshold: f64) -> Detection {
    let mean = buffer.mean();
    let sigma = buffer.std_dev();

    if sigma <= f64::EPSILON {
        if (value - mean).abs() > f64::EPSILON {
            return Detection {
                is_anomaly: true,
                confidence: 1.0,
                deviation: (value - mean).abs(),
                expected_range: (mean, mean),
                message: format!("value {value} deviates from constant baseline {mean}"),
            };
        }
        return Detection::normal((mean, mean));
    }

    let expected = (mean - threshold * sigma, mean + threshold * sigma);
    let deviation = (value - mean).abs() / sigma;
    if deviation > threshold {
        Detection {
            is_anomaly: true,
            confidence: confidence_from(deviation, threshold),
            deviation,
            expected_range: expected,
            message: format!(
                "value {value:.4} is {deviation:.2} std-devs from mean {mean:.4}"
            ),
        }
    } else {
        Detection::normal(expected)
    }
}

/// Median absolute deviation test; robust against outliers in the window.
pub fn mad(buffer: &mut StatBuffer, value: f64, threshold: f64) -> Detection {
    let median = buffer.median();
    let mad_value = buffer.mad();

    if mad_value <= f64::EPSILON {
        if (value - median).abs() > f64::EPSILON {
            return Detection {
                is_anomaly: true,
                confidence: 1.0,
                deviation: (value - median).abs(),
                expected_range: (median, median),
                message: format!("value {value} deviates from constant median {median}"),
            };
        }
        return Detection::normal((median, median));
    }

    let expected = (median - threshold * mad_value, median + threshold * mad_value);
    let deviation = (value - median).abs() / mad_value;
    if deviation > threshold {
        Detection {
            is_anomaly: true,
            confidence: confidence_from(deviation, threshold),
            deviation,
            expected_range: expected,
            message: format!(
                "value {value:.4} is {deviation:.2} MADs from median {median:.4}"
            ),
        }
    } else {
        Detection::normal(expected)
    }
}

/// Tukey's fences on the interquartile range.
pub fn iqr(buffer: &mut StatBuffer, value: f64, k: f64) -> Detection {
    let q1 = buffer.quantile(0.25);
    let q3 = buffer.quantile(0.75);
    let range = q3 - q1;
    let lower = q1 - k * range;
    let upper = q3 + k * range;

    if value >= lower && value <= upper {
        return Detection::normal((lower, upper));
    }

    let distance = if value < lower {
        lower - value
    } else {
        value - upper
    };
    let deviation = if range > f64::EPSILON {
        distance / range
    } else {
        distance
    };
    Detection {
        is_anomaly: true,
        confidence: confidence_from(deviation, k),
        deviation,
        expected_range: (lower, upper),
        message: format!("value {value:.4} outside Tukey fences [{lower:.4}, {upper:.4}]"),
    }
}

/// Normalized percent change per second computed from the last sample.
pub fn rate_of_change(
    buffer: &StatBuffer,
    value: f64,
    timestamp: DateTime<Utc>,
    threshold_pct_per_sec: f64,
) -> Detection {
    let Some((prev, prev_ts)) = buffer.last() else {
        return Detection::normal((value, value));
    };
    let dt_secs = (timestamp - prev_ts).num_milliseconds() as f64 / 1000.0;
    if dt_secs <= 0.0 {
        return Detection::normal((prev, prev));
    }

    let base = prev.abs().max(f64::EPSILON);
    let pct_per_sec = ((value - prev) / base * 100.0) / dt_secs;
    let magnitude = pct_per_sec.abs();
    let expected = (
        prev - base * threshold_pct_per_sec / 100.0 * dt_secs,
        prev + base * threshold_pct_per_sec / 100.0 * dt_secs,
    );

    if magnitude > threshold_pct_per_sec {
        let deviation = magnitude / threshold_pct_per_sec;
        Detection {
            is_anomaly: true,
            confidence: confidence_from(deviation, 1.0),
            deviation,
            expected_range: expected,
            message: format!("value changed {pct_per_sec:.2}%/s from {prev:.4}"),
        }
    } else {
        Detection::normal(expected)
    }
}

/// Exponentially-weighted moving average state for one metric.
#[derive(Debug, Clone, Default)]
pub struct EwmaState {
    smoothed: Option<f64>,
}

impl EwmaState {
    pub fn smoothed(&self) -> Option<f64> {
        self.smoothed
    }
}

/// EWMA residual test: flags when the sample strays from the smoothed value
/// by more than `multiplier` window std-devs, then folds the sample in.
pub fn ewma(
    state: &mut EwmaState,
    buffer: &StatBuffer,
    value: f64,
    alpha: f64,
    multiplier: f64,
) -> Detection {
    let Some(prev) = state.smoothed else {
        state.smoothed = Some(value);
        return Detection::normal((value, value));
    };

    let sigma = buffer.std_dev();
    let detection = if sigma <= f64::EPSILON {
        if (value - prev).abs() > f64::EPSILON {
            Detection {
                is_anomaly: true,
                confidence: 1.0,
                deviation: (value - prev).abs(),
                expected_range: (prev, prev),
                message: format!("value {value} deviates from constant EWMA {prev}"),
            }
        } else {
            Detection::normal((prev, prev))
        }
    } else {
        let limit = multiplier * sigma;
        let expected = (prev - limit, prev + limit);
        let residual = (value - prev).abs();
        if residual > limit {
            let deviation = residual / sigma;
            Detection {
                is_anomaly: true,
                confidence: confidence_from(deviation, multiplier),
                deviation,
                expected_range: expected,
                message: format!(
                    "value {value:.4} strays {residual:.4} from EWMA {prev:.4}"
                ),
            }
        } else {
            Detection::normal(expected)
        }
    };

    state.smoothed = Some(alpha * value + (1.0 - alpha) * prev);
    detection
}
