use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{Quality, QualityCode};

/// One acquired register value, the unit the sensing adapter emits.
///
/// BAD frames carry a `quality_code` naming the root cause and a null value.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SensorFrame {
    pub device_name: String,
    pub register_name: String,
    pub value: Option<f64>,
    pub unit: String,
    pub timestamp: DateTime<Utc>,
    pub quality: Quality,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quality_code: Option<QualityCode>,
}

impl SensorFrame {
    pub fn good(
        device_name: impl Into<String>,
        register_name: impl Into<String>,
        value: f64,
        unit: impl Into<String>,
    ) -> Self {
        Self {
            device_name: device_name.into(),
            register_name: register_name.into(),
            value: Some(value),
            unit: unit.into(),
            timestamp: Utc::now(),
            quality: Quality::Good,
            quality_code: None,
        }
    }

    pub fn bad(
        device_name: impl Into<String>,
        register_name: impl Into<String>,
        unit: impl Into<String>,
        code: QualityCode,
    ) -> Self {
        Self {
            device_name: device_name.into(),
            register_name: register_name.into(),
            value: None,
            unit: unit.into(),
            timestamp: Utc::now(),
            quality: Quality::Bad,
            quality_code: Some(code),
        }
    }
}
