//! Application layer - use-cases wired over the domain trait seams
//!
//! Owns the long-running managers: device provisioning, state
//! reconciliation, anomaly detection, host metrics, and field-bus sensing.

pub mod anomaly;
pub mod metrics;
pub mod provisioning;
pub mod reconciler;
pub mod sensing;

pub use anomaly::{AlertManager, AnomalyEngine};
pub use metrics::MetricsCollector;
pub use provisioning::DeviceManager;
pub use reconciler::StateReconciler;
pub use sensing::SensorManager;
