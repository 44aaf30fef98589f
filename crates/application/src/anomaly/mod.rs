mod alerts;
mod engine;

pub use alerts::{AlertManager, AlertStats, IngestOutcome};
pub use engine::AnomalyEngine;
