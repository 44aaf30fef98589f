mod frame;
mod quality;

pub use frame::SensorFrame;
pub use quality::{Quality, QualityCode};
