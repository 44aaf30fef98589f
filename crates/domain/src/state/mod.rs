mod current;
mod step;
mod target;

pub use current::{CurrentState, ObservedApp, ObservedService, ServiceStatus};
pub use step::{CompositionStep, ServiceDiff, UpdateStrategy};
pub use target::{
    App, ConfigPatch, DeviceConfig, Service, TargetSource, TargetState, TargetStateDocument,
};
