mod entity;

pub use entity::{BrokerConfig, DeviceIdentity};
