//! Infrastructure layer - adapters to the outside world
//!
//! Implements the domain trait seams against real collaborators: the local
//! sqlite store, the cloud HTTP control plane, the MQTT broker, the Modbus
//! field bus, the Docker runtime, and host telemetry.

pub mod cloud;
pub mod config;
pub mod database;
pub mod metrics;
pub mod modbus;
pub mod mqtt;
pub mod runtime;

pub use cloud::CloudClient;
pub use config::AgentConfig;
pub use database::SqliteStore;
pub use metrics::SysinfoProbe;
pub use mqtt::{MqttClient, MqttMessage};
pub use runtime::DockerRuntime;
