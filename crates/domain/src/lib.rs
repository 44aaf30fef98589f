//! Domain layer - Pure business logic with no external dependencies
//!
//! This crate contains:
//! - Entities (DeviceIdentity, TargetState, CurrentState)
//! - Value Objects (CompositionStep, SensorFrame, Quality, Alert)
//! - Domain Events
//! - Collaborator interfaces (traits): store, runtime, control plane, probe
//!
//! Principles:
//! - No dependencies on infrastructure
//! - Business rules enforced at domain level
//! - Rich domain models with behavior
//! - Testable in isolation

pub mod anomaly;
pub mod cloud;
pub mod error;
pub mod event;
pub mod identity;
pub mod runtime;
pub mod sensor;
pub mod state;
pub mod store;
pub mod telemetry;

// Re-export commonly used types
pub use error::DomainError;
pub use event::AgentEvent;
pub use identity::DeviceIdentity;
pub use sensor::{Quality, QualityCode, SensorFrame};
pub use state::{CompositionStep, CurrentState, ServiceStatus, TargetState};
