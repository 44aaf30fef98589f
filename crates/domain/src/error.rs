use thiserror::Error;

use crate::runtime::RuntimeError;

/// Domain-level errors
///
/// The taxonomy mirrors how the agent reacts: transient transport errors are
/// retried by the owning component, auth/protocol errors surface through
/// connection health, configuration errors refuse adoption, and fatal errors
/// terminate the process.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DomainError {
    #[error("Device manager not initialized")]
    NotInitialized,

    #[error("Device is not provisioned")]
    NotProvisioned,

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Authentication rejected: {0}")]
    Unauthenticated(String),

    #[error("Device unknown to the control plane: {0}")]
    DeviceUnknown(String),

    #[error("Invalid target state: {0}")]
    InvalidTargetState(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Driver error: {0}")]
    Driver(String),

    #[error(transparent)]
    Runtime(#[from] RuntimeError),

    #[error("Fatal: {0}")]
    Fatal(String),
}

impl DomainError {
    /// Transient errors are retried locally with backoff and never abort the
    /// agent.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Transport(_) | Self::Driver(_) | Self::Runtime(RuntimeError::Unavailable(_))
        )
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal(_))
    }
}

pub type Result<T> = std::result::Result<T, DomainError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(DomainError::Transport("timeout".into()).is_transient());
        assert!(DomainError::Driver("EPIPE".into()).is_transient());
        assert!(DomainError::Runtime(RuntimeError::Unavailable("socket".into())).is_transient());
        assert!(!DomainError::Unauthenticated("401".into()).is_transient());
        assert!(!DomainError::InvalidTargetState("empty image".into()).is_transient());
    }

    #[test]
    fn test_fatal_classification() {
        assert!(DomainError::Fatal("identity file corrupt".into()).is_fatal());
        assert!(!DomainError::Store("busy".into()).is_fatal());
    }
}
