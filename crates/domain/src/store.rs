use async_trait::async_trait;

use crate::error::DomainError;
use crate::identity::DeviceIdentity;
use crate::state::TargetState;

/// Narrow interface over the embedded single-writer store.
///
/// `device` and `target_state` writes are transactional; readers always
/// observe either the old or the new row, never a partial write.
#[cfg_attr(any(test, feature = "mockall"), mockall::automock)]
#[async_trait]
pub trait DeviceStore: Send + Sync {
    async fn load_device(&self) -> Result<Option<DeviceIdentity>, DomainError>;

    async fn save_device(&self, identity: &DeviceIdentity) -> Result<(), DomainError>;

    async fn load_target_state(&self) -> Result<Option<TargetState>, DomainError>;

    async fn save_target_state(&self, state: &TargetState) -> Result<(), DomainError>;

    async fn get_meta(&self, key: &str) -> Result<Option<String>, DomainError>;

    async fn set_meta(&self, key: &str, value: &str) -> Result<(), DomainError>;

    /// Drop persisted workload and sensor state (factory reset); identity is
    /// handled separately through `save_device`.
    async fn clear_workload_state(&self) -> Result<(), DomainError>;
}

/// Well-known metadata keys.
pub mod meta_keys {
    pub const TARGET_STATE_VERSION: &str = "target_state_version";
    pub const LAST_POLL_AT: &str = "last_poll_at";
    pub const LAST_REPORT_AT: &str = "last_report_at";
    pub const POLL_COUNT: &str = "poll_count";
    pub const REPORT_COUNT: &str = "report_count";
}
