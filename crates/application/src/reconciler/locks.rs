use dashmap::DashMap;

use domain::DomainError;

#[derive(Debug)]
struct LockState {
    holder: u64,
    depth: u32,
}

/// Per-app reentrant lock tickets.
///
/// Destructive steps for an app execute under its lock; concurrent reconcile
/// passes (the ticker vs. a local API action) contend here. `force`
/// preempts a stale holder.
#[derive(Default)]
pub struct AppLockRegistry {
    locks: DashMap<String, LockState>,
}

impl AppLockRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn acquire(&self, app_id: &str, holder: u64, force: bool) -> Result<(), DomainError> {
        let mut entry = self
            .locks
            .entry(app_id.to_string())
            .or_insert(LockState { holder, depth: 0 });

        if entry.holder == holder {
            entry.depth += 1;
            return Ok(());
        }
        if force {
            entry.holder = holder;
            entry.depth = 1;
            return Ok(());
        }
        Err(DomainError::Protocol(format!(
            "app {app_id} is locked by another update"
        )))
    }

    pub fn release(&self, app_id: &str, holder: u64) {
        let mut remove = false;
        if let Some(mut entry) = self.locks.get_mut(app_id) {
            if entry.holder != holder {
                return;
            }
            entry.depth = entry.depth.saturating_sub(1);
            remove = entry.depth == 0;
        }
        if remove {
            self.locks.remove(app_id);
        }
    }

    /// Drop every ticket a holder still has (cleanup after a failed pass).
    pub fn release_all(&self, holder: u64) {
        self.locks.retain(|_, state| state.holder != holder);
    }

    pub fn is_locked(&self, app_id: &str) -> bool {
        self.locks.contains_key(app_id)
    }
}
