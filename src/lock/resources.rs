//! Experiment and VM lock accessors.
//!
//! Each `lock_*` call tries to take the lock with a status and a TTL chosen
//! per operation. When another operation holds the lock the call fails with
//! `FleetError::Locked` naming the holder's status.

use std::time::Duration;

use crate::error::{FleetError, Result};

use super::cache::{LockEntry, ResourceLocker};
use super::status::LockStatus;

/// Lock lifetimes per operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockTtls {
    pub experiment_creation: Duration,
    pub experiment_update: Duration,
    pub experiment_deletion: Duration,
    pub experiment_starting: Duration,
    pub experiment_stopping: Duration,
    pub vm_starting: Duration,
    pub vm_stopping: Duration,
    pub vm_redeploying: Duration,
    pub vm_snapshotting: Duration,
    pub vm_restoring: Duration,
    pub vm_committing: Duration,
}

impl Default for LockTtls {
    fn default() -> Self {
        let one = Duration::from_secs(60);
        let five = Duration::from_secs(5 * 60);

        Self {
            experiment_creation: five,
            experiment_update: five,
            experiment_deletion: one,
            experiment_starting: five,
            experiment_stopping: one,
            vm_starting: one,
            vm_stopping: one,
            vm_redeploying: five,
            vm_snapshotting: five,
            vm_restoring: five,
            vm_committing: five,
        }
    }
}

fn experiment_key(name: &str) -> String {
    format!("experiment|{}", name)
}

fn vm_key(experiment: &str, name: &str) -> String {
    format!("vm|{}/{}", experiment, name)
}

/// Lock surface shared by everything that mutates experiments or their VMs.
#[derive(Debug, Default)]
pub struct ResourceLocks {
    locker: ResourceLocker,
    ttls: LockTtls,
}

impl ResourceLocks {
    pub fn new(ttls: LockTtls) -> Self {
        Self {
            locker: ResourceLocker::new(),
            ttls,
        }
    }

    pub fn ttls(&self) -> &LockTtls {
        &self.ttls
    }

    fn acquire(&self, key: &str, resource: String, status: LockStatus, ttl: Duration) -> Result<()> {
        match self.locker.lock(key, status, ttl)? {
            LockStatus::Unlocked => Ok(()),
            held => Err(FleetError::Locked {
                resource,
                status: held.to_string(),
            }),
        }
    }

    fn lock_experiment(&self, name: &str, status: LockStatus, ttl: Duration) -> Result<()> {
        self.acquire(&experiment_key(name), format!("experiment {}", name), status, ttl)
    }

    fn lock_vm(&self, experiment: &str, name: &str, status: LockStatus, ttl: Duration) -> Result<()> {
        self.acquire(
            &vm_key(experiment, name),
            format!("VM {}/{}", experiment, name),
            status,
            ttl,
        )
    }

    pub fn lock_experiment_for_creation(&self, name: &str) -> Result<()> {
        self.lock_experiment(name, LockStatus::Creating, self.ttls.experiment_creation)
    }

    pub fn lock_experiment_for_update(&self, name: &str) -> Result<()> {
        self.lock_experiment(name, LockStatus::Updating, self.ttls.experiment_update)
    }

    pub fn lock_experiment_for_deletion(&self, name: &str) -> Result<()> {
        self.lock_experiment(name, LockStatus::Deleting, self.ttls.experiment_deletion)
    }

    pub fn lock_experiment_for_starting(&self, name: &str) -> Result<()> {
        self.lock_experiment(name, LockStatus::Starting, self.ttls.experiment_starting)
    }

    pub fn lock_experiment_for_stopping(&self, name: &str) -> Result<()> {
        self.lock_experiment(name, LockStatus::Stopping, self.ttls.experiment_stopping)
    }

    /// Current holder status, `Unlocked` when free.
    pub fn is_experiment_locked(&self, name: &str) -> LockStatus {
        self.locker.locked(&experiment_key(name))
    }

    pub fn experiment_lock(&self, name: &str) -> Option<LockEntry> {
        self.locker.entry(&experiment_key(name))
    }

    pub fn unlock_experiment(&self, name: &str) {
        self.locker.unlock(&experiment_key(name));
    }

    pub fn lock_vm_for_starting(&self, experiment: &str, name: &str) -> Result<()> {
        self.lock_vm(experiment, name, LockStatus::Starting, self.ttls.vm_starting)
    }

    pub fn lock_vm_for_stopping(&self, experiment: &str, name: &str) -> Result<()> {
        self.lock_vm(experiment, name, LockStatus::Stopping, self.ttls.vm_stopping)
    }

    pub fn lock_vm_for_redeploying(&self, experiment: &str, name: &str) -> Result<()> {
        self.lock_vm(experiment, name, LockStatus::Redeploying, self.ttls.vm_redeploying)
    }

    pub fn lock_vm_for_snapshotting(&self, experiment: &str, name: &str) -> Result<()> {
        self.lock_vm(experiment, name, LockStatus::Snapshotting, self.ttls.vm_snapshotting)
    }

    /// Memory snapshots share the snapshot status and TTL.
    pub fn lock_vm_for_memory_snapshotting(&self, experiment: &str, name: &str) -> Result<()> {
        self.lock_vm(experiment, name, LockStatus::Snapshotting, self.ttls.vm_snapshotting)
    }

    pub fn lock_vm_for_restoring(&self, experiment: &str, name: &str) -> Result<()> {
        self.lock_vm(experiment, name, LockStatus::Restoring, self.ttls.vm_restoring)
    }

    pub fn lock_vm_for_committing(&self, experiment: &str, name: &str) -> Result<()> {
        self.lock_vm(experiment, name, LockStatus::Committing, self.ttls.vm_committing)
    }

    pub fn is_vm_locked(&self, experiment: &str, name: &str) -> LockStatus {
        self.locker.locked(&vm_key(experiment, name))
    }

    pub fn unlock_vm(&self, experiment: &str, name: &str) {
        self.locker.unlock(&vm_key(experiment, name));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_experiment_contention_message() {
        let locks = ResourceLocks::default();
        locks.lock_experiment_for_starting("e1").unwrap();

        let err = locks.lock_experiment_for_deletion("e1").unwrap_err();
        assert_eq!(err.to_string(), "experiment e1 is locked with status starting");
        assert_eq!(locks.is_experiment_locked("e1"), LockStatus::Starting);
    }

    #[test]
    fn test_vm_contention_message() {
        let locks = ResourceLocks::default();
        locks.lock_vm_for_snapshotting("e1", "host").unwrap();

        let err = locks.lock_vm_for_restoring("e1", "host").unwrap_err();
        assert_eq!(err.to_string(), "VM e1/host is locked with status snapshotting");
    }

    #[test]
    fn test_experiment_and_vm_keys_are_independent() {
        let locks = ResourceLocks::default();
        locks.lock_experiment_for_update("e1").unwrap();
        locks.lock_vm_for_starting("e1", "e1").unwrap();

        assert_eq!(locks.is_experiment_locked("e1"), LockStatus::Updating);
        assert_eq!(locks.is_vm_locked("e1", "e1"), LockStatus::Starting);
        assert_eq!(locks.is_vm_locked("e2", "e1"), LockStatus::Unlocked);
    }

    #[test]
    fn test_unlock_allows_relock() {
        let locks = ResourceLocks::default();
        locks.lock_experiment_for_creation("e1").unwrap();
        locks.unlock_experiment("e1");
        locks.lock_experiment_for_stopping("e1").unwrap();
        assert_eq!(locks.is_experiment_locked("e1"), LockStatus::Stopping);

        locks.lock_vm_for_committing("e1", "vm").unwrap();
        locks.unlock_vm("e1", "vm");
        assert_eq!(locks.is_vm_locked("e1", "vm"), LockStatus::Unlocked);
    }

    #[test]
    fn test_default_ttls() {
        let ttls = LockTtls::default();
        assert_eq!(ttls.experiment_starting, Duration::from_secs(300));
        assert_eq!(ttls.experiment_deletion, Duration::from_secs(60));
        assert_eq!(ttls.vm_stopping, Duration::from_secs(60));
        assert_eq!(ttls.vm_committing, Duration::from_secs(300));
    }

    #[tokio::test(start_paused = true)]
    async fn test_deletion_lock_expires_after_one_minute() {
        let locks = ResourceLocks::default();
        locks.lock_experiment_for_deletion("e1").unwrap();

        tokio::time::advance(Duration::from_secs(59)).await;
        assert!(locks.lock_experiment_for_creation("e1").is_err());

        tokio::time::advance(Duration::from_secs(2)).await;
        locks.lock_experiment_for_creation("e1").unwrap();
        assert_eq!(locks.is_experiment_locked("e1"), LockStatus::Creating);
    }

    #[test]
    fn test_memory_snapshot_uses_snapshot_status() {
        let locks = ResourceLocks::default();
        locks.lock_vm_for_memory_snapshotting("e1", "vm").unwrap();
        assert_eq!(locks.is_vm_locked("e1", "vm"), LockStatus::Snapshotting);
        assert!(locks.lock_vm_for_redeploying("e1", "vm").is_err());
    }

    #[test]
    fn test_experiment_lock_entry() {
        let locks = ResourceLocks::default();
        assert!(locks.experiment_lock("e1").is_none());
        locks.lock_experiment_for_update("e1").unwrap();
        let entry = locks.experiment_lock("e1").unwrap();
        assert_eq!(entry.status, LockStatus::Updating);
    }
}
