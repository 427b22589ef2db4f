//! Lock status values.

use serde::{Deserialize, Serialize};

/// Transition a resource is in the middle of. `Unlocked` means no live lock.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LockStatus {
    #[default]
    Unlocked,
    Stopping,
    Stopped,
    Starting,
    Started,
    Creating,
    Updating,
    Deleting,
    Redeploying,
    Snapshotting,
    Restoring,
    Committing,
}

impl LockStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LockStatus::Unlocked => "unlocked",
            LockStatus::Stopping => "stopping",
            LockStatus::Stopped => "stopped",
            LockStatus::Starting => "starting",
            LockStatus::Started => "started",
            LockStatus::Creating => "creating",
            LockStatus::Updating => "updating",
            LockStatus::Deleting => "deleting",
            LockStatus::Redeploying => "redeploying",
            LockStatus::Snapshotting => "snapshotting",
            LockStatus::Restoring => "restoring",
            LockStatus::Committing => "committing",
        }
    }

    pub fn is_locked(&self) -> bool {
        *self != LockStatus::Unlocked
    }
}

impl std::fmt::Display for LockStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unlocked_is_default() {
        assert_eq!(LockStatus::default(), LockStatus::Unlocked);
        assert!(!LockStatus::Unlocked.is_locked());
        assert!(LockStatus::Deleting.is_locked());
    }

    #[test]
    fn test_display_matches_serde() {
        let json = serde_json::to_string(&LockStatus::Snapshotting).unwrap();
        assert_eq!(json, "\"snapshotting\"");
        assert_eq!(LockStatus::Snapshotting.to_string(), "snapshotting");
    }
}
