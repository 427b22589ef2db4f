//! TTL cache and the status-carrying resource lock built on it.
//!
//! Expiry is lazy: an expired entry is treated as absent and dropped the next
//! time its key is touched. Nothing sweeps the map in the background.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

use super::status::LockStatus;
use crate::error::{FleetError, Result};

const LOCK_PREFIX: &str = "LOCK|";

#[derive(Debug, Clone)]
struct Entry<V> {
    value: V,
    expires_at: Instant,
}

impl<V> Entry<V> {
    fn is_live(&self, now: Instant) -> bool {
        now < self.expires_at
    }
}

/// String-keyed cache with per-entry expiry behind one mutex.
#[derive(Debug)]
pub struct TtlCache<V> {
    entries: Mutex<HashMap<String, Entry<V>>>,
}

impl<V: Clone> TtlCache<V> {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn get(&self, key: &str) -> Option<V> {
        let now = Instant::now();
        let mut entries = self.entries.lock().unwrap();

        match entries.get(key) {
            Some(entry) if entry.is_live(now) => Some(entry.value.clone()),
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    /// Insert only if no live entry exists; otherwise return the live value untouched.
    pub fn add(&self, key: impl Into<String>, value: V, ttl: Duration) -> std::result::Result<(), V> {
        let key = key.into();
        let now = Instant::now();
        let mut entries = self.entries.lock().unwrap();

        if let Some(existing) = entries.get(&key) {
            if existing.is_live(now) {
                return Err(existing.value.clone());
            }
        }

        entries.insert(
            key,
            Entry {
                value,
                expires_at: now + ttl,
            },
        );
        Ok(())
    }

    pub fn delete(&self, key: &str) {
        self.entries.lock().unwrap().remove(key);
    }

    /// Absolute expiry of a live entry (`None` when missing or expired).
    pub fn expires_at(&self, key: &str) -> Option<Instant> {
        let now = Instant::now();
        let entries = self.entries.lock().unwrap();
        entries.get(key).filter(|e| e.is_live(now)).map(|e| e.expires_at)
    }
}

impl<V: Clone> Default for TtlCache<V> {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of a live lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockEntry {
    pub key: String,
    pub status: LockStatus,
    pub expires_at: Instant,
}

/// Mutual exclusion keyed by resource identity that records why a resource is held.
#[derive(Debug, Default)]
pub struct ResourceLocker {
    cache: TtlCache<LockStatus>,
}

impl ResourceLocker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Try to take the lock for `ttl`.
    ///
    /// Returns `LockStatus::Unlocked` when the lock was acquired, otherwise the
    /// status of the live holder, which is left unchanged. `Unlocked` itself
    /// cannot be held and is rejected.
    pub fn lock(&self, key: &str, status: LockStatus, ttl: Duration) -> Result<LockStatus> {
        if !status.is_locked() {
            return Err(FleetError::Config(format!("cannot lock {} with status {}", key, status)));
        }

        match self.cache.add(format!("{}{}", LOCK_PREFIX, key), status, ttl) {
            Ok(()) => {
                debug!(key = %key, status = %status, ttl_ms = ttl.as_millis() as u64, "lock acquired");
                Ok(LockStatus::Unlocked)
            }
            Err(held) => {
                debug!(key = %key, held = %held, wanted = %status, "lock contended");
                Ok(held)
            }
        }
    }

    /// Current status; `Unlocked` if unset or expired.
    pub fn locked(&self, key: &str) -> LockStatus {
        self.cache.get(&format!("{}{}", LOCK_PREFIX, key)).unwrap_or_default()
    }

    pub fn unlock(&self, key: &str) {
        self.cache.delete(&format!("{}{}", LOCK_PREFIX, key));
    }

    pub fn entry(&self, key: &str) -> Option<LockEntry> {
        let cache_key = format!("{}{}", LOCK_PREFIX, key);
        let status = self.cache.get(&cache_key)?;
        let expires_at = self.cache.expires_at(&cache_key)?;

        Some(LockEntry {
            key: key.to_string(),
            status,
            expires_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_add_get_delete() {
        let cache = TtlCache::new();
        cache.add("a", 1u32, Duration::from_secs(60)).unwrap();
        assert_eq!(cache.get("a"), Some(1));
        cache.delete("a");
        assert_eq!(cache.get("a"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cache_entry_expires_lazily() {
        let cache = TtlCache::new();
        cache.add("a", "x".to_string(), Duration::from_secs(2)).unwrap();
        assert_eq!(cache.get("a").as_deref(), Some("x"));

        tokio::time::advance(Duration::from_secs(3)).await;
        assert_eq!(cache.get("a"), None);
        assert!(cache.add("a", "y".to_string(), Duration::from_secs(2)).is_ok());
    }

    #[test]
    fn test_add_keeps_live_value() {
        let cache = TtlCache::new();
        assert!(cache.add("k", 1u32, Duration::from_secs(60)).is_ok());
        assert_eq!(cache.add("k", 2u32, Duration::from_secs(60)), Err(1));
        assert_eq!(cache.get("k"), Some(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_lock_contention_and_expiry() {
        let locker = ResourceLocker::new();
        let ttl = Duration::from_secs(5);

        assert_eq!(locker.lock("experiment|e1", LockStatus::Starting, ttl).unwrap(), LockStatus::Unlocked);
        assert_eq!(locker.lock("experiment|e1", LockStatus::Deleting, ttl).unwrap(), LockStatus::Starting);
        assert_eq!(locker.locked("experiment|e1"), LockStatus::Starting);

        tokio::time::advance(Duration::from_secs(6)).await;

        assert_eq!(locker.locked("experiment|e1"), LockStatus::Unlocked);
        assert_eq!(locker.lock("experiment|e1", LockStatus::Deleting, ttl).unwrap(), LockStatus::Unlocked);
        assert_eq!(locker.locked("experiment|e1"), LockStatus::Deleting);
    }

    #[test]
    fn test_unlock_releases() {
        let locker = ResourceLocker::new();
        locker.lock("vm|e1/host", LockStatus::Stopping, Duration::from_secs(60)).unwrap();
        locker.unlock("vm|e1/host");
        assert_eq!(locker.locked("vm|e1/host"), LockStatus::Unlocked);
        assert!(locker.entry("vm|e1/host").is_none());
    }

    #[test]
    fn test_entry_reports_status_and_expiry() {
        let locker = ResourceLocker::new();
        locker.lock("experiment|e2", LockStatus::Creating, Duration::from_secs(60)).unwrap();

        let entry = locker.entry("experiment|e2").unwrap();
        assert_eq!(entry.key, "experiment|e2");
        assert_eq!(entry.status, LockStatus::Creating);
        assert!(entry.expires_at > Instant::now());
    }

    #[test]
    fn test_lock_keys_do_not_collide_with_plain_cache_keys() {
        let locker = ResourceLocker::new();
        locker.lock("a", LockStatus::Updating, Duration::from_secs(60)).unwrap();
        assert_eq!(locker.locked("b"), LockStatus::Unlocked);
    }

    #[test]
    fn test_unlocked_status_cannot_be_held() {
        let locker = ResourceLocker::new();
        let ttl = Duration::from_secs(60);

        let err = locker.lock("experiment|e1", LockStatus::Unlocked, ttl).unwrap_err();
        assert!(err.is_config());
        assert!(locker.entry("experiment|e1").is_none());

        // The rejected call leaves the key free, so the next caller really holds it.
        assert_eq!(locker.lock("experiment|e1", LockStatus::Starting, ttl).unwrap(), LockStatus::Unlocked);
        assert_eq!(locker.lock("experiment|e1", LockStatus::Stopping, ttl).unwrap(), LockStatus::Starting);
    }
}
