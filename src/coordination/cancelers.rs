//! Canceler registry for in-flight runs
//!
//! Maps `(experiment, run)` to the cancellation token of that run so runs can
//! be cancelled individually or all at once for an experiment (for example
//! when the experiment is deleted).

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio_util::sync::CancellationToken;

use crate::domain::RunHandle;

#[derive(Debug)]
struct Canceler {
    id: u64,
    token: CancellationToken,
}

/// A token stored in the registry, tagged with the registration it came from.
///
/// A run that was cancelled can still be tearing down when the same key is
/// registered again; the id lets it release only its own entry.
#[derive(Debug, Clone)]
pub struct Registration {
    pub id: u64,
    pub token: CancellationToken,
}

/// Registry of run cancellation tokens, shared by `Arc`.
#[derive(Debug, Default)]
pub struct CancelerRegistry {
    cancelers: Mutex<HashMap<String, Canceler>>,
    next_id: AtomicU64,
}

impl CancelerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn issue(&self, parent: &CancellationToken) -> Registration {
        Registration {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            token: parent.child_token(),
        }
    }

    /// Derive a token from `parent` and store it for the run, replacing any previous one.
    pub fn register(&self, parent: &CancellationToken, handle: &RunHandle) -> Registration {
        let registration = self.issue(parent);
        let mut cancelers = self.cancelers.lock().unwrap();
        cancelers.insert(
            handle.key(),
            Canceler {
                id: registration.id,
                token: registration.token.clone(),
            },
        );
        registration
    }

    /// Like `register`, but leaves an existing entry alone and returns `None`.
    pub fn try_register(&self, parent: &CancellationToken, handle: &RunHandle) -> Option<Registration> {
        let mut cancelers = self.cancelers.lock().unwrap();
        if cancelers.contains_key(&handle.key()) {
            return None;
        }
        let registration = self.issue(parent);
        cancelers.insert(
            handle.key(),
            Canceler {
                id: registration.id,
                token: registration.token.clone(),
            },
        );
        Some(registration)
    }

    pub fn exists(&self, handle: &RunHandle) -> bool {
        self.cancelers.lock().unwrap().contains_key(&handle.key())
    }

    /// Remove and return the run's token; a second call returns `None`.
    pub fn take_for_run(&self, handle: &RunHandle) -> Option<CancellationToken> {
        self.cancelers.lock().unwrap().remove(&handle.key()).map(|c| c.token)
    }

    /// Remove the run's entry only if it still belongs to registration `id`.
    pub fn release(&self, handle: &RunHandle, id: u64) -> bool {
        let mut cancelers = self.cancelers.lock().unwrap();
        match cancelers.get(&handle.key()) {
            Some(canceler) if canceler.id == id => {
                cancelers.remove(&handle.key());
                true
            }
            _ => false,
        }
    }

    /// Remove and return every token whose key starts with `<experiment>/`.
    pub fn take_all_for_experiment(&self, experiment: &str) -> Vec<CancellationToken> {
        let prefix = format!("{}/", experiment);
        let mut cancelers = self.cancelers.lock().unwrap();

        let keys: Vec<String> = cancelers.keys().filter(|k| k.starts_with(&prefix)).cloned().collect();

        keys.iter().filter_map(|k| cancelers.remove(k)).map(|c| c.token).collect()
    }

    pub fn len(&self) -> usize {
        self.cancelers.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
