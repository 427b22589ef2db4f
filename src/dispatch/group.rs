//! Error aggregation for concurrently executing work.
//!
//! An `ErrorGroup` is a wait barrier plus an ordered, mutex-protected list of
//! tagged errors. Concurrent tasks report into it instead of returning a value;
//! the owner waits on the barrier and inspects the collected errors once.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use tokio::sync::watch;

use crate::error::FleetError;

/// An error plus the dispatch context needed to diagnose it.
#[derive(Debug)]
pub struct GroupError {
    pub error: FleetError,
    pub meta: BTreeMap<String, String>,
}

impl GroupError {
    pub fn new(error: FleetError, meta: BTreeMap<String, String>) -> Self {
        Self { error, meta }
    }
}

impl std::fmt::Display for GroupError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.error)?;
        if !self.meta.is_empty() {
            let tags: Vec<String> = self.meta.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
            write!(f, " [{}]", tags.join(" "))?;
        }
        Ok(())
    }
}

struct Inner {
    errors: Mutex<Vec<GroupError>>,
    pending: watch::Sender<usize>,
}

/// Shared barrier and error collection. Cheap to clone.
#[derive(Clone)]
pub struct ErrorGroup {
    inner: Arc<Inner>,
}

impl ErrorGroup {
    pub fn new() -> Self {
        let (pending, _) = watch::channel(0);
        Self {
            inner: Arc::new(Inner {
                errors: Mutex::new(Vec::new()),
                pending,
            }),
        }
    }

    /// Register one unit of work with the barrier.
    ///
    /// Must be called by the scheduler before the task is spawned; the task
    /// drops the returned guard when it finishes.
    pub fn register(&self) -> TaskGuard {
        self.inner.pending.send_modify(|n| *n += 1);
        TaskGuard { group: self.clone() }
    }

    fn done(&self) {
        self.inner.pending.send_modify(|n| *n = n.saturating_sub(1));
    }

    /// Number of registered tasks that have not finished.
    pub fn pending(&self) -> usize {
        *self.inner.pending.borrow()
    }

    /// Wait until every registered task has finished.
    pub async fn wait(&self) {
        let mut rx = self.inner.pending.subscribe();
        // The sender lives in `self`, so the channel cannot close while waiting.
        let _ = rx.wait_for(|n| *n == 0).await;
    }

    pub fn add_error(&self, error: FleetError, meta: BTreeMap<String, String>) {
        self.push(GroupError::new(error, meta));
    }

    pub fn push(&self, error: GroupError) {
        let mut errors = self.inner.errors.lock().expect("error group poisoned");
        errors.push(error);
    }

    pub fn error_count(&self) -> usize {
        self.inner.errors.lock().expect("error group poisoned").len()
    }

    pub fn has_errors(&self) -> bool {
        self.error_count() > 0
    }

    /// Remove and return the collected errors in completion order.
    pub fn take_errors(&self) -> Vec<GroupError> {
        let mut errors = self.inner.errors.lock().expect("error group poisoned");
        std::mem::take(&mut *errors)
    }

    /// Render every collected error, one per line.
    pub fn summary(&self) -> String {
        let errors = self.inner.errors.lock().expect("error group poisoned");
        errors.iter().map(|e| e.to_string()).collect::<Vec<_>>().join("\n")
    }
}

impl Default for ErrorGroup {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ErrorGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ErrorGroup")
            .field("pending", &self.pending())
            .field("errors", &self.error_count())
            .finish()
    }
}

/// Barrier registration; marks the task done when dropped.
#[derive(Debug)]
pub struct TaskGuard {
    group: ErrorGroup,
}

impl TaskGuard {
    pub fn group(&self) -> &ErrorGroup {
        &self.group
    }
}

impl Drop for TaskGuard {
    fn drop(&mut self) {
        self.group.done();
    }
}
