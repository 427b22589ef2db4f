//! Run-scoped execution context.
//!
//! Carries the run identity, the loop position and the run's cancellation
//! token to components and dispatched commands.

use std::collections::BTreeMap;

use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

/// Identity of one execution of a run for one experiment.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RunHandle {
    pub experiment: String,
    pub run_id: usize,
}

impl RunHandle {
    pub fn new(experiment: impl Into<String>, run_id: usize) -> Self {
        Self {
            experiment: experiment.into(),
            run_id,
        }
    }

    /// Registry key, `<experiment>/<run>`.
    pub fn key(&self) -> String {
        format!("{}/{}", self.experiment, self.run_id)
    }
}

impl std::fmt::Display for RunHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.experiment, self.run_id)
    }
}

#[derive(Debug, Clone)]
pub struct RunContext {
    handle: RunHandle,
    cancel: CancellationToken,
    loop_depth: usize,
    iteration: u32,
}

impl RunContext {
    pub fn new(handle: RunHandle, cancel: CancellationToken) -> Self {
        Self {
            handle,
            cancel,
            loop_depth: 0,
            iteration: 0,
        }
    }

    pub fn handle(&self) -> &RunHandle {
        &self.handle
    }

    pub fn experiment(&self) -> &str {
        &self.handle.experiment
    }

    pub fn run_id(&self) -> usize {
        self.handle.run_id
    }

    pub fn loop_depth(&self) -> usize {
        self.loop_depth
    }

    pub fn iteration(&self) -> u32 {
        self.iteration
    }

    pub fn token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.cancel.cancelled()
    }

    /// Same run, positioned at a loop depth and iteration.
    pub fn at(&self, loop_depth: usize, iteration: u32) -> Self {
        Self {
            loop_depth,
            iteration,
            ..self.clone()
        }
    }

    /// Same run with a token that the run's cancellation does not reach.
    /// Used for teardown that must complete after the run was cancelled.
    pub fn detached(&self) -> Self {
        Self {
            cancel: CancellationToken::new(),
            ..self.clone()
        }
    }

    /// Same run with a child token that can be cancelled on its own.
    pub fn child(&self) -> Self {
        Self {
            cancel: self.cancel.child_token(),
            ..self.clone()
        }
    }

    /// Diagnostic metadata identifying this position in the run.
    pub fn meta(&self) -> BTreeMap<String, String> {
        let mut meta = BTreeMap::new();
        meta.insert("experiment".to_string(), self.handle.experiment.clone());
        meta.insert("run".to_string(), self.handle.run_id.to_string());
        meta.insert("loop".to_string(), self.loop_depth.to_string());
        meta.insert("count".to_string(), self.iteration.to_string());
        meta
    }
}
