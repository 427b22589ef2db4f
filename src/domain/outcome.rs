//! Run execution outcome types.

use chrono::{DateTime, Utc};

use super::context::RunHandle;
use crate::dispatch::GroupError;

/// How a loop node finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopOutcome {
    /// Every iteration executed (individual invocations may still have failed)
    Completed,
    /// The run was cancelled; no new configure/start invocations were issued after it fired
    Cancelled,
}

/// Final result of one run.
#[derive(Debug)]
pub struct RunReport {
    pub handle: RunHandle,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// Component phase invocations issued
    pub invocations: u64,
    /// Every recorded failure, in completion order
    pub errors: Vec<GroupError>,
    pub cancelled: bool,
}

impl RunReport {
    /// A run succeeds only if it ran to completion with no recorded error.
    pub fn succeeded(&self) -> bool {
        !self.cancelled && self.errors.is_empty()
    }

    /// Multi-error summary listing every failure with its metadata.
    pub fn summary(&self) -> String {
        let mut lines = Vec::new();

        let state = if self.cancelled {
            "cancelled"
        } else if self.errors.is_empty() {
            "succeeded"
        } else {
            "failed"
        };

        lines.push(format!(
            "run {} {} after {} invocations ({} errors)",
            self.handle,
            state,
            self.invocations,
            self.errors.len()
        ));

        for error in &self.errors {
            lines.push(format!("  - {}", error));
        }

        lines.join("\n")
    }

    pub fn elapsed(&self) -> chrono::Duration {
        self.finished_at - self.started_at
    }
}
