//! C2 command description.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default time a command may wait for acceptance and for its response.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Which output stream of a command response to return.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseKind {
    #[default]
    Both,
    Stdout,
    Stderr,
}

/// A command for a remote agent. Immutable once scheduled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    pub namespace: String,
    pub vm: Option<String>,
    pub command: String,
    pub timeout: Duration,
    pub response_kind: ResponseKind,
    pub skip_active_check: bool,
}

impl Command {
    pub fn new(namespace: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            vm: None,
            command: command.into(),
            timeout: DEFAULT_COMMAND_TIMEOUT,
            response_kind: ResponseKind::Both,
            skip_active_check: false,
        }
    }

    pub fn on_vm(mut self, vm: impl Into<String>) -> Self {
        self.vm = Some(vm.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_response_kind(mut self, kind: ResponseKind) -> Self {
        self.response_kind = kind;
        self
    }

    pub fn skip_active_check(mut self, skip: bool) -> Self {
        self.skip_active_check = skip;
        self
    }

    /// Human-readable description used when wrapping failures.
    pub fn describe(&self) -> String {
        match &self.vm {
            Some(vm) => format!("'{}' in vm {}/{}", self.command, self.namespace, vm),
            None => format!("'{}' in namespace {}", self.command, self.namespace),
        }
    }

    /// Dispatch context merged into every reported error.
    pub fn meta(&self) -> BTreeMap<String, String> {
        let mut meta = BTreeMap::new();
        meta.insert("namespace".to_string(), self.namespace.clone());
        meta.insert("command".to_string(), self.command.clone());
        if let Some(vm) = &self.vm {
            meta.insert("vm".to_string(), vm.clone());
        }
        meta
    }
}
