//! Error types for fleetrun
//!
//! Centralized error handling using thiserror.

use std::time::Duration;

use thiserror::Error;

/// All error types that can occur in fleetrun
#[derive(Debug, Error)]
pub enum FleetError {
    /// Malformed run plan, unknown component, unknown run ID
    #[error("Configuration error: {0}")]
    Config(String),

    /// The control plane never accepted the command before its timeout
    #[error("C2 client not active after {timeout:?}: {command}")]
    ControlPlaneInactive { command: String, timeout: Duration },

    /// Transport failure while submitting or awaiting a command
    #[error("Transport error: {0}")]
    Transport(String),

    /// Command-specific failure (timeout waiting for a response, rejected submission)
    #[error("Command failed: {0}")]
    CommandFailed(String),

    /// Response validator rejected the command output
    #[error("Unexpected response: {0}")]
    UnexpectedResponse(String),

    /// A component lifecycle hook failed
    #[error("Component error: {0}")]
    Component(String),

    /// Resource is held by another administrative transition
    #[error("{resource} is locked with status {status}")]
    Locked { resource: String, status: String },

    /// A run with the same experiment and run ID is already executing
    #[error("run {0} is already running")]
    RunInProgress(String),

    /// Run was cancelled before it completed
    #[error("Cancelled: {0}")]
    Cancelled(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML deserialization error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl FleetError {
    /// True for errors that abort a whole run before anything executes
    pub fn is_config(&self) -> bool {
        matches!(self, FleetError::Config(_))
    }
}

/// Result type alias for fleetrun operations
pub type Result<T> = std::result::Result<T, FleetError>;
