//! Control-plane transport interface.

use async_trait::async_trait;
use thiserror::Error;

use super::command::Command;
use crate::domain::RunContext;

/// Errors a control plane can report.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// The agent's C2 client is not currently reachable; retry later
    #[error("C2 client not active for VM")]
    NotActive,

    /// Any other failure; never retried
    #[error("{0}")]
    Failed(String),
}

/// Opaque request/response channel to the remote control plane.
#[async_trait]
pub trait ControlPlane: Send + Sync {
    /// Submit a command; a non-empty ID means the control plane accepted it.
    ///
    /// With `command.skip_active_check` set the command is queued for the
    /// agent without requiring its C2 client to be active, so `NotActive`
    /// must not be returned for it.
    async fn submit(&self, command: &Command) -> Result<String, TransportError>;

    /// Wait for the response of an accepted command, honouring `command.response_kind`.
    async fn await_response(
        &self,
        ctx: &RunContext,
        command_id: &str,
        command: &Command,
    ) -> Result<String, TransportError>;
}
