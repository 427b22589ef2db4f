//! C2 command dispatch.
//!
//! Commands are scheduled in parallel against a remote control plane. Each
//! scheduled command registers with an `ErrorGroup` before its task starts;
//! the task reports failures into the group rather than returning them.
//!
//! Two kinds of retry exist:
//! - **Reachability**: the control plane reports "not active"; resubmit after a
//!   fixed backoff until the command's timeout elapses.
//! - **Response**: the caller's validator asks for a retry after a delay; the
//!   whole command is queued again as a new job.

mod command;
mod dispatcher;
mod group;
mod scripted;
mod transport;

pub use command::{Command, DEFAULT_COMMAND_TIMEOUT, ResponseKind};
pub use dispatcher::{DEFAULT_REACHABILITY_BACKOFF, DispatchConfig, Dispatcher, ResponseError, ResponseValidator};
pub use group::{ErrorGroup, GroupError, TaskGuard};
pub use scripted::ScriptedControlPlane;
pub use transport::{ControlPlane, TransportError};
