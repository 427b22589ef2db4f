//! fleetrun - run orchestration and C2 command dispatch for experiments
//!
//! A run executes a nested loop of component lifecycle phases
//! (configure, start, stop, cleanup). Components send commands to VM agents
//! through a control plane; the dispatcher runs those commands in parallel and
//! collects every failure instead of stopping at the first one. In-flight runs
//! can be cancelled per run or per experiment, and administrative transitions
//! are serialized with TTL-scoped, status-carrying locks.

pub mod config;
pub mod coordination;
pub mod dispatch;
pub mod domain;
pub mod error;
pub mod lock;
pub mod manager;
pub mod runner;

pub use error::{FleetError, Result};
