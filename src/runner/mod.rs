//! Run execution.
//!
//! This module provides:
//! - `LoopEngine`, which walks a run's loop tree and invokes component hooks
//! - `ComponentExecutor` and `ExecutorRegistry` for routing by component type
//! - Built-in executors: C2 commands, pause, and a dry-run recorder

mod c2;
mod engine;
mod executor;
mod pause;

pub use c2::{C2_COMPONENT_TYPE, C2Executor, C2Metadata, C2Step};
pub use engine::{LoopEngine, LoopExecution};
pub use executor::{ComponentExecutor, DryRunExecutor, ExecutorRegistry, Invocation, invoke};
pub use pause::{PAUSE_COMPONENT_TYPE, PauseExecutor, PauseMetadata};
