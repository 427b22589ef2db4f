//! Domain types for fleetrun
//!
//! This module contains the core domain types:
//! - LoopSpec: recursive loop node with the four lifecycle phase lists
//! - ComponentSpec: named, typed unit of work
//! - RunPlan: decoded runs + components for one experiment
//! - RunContext: run identity, loop position and cancellation
//! - RunReport: final result of a run

pub mod component;
pub mod context;
pub mod loop_spec;
pub mod outcome;
pub mod plan;

pub use component::{ComponentMetadata, ComponentSpec};
pub use context::{RunContext, RunHandle};
pub use loop_spec::{LoopSpec, Phase};
pub use outcome::{LoopOutcome, RunReport};
pub use plan::{DEFAULT_MAX_LOOP_DEPTH, RunPlan};
