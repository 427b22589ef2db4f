//! Run Manager module
//!
//! Admits runs, owns their cancelers while they execute, and cancels them
//! per run or per experiment.

mod run_manager;

pub use run_manager::RunManager;
