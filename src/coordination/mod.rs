//! Run coordination module
//!
//! Tracks the cancellation tokens of in-flight runs so they can be cancelled
//! per run or per experiment.

pub mod cancelers;

pub use cancelers::{CancelerRegistry, Registration};
