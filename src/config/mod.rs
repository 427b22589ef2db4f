//! Configuration system for fleetrun.
//!
//! A single global config (~/.config/fleetrun/fleetrun.yml or .fleetrun.yml)
//! with `dispatch`, `loops` and `locks` sections. Run plans are separate
//! files handed to the CLI.

use eyre::Result;
use std::path::PathBuf;

pub use self::global::{DispatchSettings, GlobalConfig, LockSettings, LoopSettings};

mod global;

/// Load configuration from the standard search paths.
///
/// Search order:
/// 1. Explicit path if provided
/// 2. .fleetrun.yml in current directory (project config)
/// 3. ~/.config/fleetrun/fleetrun.yml (user config)
/// 4. Default values
pub fn load_config(explicit_path: Option<&PathBuf>) -> Result<GlobalConfig> {
    GlobalConfig::load(explicit_path)
}
