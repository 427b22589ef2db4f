//! Global configuration.
//!
//! Loaded from ~/.config/fleetrun/fleetrun.yml or .fleetrun.yml

use eyre::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::dispatch::DispatchConfig;
use crate::domain::DEFAULT_MAX_LOOP_DEPTH;
use crate::lock::LockTtls;

/// Global configuration for fleetrun.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct GlobalConfig {
    /// C2 command dispatch settings.
    pub dispatch: DispatchSettings,

    /// Run loop settings.
    pub loops: LoopSettings,

    /// Resource lock lifetimes.
    pub locks: LockSettings,
}

impl GlobalConfig {
    /// Load configuration with fallback chain.
    ///
    /// Search order:
    /// 1. Explicit path if provided
    /// 2. .fleetrun.yml in current directory
    /// 3. ~/.config/fleetrun/fleetrun.yml
    /// 4. Defaults
    pub fn load(config_path: Option<&PathBuf>) -> Result<Self> {
        // Explicit path takes precedence
        if let Some(path) = config_path {
            return Self::load_from_file(path).context(format!("Failed to load config from {}", path.display()));
        }

        // Try project config
        let project_config = PathBuf::from(".fleetrun.yml");
        if project_config.exists() {
            match Self::load_from_file(&project_config) {
                Ok(config) => {
                    log::info!("Loaded config from .fleetrun.yml");
                    return Ok(config);
                }
                Err(e) => {
                    log::warn!("Failed to load .fleetrun.yml: {}", e);
                }
            }
        }

        // Try user config
        if let Some(config_dir) = dirs::config_dir() {
            let user_config = config_dir.join("fleetrun").join("fleetrun.yml");
            if user_config.exists() {
                match Self::load_from_file(&user_config) {
                    Ok(config) => {
                        log::info!("Loaded config from {}", user_config.display());
                        return Ok(config);
                    }
                    Err(e) => {
                        log::warn!("Failed to load {}: {}", user_config.display(), e);
                    }
                }
            }
        }

        log::info!("No config file found, using defaults");
        Ok(Self::default())
    }

    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path).context("Failed to read config file")?;
        let config: Self = serde_yaml::from_str(&content).context("Failed to parse config file")?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.dispatch.default_timeout_secs == 0 {
            eyre::bail!("dispatch.default-timeout-secs must be > 0");
        }
        if self.dispatch.reachability_backoff_secs == 0 {
            eyre::bail!("dispatch.reachability-backoff-secs must be > 0");
        }
        if self.dispatch.reachability_backoff_secs > self.dispatch.default_timeout_secs {
            eyre::bail!("dispatch.reachability-backoff-secs must not exceed dispatch.default-timeout-secs");
        }
        if self.loops.max_depth == 0 {
            eyre::bail!("loops.max-depth must be > 0");
        }
        self.locks.validate()
    }
}

/// C2 command dispatch settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DispatchSettings {
    /// Acceptance and response timeout for commands that set none.
    #[serde(rename = "default-timeout-secs")]
    pub default_timeout_secs: u64,

    /// Wait between submissions while the C2 client is not active.
    #[serde(rename = "reachability-backoff-secs")]
    pub reachability_backoff_secs: u64,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            default_timeout_secs: 300,
            reachability_backoff_secs: 5,
        }
    }
}

impl DispatchSettings {
    pub fn default_timeout(&self) -> Duration {
        Duration::from_secs(self.default_timeout_secs)
    }

    pub fn dispatch_config(&self) -> DispatchConfig {
        DispatchConfig {
            reachability_backoff: Duration::from_secs(self.reachability_backoff_secs),
        }
    }
}

/// Run loop settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LoopSettings {
    /// Deepest loop nesting accepted when decoding a run plan.
    #[serde(rename = "max-depth")]
    pub max_depth: usize,
}

impl Default for LoopSettings {
    fn default() -> Self {
        Self {
            max_depth: DEFAULT_MAX_LOOP_DEPTH,
        }
    }
}

/// Lock TTLs in seconds.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct LockSettings {
    pub experiment_creation_secs: u64,
    pub experiment_update_secs: u64,
    pub experiment_deletion_secs: u64,
    pub experiment_starting_secs: u64,
    pub experiment_stopping_secs: u64,
    pub vm_starting_secs: u64,
    pub vm_stopping_secs: u64,
    pub vm_redeploying_secs: u64,
    pub vm_snapshotting_secs: u64,
    pub vm_restoring_secs: u64,
    pub vm_committing_secs: u64,
}

impl Default for LockSettings {
    fn default() -> Self {
        Self {
            experiment_creation_secs: 300,
            experiment_update_secs: 300,
            experiment_deletion_secs: 60,
            experiment_starting_secs: 300,
            experiment_stopping_secs: 60,
            vm_starting_secs: 60,
            vm_stopping_secs: 60,
            vm_redeploying_secs: 300,
            vm_snapshotting_secs: 300,
            vm_restoring_secs: 300,
            vm_committing_secs: 300,
        }
    }
}

impl LockSettings {
    fn all(&self) -> [(&'static str, u64); 11] {
        [
            ("experiment-creation-secs", self.experiment_creation_secs),
            ("experiment-update-secs", self.experiment_update_secs),
            ("experiment-deletion-secs", self.experiment_deletion_secs),
            ("experiment-starting-secs", self.experiment_starting_secs),
            ("experiment-stopping-secs", self.experiment_stopping_secs),
            ("vm-starting-secs", self.vm_starting_secs),
            ("vm-stopping-secs", self.vm_stopping_secs),
            ("vm-redeploying-secs", self.vm_redeploying_secs),
            ("vm-snapshotting-secs", self.vm_snapshotting_secs),
            ("vm-restoring-secs", self.vm_restoring_secs),
            ("vm-committing-secs", self.vm_committing_secs),
        ]
    }

    fn validate(&self) -> Result<()> {
        for (key, secs) in self.all() {
            if secs == 0 {
                eyre::bail!("locks.{} must be > 0", key);
            }
        }
        Ok(())
    }

    pub fn ttls(&self) -> LockTtls {
        LockTtls {
            experiment_creation: Duration::from_secs(self.experiment_creation_secs),
            experiment_update: Duration::from_secs(self.experiment_update_secs),
            experiment_deletion: Duration::from_secs(self.experiment_deletion_secs),
            experiment_starting: Duration::from_secs(self.experiment_starting_secs),
            experiment_stopping: Duration::from_secs(self.experiment_stopping_secs),
            vm_starting: Duration::from_secs(self.vm_starting_secs),
            vm_stopping: Duration::from_secs(self.vm_stopping_secs),
            vm_redeploying: Duration::from_secs(self.vm_redeploying_secs),
            vm_snapshotting: Duration::from_secs(self.vm_snapshotting_secs),
            vm_restoring: Duration::from_secs(self.vm_restoring_secs),
            vm_committing: Duration::from_secs(self.vm_committing_secs),
        }
    }
}
