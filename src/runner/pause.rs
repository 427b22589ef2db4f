//! Pause component: waits a fixed time in each phase.
//!
//! Useful for letting a workload run between start and stop, and, through
//! `fail-stages`, for exercising a run's failure reporting.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::info;

use super::executor::ComponentExecutor;
use crate::domain::{ComponentSpec, Phase, RunContext};
use crate::error::{FleetError, Result};

pub const PAUSE_COMPONENT_TYPE: &str = "pause";

#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct PauseMetadata {
    pub duration_secs: u64,
    /// Phases that fail after pausing.
    pub fail_stages: Vec<Phase>,
}

impl Default for PauseMetadata {
    fn default() -> Self {
        Self {
            duration_secs: 10,
            fail_stages: Vec::new(),
        }
    }
}

#[derive(Debug, Default)]
pub struct PauseExecutor;

impl PauseExecutor {
    async fn pause(&self, ctx: &RunContext, component: &ComponentSpec, phase: Phase) -> Result<()> {
        if ctx.is_cancelled() {
            return Err(FleetError::Cancelled(format!("{} {}", component.name, phase)));
        }

        let metadata: PauseMetadata = component.decode_metadata()?;
        let duration = Duration::from_secs(metadata.duration_secs);

        info!(component = %component.name, stage = %phase, secs = metadata.duration_secs, "pausing");

        tokio::select! {
            _ = ctx.cancelled() => {
                return Err(FleetError::Cancelled(format!("{} {} interrupted", component.name, phase)));
            }
            _ = tokio::time::sleep(duration) => {}
        }

        if metadata.fail_stages.contains(&phase) {
            return Err(FleetError::Component(format!(
                "{} failing {} as instructed",
                component.name, phase
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl ComponentExecutor for PauseExecutor {
    async fn configure(&self, ctx: &RunContext, component: &ComponentSpec) -> Result<()> {
        self.pause(ctx, component, Phase::Configure).await
    }

    async fn start(&self, ctx: &RunContext, component: &ComponentSpec) -> Result<()> {
        self.pause(ctx, component, Phase::Start).await
    }

    async fn stop(&self, ctx: &RunContext, component: &ComponentSpec) -> Result<()> {
        self.pause(ctx, component, Phase::Stop).await
    }

    async fn cleanup(&self, ctx: &RunContext, component: &ComponentSpec) -> Result<()> {
        self.pause(ctx, component, Phase::Cleanup).await
    }
}
