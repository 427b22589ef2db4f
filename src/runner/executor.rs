//! Component executors and their registry.
//!
//! The loop engine never interprets a component's type. It routes each
//! invocation to the executor registered for that type, or to the fallback.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tracing::info;

use crate::domain::{ComponentSpec, Phase, RunContext};
use crate::error::{FleetError, Result};

/// Lifecycle hooks for one component type. Phases an executor does not
/// implement succeed without doing anything.
#[async_trait]
pub trait ComponentExecutor: Send + Sync {
    async fn configure(&self, _ctx: &RunContext, _component: &ComponentSpec) -> Result<()> {
        Ok(())
    }

    async fn start(&self, _ctx: &RunContext, _component: &ComponentSpec) -> Result<()> {
        Ok(())
    }

    async fn stop(&self, _ctx: &RunContext, _component: &ComponentSpec) -> Result<()> {
        Ok(())
    }

    async fn cleanup(&self, _ctx: &RunContext, _component: &ComponentSpec) -> Result<()> {
        Ok(())
    }
}

/// Call the hook matching `phase`.
pub async fn invoke(
    executor: &dyn ComponentExecutor,
    phase: Phase,
    ctx: &RunContext,
    component: &ComponentSpec,
) -> Result<()> {
    match phase {
        Phase::Configure => executor.configure(ctx, component).await,
        Phase::Start => executor.start(ctx, component).await,
        Phase::Stop => executor.stop(ctx, component).await,
        Phase::Cleanup => executor.cleanup(ctx, component).await,
    }
}

/// Executors keyed by component type.
#[derive(Default)]
pub struct ExecutorRegistry {
    executors: HashMap<String, Arc<dyn ComponentExecutor>>,
    fallback: Option<Arc<dyn ComponentExecutor>>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, component_type: impl Into<String>, executor: Arc<dyn ComponentExecutor>) {
        self.executors.insert(component_type.into(), executor);
    }

    pub fn with(mut self, component_type: impl Into<String>, executor: Arc<dyn ComponentExecutor>) -> Self {
        self.register(component_type, executor);
        self
    }

    /// Executor for types nobody registered.
    pub fn with_fallback(mut self, executor: Arc<dyn ComponentExecutor>) -> Self {
        self.fallback = Some(executor);
        self
    }

    pub fn get(&self, component_type: &str) -> Option<Arc<dyn ComponentExecutor>> {
        self.executors
            .get(component_type)
            .or(self.fallback.as_ref())
            .cloned()
    }

    /// Like `get`, but a missing executor is a configuration error naming the component.
    pub fn resolve(&self, component: &ComponentSpec) -> Result<Arc<dyn ComponentExecutor>> {
        self.get(&component.component_type).ok_or_else(|| {
            FleetError::Config(format!(
                "no executor registered for type {} (component {})",
                component.component_type, component.name
            ))
        })
    }

    pub fn types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.executors.keys().map(String::as_str).collect();
        types.sort();
        types
    }

    pub fn has_fallback(&self) -> bool {
        self.fallback.is_some()
    }
}

impl std::fmt::Debug for ExecutorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutorRegistry")
            .field("types", &self.types())
            .field("fallback", &self.has_fallback())
            .finish()
    }
}

/// One recorded hook call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub phase: Phase,
    pub component: String,
    pub loop_depth: usize,
    pub iteration: u32,
}

impl std::fmt::Display for Invocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "loop {} count {}: {} {}",
            self.loop_depth, self.iteration, self.phase, self.component
        )
    }
}

/// Executes nothing; logs and records every hook call in order.
#[derive(Debug, Default)]
pub struct DryRunExecutor {
    calls: Mutex<Vec<Invocation>>,
}

impl DryRunExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    fn record(&self, phase: Phase, ctx: &RunContext, component: &ComponentSpec) {
        info!(
            experiment = %ctx.experiment(),
            run = ctx.run_id(),
            loop_depth = ctx.loop_depth(),
            count = ctx.iteration(),
            stage = %phase,
            component = %component.name,
            "dry run"
        );
        self.calls.lock().unwrap().push(Invocation {
            phase,
            component: component.name.clone(),
            loop_depth: ctx.loop_depth(),
            iteration: ctx.iteration(),
        });
    }

    pub fn calls(&self) -> Vec<Invocation> {
        self.calls.lock().unwrap().clone()
    }

    /// Number of calls for a phase, optionally restricted to one component.
    pub fn count(&self, phase: Phase, component: Option<&str>) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.phase == phase && component.is_none_or(|name| c.component == name))
            .count()
    }
}

#[async_trait]
impl ComponentExecutor for DryRunExecutor {
    async fn configure(&self, ctx: &RunContext, component: &ComponentSpec) -> Result<()> {
        self.record(Phase::Configure, ctx, component);
        Ok(())
    }

    async fn start(&self, ctx: &RunContext, component: &ComponentSpec) -> Result<()> {
        self.record(Phase::Start, ctx, component);
        Ok(())
    }

    async fn stop(&self, ctx: &RunContext, component: &ComponentSpec) -> Result<()> {
        self.record(Phase::Stop, ctx, component);
        Ok(())
    }

    async fn cleanup(&self, ctx: &RunContext, component: &ComponentSpec) -> Result<()> {
        self.record(Phase::Cleanup, ctx, component);
        Ok(())
    }
}
