//! Loop engine - executes one run of a run plan.
//!
//! A loop node runs `count` iterations. Each iteration invokes every
//! `configure` entry, then every `start` entry, descends into the child loop,
//! then invokes every `stop` and `cleanup` entry. Entries run sequentially in
//! listed order; a background component's start is spawned instead of awaited.
//!
//! Failed invocations are recorded in the run's `ErrorGroup` and never stop the
//! run. Cancellation is checked before every configure/start invocation and
//! before entering the child loop. An iteration cut short by cancellation still
//! stops and cleans up the components it already configured or started.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use futures::FutureExt;
use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::executor::{ComponentExecutor, ExecutorRegistry, invoke};
use crate::dispatch::ErrorGroup;
use crate::domain::{ComponentSpec, LoopOutcome, LoopSpec, Phase, RunContext, RunPlan};
use crate::error::{FleetError, Result};

/// What one engine run did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoopExecution {
    pub outcome: LoopOutcome,
    /// Hook invocations issued, background starts included
    pub invocations: u64,
}

/// Executes run loops against the registered component executors.
#[derive(Debug, Clone)]
pub struct LoopEngine {
    executors: Arc<ExecutorRegistry>,
}

impl LoopEngine {
    pub fn new(executors: Arc<ExecutorRegistry>) -> Self {
        Self { executors }
    }

    pub fn executors(&self) -> &ExecutorRegistry {
        &self.executors
    }

    /// Execute run `ctx.run_id()` of `plan`, recording failures in `group`.
    ///
    /// Returns `Err` only for configuration errors, which are detected before
    /// any hook is invoked. Background starts may still be pending when this
    /// returns; wait on `group` to observe them.
    pub async fn execute(&self, ctx: &RunContext, plan: &RunPlan, group: &ErrorGroup) -> Result<LoopExecution> {
        let root = plan.run(ctx.run_id())?;
        let components = self.resolve(plan, ctx.run_id())?;

        info!(
            experiment = %ctx.experiment(),
            run = ctx.run_id(),
            components = components.len(),
            depth = root.depth(),
            "executing run"
        );

        let run = Run {
            components,
            group,
            invocations: AtomicU64::new(0),
            background: Mutex::new(HashMap::new()),
        };

        let outcome = run.run_loop(ctx, root, 0).await;
        let invocations = run.invocations.load(Ordering::SeqCst);

        info!(
            experiment = %ctx.experiment(),
            run = ctx.run_id(),
            outcome = ?outcome,
            invocations,
            errors = group.error_count(),
            "run loop finished"
        );

        Ok(LoopExecution { outcome, invocations })
    }

    fn resolve(&self, plan: &RunPlan, run_id: usize) -> Result<HashMap<String, Resolved>> {
        let mut resolved = HashMap::new();

        for component in plan.resolve(run_id)? {
            let executor = self.executors.resolve(component)?;
            resolved.insert(
                component.name.clone(),
                Resolved {
                    spec: component.clone(),
                    executor,
                },
            );
        }

        Ok(resolved)
    }
}

struct Resolved {
    spec: ComponentSpec,
    executor: Arc<dyn ComponentExecutor>,
}

/// State of one engine run.
struct Run<'g> {
    components: HashMap<String, Resolved>,
    group: &'g ErrorGroup,
    invocations: AtomicU64,
    /// Tokens of background starts still owned by the run, by component name
    background: Mutex<HashMap<String, CancellationToken>>,
}

impl<'g> Run<'g> {
    fn run_loop<'a>(&'a self, ctx: &'a RunContext, spec: &'a LoopSpec, depth: usize) -> BoxFuture<'a, LoopOutcome> {
        async move {
            for iteration in 1..=spec.count {
                if ctx.is_cancelled() {
                    debug!(loop_depth = depth, count = iteration, "run cancelled before iteration");
                    return LoopOutcome::Cancelled;
                }

                let iter_ctx = ctx.at(depth, iteration);
                if self.run_iteration(&iter_ctx, spec, depth).await == LoopOutcome::Cancelled {
                    return LoopOutcome::Cancelled;
                }
            }
            LoopOutcome::Completed
        }
        .boxed()
    }

    async fn run_iteration(&self, ctx: &RunContext, spec: &LoopSpec, depth: usize) -> LoopOutcome {
        let mut touched: Vec<&str> = Vec::new();
        let mut cut_short = false;

        'setup: for phase in [Phase::Configure, Phase::Start] {
            for name in spec.phase(phase) {
                if ctx.is_cancelled() {
                    cut_short = true;
                    break 'setup;
                }
                if phase == Phase::Start && self.is_background(name) {
                    self.spawn_background(ctx, name);
                } else {
                    self.invoke(ctx, phase, name).await;
                }
                if !touched.contains(&name.as_str()) {
                    touched.push(name);
                }
            }
        }

        if !cut_short {
            if let Some(child) = &spec.child {
                if ctx.is_cancelled() {
                    cut_short = true;
                } else if self.run_loop(ctx, child, depth + 1).await == LoopOutcome::Cancelled {
                    cut_short = true;
                }
            }
        }

        // Cancelled during the last setup invocation: full teardown, but still a cancelled run.
        let cancelled = cut_short || ctx.is_cancelled();

        // Teardown must not be short-circuited by the run's own cancellation.
        let teardown_ctx = if ctx.is_cancelled() { ctx.detached() } else { ctx.clone() };

        for phase in [Phase::Stop, Phase::Cleanup] {
            for name in spec.phase(phase) {
                if cut_short && !touched.contains(&name.as_str()) {
                    debug!(component = %name, stage = %phase, "skipping teardown of untouched component");
                    continue;
                }
                if phase == Phase::Stop {
                    self.cancel_background(name);
                }
                self.invoke(&teardown_ctx, phase, name).await;
            }
        }

        if cancelled {
            info!(
                experiment = %ctx.experiment(),
                run = ctx.run_id(),
                loop_depth = depth,
                count = ctx.iteration(),
                "run cancelled, iteration torn down"
            );
            LoopOutcome::Cancelled
        } else {
            LoopOutcome::Completed
        }
    }

    fn is_background(&self, name: &str) -> bool {
        self.components.get(name).is_some_and(|c| c.spec.background)
    }

    async fn invoke(&self, ctx: &RunContext, phase: Phase, name: &str) {
        // Names were resolved before the first invocation.
        let Some(component) = self.components.get(name) else {
            return;
        };

        self.invocations.fetch_add(1, Ordering::SeqCst);
        info!(
            experiment = %ctx.experiment(),
            run = ctx.run_id(),
            loop_depth = ctx.loop_depth(),
            count = ctx.iteration(),
            stage = %phase,
            component = %name,
            "invoking component"
        );

        if let Err(error) = invoke(component.executor.as_ref(), phase, ctx, &component.spec).await {
            record(self.group, ctx, phase, &component.spec, error);
        }
    }

    /// Spawn a background start registered with the run's barrier.
    fn spawn_background(&self, ctx: &RunContext, name: &str) {
        let Some(component) = self.components.get(name) else {
            return;
        };

        let bg_ctx = ctx.child();
        let token = bg_ctx.token().clone();
        if let Some(previous) = self.background.lock().unwrap().insert(name.to_string(), token) {
            previous.cancel();
        }

        self.invocations.fetch_add(1, Ordering::SeqCst);
        info!(
            experiment = %ctx.experiment(),
            run = ctx.run_id(),
            loop_depth = ctx.loop_depth(),
            count = ctx.iteration(),
            stage = %Phase::Start,
            component = %name,
            "starting component in background"
        );

        let guard = self.group.register();
        let executor = component.executor.clone();
        let spec = component.spec.clone();

        tokio::spawn(async move {
            let result = tokio::select! {
                _ = bg_ctx.cancelled() => {
                    debug!(component = %spec.name, "background start cancelled");
                    return;
                }
                result = executor.start(&bg_ctx, &spec) => result,
            };

            if let Err(error) = result {
                record(guard.group(), &bg_ctx, Phase::Start, &spec, error);
            }
        });
    }

    fn cancel_background(&self, name: &str) {
        if let Some(token) = self.background.lock().unwrap().remove(name) {
            debug!(component = %name, "cancelling background start before stop");
            token.cancel();
        }
    }
}

fn record(group: &ErrorGroup, ctx: &RunContext, phase: Phase, component: &ComponentSpec, error: FleetError) {
    warn!(
        experiment = %ctx.experiment(),
        run = ctx.run_id(),
        loop_depth = ctx.loop_depth(),
        count = ctx.iteration(),
        stage = %phase,
        component = %component.name,
        error = %error,
        "component invocation failed"
    );

    let mut meta = ctx.meta();
    meta.insert("stage".to_string(), phase.to_string());
    meta.insert("component".to_string(), component.name.clone());
    meta.insert("type".to_string(), component.component_type.clone());
    group.add_error(error, meta);
}
