//! Run Manager implementation
//!
//! RunManager admits runs, owns their cancelers for the lifetime of the run,
//! and cancels runs individually or per experiment.

use std::sync::{Arc, Mutex};

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::coordination::{CancelerRegistry, Registration};
use crate::dispatch::ErrorGroup;
use crate::domain::{LoopOutcome, RunContext, RunHandle, RunPlan, RunReport};
use crate::error::{FleetError, Result};
use crate::lock::ResourceLocks;
use crate::runner::LoopEngine;

/// Executes runs and tracks the in-flight ones.
pub struct RunManager {
    engine: LoopEngine,
    cancelers: Arc<CancelerRegistry>,
    locks: Arc<ResourceLocks>,
    // Held across the lock check and registration of a run, and across the
    // deletion lock and cancel sweep, so neither can interleave the other.
    admission: Mutex<()>,
}

impl RunManager {
    pub fn new(engine: LoopEngine, cancelers: Arc<CancelerRegistry>, locks: Arc<ResourceLocks>) -> Self {
        Self {
            engine,
            cancelers,
            locks,
            admission: Mutex::new(()),
        }
    }

    pub fn locks(&self) -> &ResourceLocks {
        &self.locks
    }

    pub fn cancelers(&self) -> &CancelerRegistry {
        &self.cancelers
    }

    /// Execute one run of `plan` for `experiment` and wait for everything it started.
    ///
    /// Rejected without invoking anything when the run ID is unknown, the
    /// experiment is locked, or the same run is already executing. Component
    /// failures do not fail the call; they are listed in the report.
    pub async fn execute(
        &self,
        parent: &CancellationToken,
        plan: &RunPlan,
        experiment: &str,
        run_id: usize,
    ) -> Result<RunReport> {
        plan.run(run_id)?;

        let handle = RunHandle::new(experiment, run_id);
        let registration = self.admit(parent, &handle)?;

        info!(experiment = %experiment, run = run_id, "run started");
        let started_at = Utc::now();

        let ctx = RunContext::new(handle.clone(), registration.token);
        let group = ErrorGroup::new();

        let execution = match self.engine.execute(&ctx, plan, &group).await {
            Ok(execution) => execution,
            Err(e) => {
                self.cancelers.release(&handle, registration.id);
                return Err(e);
            }
        };

        group.wait().await;
        self.cancelers.release(&handle, registration.id);

        let report = RunReport {
            handle,
            started_at,
            finished_at: Utc::now(),
            invocations: execution.invocations,
            errors: group.take_errors(),
            cancelled: execution.outcome == LoopOutcome::Cancelled,
        };

        if report.succeeded() {
            info!(
                experiment = %experiment,
                run = run_id,
                invocations = report.invocations,
                elapsed_ms = report.elapsed().num_milliseconds(),
                "run succeeded"
            );
        } else {
            warn!(
                experiment = %experiment,
                run = run_id,
                errors = report.errors.len(),
                cancelled = report.cancelled,
                "run did not succeed"
            );
        }

        Ok(report)
    }

    fn admit(&self, parent: &CancellationToken, handle: &RunHandle) -> Result<Registration> {
        let _admission = self.admission.lock().unwrap();

        let status = self.locks.is_experiment_locked(&handle.experiment);
        if status.is_locked() {
            return Err(FleetError::Locked {
                resource: format!("experiment {}", handle.experiment),
                status: status.to_string(),
            });
        }

        self.cancelers
            .try_register(parent, handle)
            .ok_or_else(|| FleetError::RunInProgress(handle.key()))
    }

    /// Cancel one run. Returns false if it was not running.
    pub fn cancel_run(&self, experiment: &str, run_id: usize) -> bool {
        match self.cancelers.take_for_run(&RunHandle::new(experiment, run_id)) {
            Some(token) => {
                info!(experiment = %experiment, run = run_id, "cancelling run");
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancel every in-flight run of an experiment. Returns how many were cancelled.
    pub fn cancel_experiment(&self, experiment: &str) -> usize {
        let tokens = self.cancelers.take_all_for_experiment(experiment);
        for token in &tokens {
            token.cancel();
        }
        if !tokens.is_empty() {
            info!(experiment = %experiment, runs = tokens.len(), "cancelled experiment runs");
        }
        tokens.len()
    }

    /// Take the deletion lock and cancel the experiment's runs.
    ///
    /// The lock stays held, blocking new runs, until the caller unlocks the
    /// experiment or the deletion TTL expires.
    pub fn begin_experiment_deletion(&self, experiment: &str) -> Result<usize> {
        let _admission = self.admission.lock().unwrap();
        self.locks.lock_experiment_for_deletion(experiment)?;
        Ok(self.cancel_experiment(experiment))
    }

    pub fn is_running(&self, experiment: &str, run_id: usize) -> bool {
        self.cancelers.exists(&RunHandle::new(experiment, run_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ComponentSpec, LoopSpec, Phase};
    use crate::runner::{DryRunExecutor, ExecutorRegistry, PAUSE_COMPONENT_TYPE, PauseExecutor};
    use serde_json::json;
    use std::time::Duration;

    fn manager() -> (RunManager, Arc<DryRunExecutor>) {
        let dry = Arc::new(DryRunExecutor::new());
        let registry = ExecutorRegistry::new()
            .with(PAUSE_COMPONENT_TYPE, Arc::new(PauseExecutor))
            .with_fallback(dry.clone());
        let manager = RunManager::new(
            LoopEngine::new(Arc::new(registry)),
            Arc::new(CancelerRegistry::new()),
            Arc::new(ResourceLocks::default()),
        );
        (manager, dry)
    }

    fn plan() -> RunPlan {
        let spec = LoopSpec::new()
            .with_count(2)
            .with_phase(Phase::Configure, &["topo"])
            .with_phase(Phase::Start, &["topo", "break"])
            .with_phase(Phase::Cleanup, &["topo"]);
        let pause = ComponentSpec::new("break", PAUSE_COMPONENT_TYPE).with_metadata("duration-secs", json!(60));
        RunPlan::new(vec![spec], vec![ComponentSpec::new("topo", ""), pause], 16).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_execute_reports_success() {
        let (manager, dry) = manager();

        let report = manager.execute(&CancellationToken::new(), &plan(), "e1", 0).await.unwrap();

        assert!(report.succeeded(), "{}", report.summary());
        assert_eq!(report.invocations, 8);
        assert_eq!(dry.count(Phase::Configure, Some("topo")), 2);
        assert!(!manager.is_running("e1", 0));
        assert!(manager.cancelers().is_empty());
    }

    #[tokio::test]
    async fn test_execute_rejects_unknown_run() {
        let (manager, _) = manager();
        let err = manager.execute(&CancellationToken::new(), &plan(), "e1", 3).await.unwrap_err();
        assert!(err.is_config());
        assert!(manager.cancelers().is_empty());
    }

    #[tokio::test]
    async fn test_execute_rejects_locked_experiment() {
        let (manager, dry) = manager();
        manager.locks().lock_experiment_for_update("e1").unwrap();

        let err = manager.execute(&CancellationToken::new(), &plan(), "e1", 0).await.unwrap_err();
        assert_eq!(err.to_string(), "experiment e1 is locked with status updating");
        assert!(dry.calls().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_component_removes_canceler() {
        let (manager, _) = manager();
        let spec = LoopSpec::new().with_phase(Phase::Start, &["ghost"]);
        let plan = RunPlan::new(vec![spec], vec![], 16).unwrap();

        let err = manager.execute(&CancellationToken::new(), &plan, "e1", 0).await.unwrap_err();
        assert!(err.to_string().contains("unknown components: ghost"));
        assert!(!manager.is_running("e1", 0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_run_and_duplicate_rejection() {
        let (manager, dry) = manager();
        let manager = Arc::new(manager);
        let plan = Arc::new(plan());

        let running = {
            let manager = manager.clone();
            let plan = plan.clone();
            tokio::spawn(async move { manager.execute(&CancellationToken::new(), &plan, "e1", 0).await })
        };

        // Let the run reach its pause.
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(manager.is_running("e1", 0));

        let err = manager.execute(&CancellationToken::new(), &plan, "e1", 0).await.unwrap_err();
        assert!(matches!(err, FleetError::RunInProgress(_)));

        assert!(manager.cancel_run("e1", 0));
        assert!(!manager.cancel_run("e1", 0));

        let report = running.await.unwrap().unwrap();
        assert!(report.cancelled);
        assert!(!report.succeeded());
        assert_eq!(dry.count(Phase::Configure, Some("topo")), 1);
        assert_eq!(dry.count(Phase::Cleanup, Some("topo")), 1);
        assert_eq!(report.errors.len(), 1);
        assert_eq!(report.errors[0].meta["component"], "break");
    }

    #[tokio::test(start_paused = true)]
    async fn test_deletion_cancels_runs_and_blocks_new_ones() {
        let (manager, _) = manager();
        let manager = Arc::new(manager);
        let plan = Arc::new(plan());

        let mut runs = Vec::new();
        for experiment in ["e1", "e1x"] {
            let manager = manager.clone();
            let plan = plan.clone();
            runs.push(tokio::spawn(async move {
                manager.execute(&CancellationToken::new(), &plan, experiment, 0).await
            }));
        }

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(manager.begin_experiment_deletion("e1").unwrap(), 1);
        assert!(manager.is_running("e1x", 0));

        let err = manager.execute(&CancellationToken::new(), &plan, "e1", 0).await.unwrap_err();
        assert!(err.to_string().contains("locked with status deleting"));

        let first = runs.remove(0).await.unwrap().unwrap();
        assert!(first.cancelled);
        assert_eq!(manager.cancel_experiment("e1x"), 1);
        let second = runs.remove(0).await.unwrap().unwrap();
        assert!(second.cancelled);
    }

    fn hold_plan(runs: usize, phases: &[Phase]) -> RunPlan {
        let mut spec = LoopSpec::new();
        for phase in phases {
            spec = spec.with_phase(*phase, &["hold"]);
        }
        let hold = ComponentSpec::new("hold", PAUSE_COMPONENT_TYPE).with_metadata("duration-secs", json!(60));
        RunPlan::new(vec![spec; runs], vec![hold], 16).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_finished_run_keeps_canceler_of_its_successor() {
        let (manager, _) = manager();
        let manager = Arc::new(manager);
        let plan = Arc::new(hold_plan(1, &[Phase::Configure, Phase::Cleanup]));

        let spawn_run = || {
            let manager = manager.clone();
            let plan = plan.clone();
            tokio::spawn(async move { manager.execute(&CancellationToken::new(), &plan, "e1", 0).await })
        };

        let first = spawn_run();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(manager.cancel_run("e1", 0));

        // The first run is still in its 60s cleanup when the same run starts again.
        tokio::time::sleep(Duration::from_secs(1)).await;
        let second = spawn_run();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(manager.is_running("e1", 0));

        let first = first.await.unwrap().unwrap();
        assert!(first.cancelled);
        assert!(manager.is_running("e1", 0));
        assert!(manager.cancel_run("e1", 0));

        let second = second.await.unwrap().unwrap();
        assert!(second.cancelled);
        assert!(manager.cancelers().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_no_run_slips_in_behind_deletion() {
        let (manager, _) = manager();
        let manager = Arc::new(manager);
        let plan = Arc::new(hold_plan(32, &[Phase::Start]));

        let runs: Vec<_> = (0..32)
            .map(|run_id| {
                let manager = manager.clone();
                let plan = plan.clone();
                tokio::spawn(async move { manager.execute(&CancellationToken::new(), &plan, "e1", run_id).await })
            })
            .collect();

        tokio::task::yield_now().await;
        manager.begin_experiment_deletion("e1").unwrap();

        // Every run was either cancelled by the deletion or refused by its lock.
        for run in runs {
            match run.await.unwrap() {
                Ok(report) => assert!(report.cancelled, "{}", report.summary()),
                Err(err) => assert!(matches!(err, FleetError::Locked { .. }), "{}", err),
            }
        }
        assert!(manager.cancelers().is_empty());
    }
}
