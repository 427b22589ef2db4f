//! Parallel C2 command dispatcher.
//!
//! Each scheduled command becomes a job on a work queue. A pump task spawns
//! one tokio task per job; the task waits for the control plane to accept
//! the command, waits for its response and runs the caller's validator.
//! A validator asking for a retry puts a fresh job for the same command back
//! on the queue instead of recursing.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::command::Command;
use super::group::{ErrorGroup, TaskGuard};
use super::transport::{ControlPlane, TransportError};
use crate::domain::RunContext;
use crate::error::{FleetError, Result};

/// Default wait between submissions while the control plane is not active.
pub const DEFAULT_REACHABILITY_BACKOFF: Duration = Duration::from_secs(5);

/// Outcome of a response validator other than success.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResponseError {
    /// Not a failure: resubmit the whole command after the delay
    #[error("retry after {0:?}")]
    Retry(Duration),

    /// Response rejected; fatal for this command
    #[error("{0}")]
    Unexpected(String),
}

/// Checks the raw response text of a command.
pub type ResponseValidator = Arc<dyn Fn(&str) -> std::result::Result<(), ResponseError> + Send + Sync>;

/// Dispatcher tuning.
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// Fixed backoff between submissions while the control plane reports not active.
    pub reachability_backoff: Duration,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            reachability_backoff: DEFAULT_REACHABILITY_BACKOFF,
        }
    }
}

struct Job {
    ctx: RunContext,
    command: Command,
    validator: Option<ResponseValidator>,
    meta: BTreeMap<String, String>,
    guard: TaskGuard,
    attempt: u32,
}

impl Job {
    fn group(&self) -> &ErrorGroup {
        self.guard.group()
    }

    /// Run position, command context, then caller metadata (caller wins).
    fn error_meta(&self) -> BTreeMap<String, String> {
        let mut meta = self.ctx.meta();
        meta.extend(self.command.meta());
        meta.extend(self.meta.clone());
        meta
    }

    fn report(&self, error: FleetError) {
        warn!(
            experiment = %self.ctx.experiment(),
            run = self.ctx.run_id(),
            command = %self.command.command,
            error = %error,
            "C2 command failed"
        );
        self.group().add_error(error, self.error_meta());
    }
}

struct Worker {
    transport: Arc<dyn ControlPlane>,
    config: DispatchConfig,
    queue: mpsc::WeakUnboundedSender<Job>,
    enqueued: Arc<AtomicU64>,
}

/// Schedules commands against the control plane. Must be created inside a tokio runtime.
pub struct Dispatcher {
    queue: mpsc::UnboundedSender<Job>,
    enqueued: Arc<AtomicU64>,
}

impl Dispatcher {
    pub fn new(transport: Arc<dyn ControlPlane>, config: DispatchConfig) -> Self {
        let (queue, rx) = mpsc::unbounded_channel();
        let enqueued = Arc::new(AtomicU64::new(0));

        let worker = Arc::new(Worker {
            transport,
            config,
            queue: queue.downgrade(),
            enqueued: enqueued.clone(),
        });

        tokio::spawn(pump(worker, rx));

        Self { queue, enqueued }
    }

    /// Fire-and-forget: register with the group barrier, then queue the command.
    ///
    /// Failures are reported into `group`; the caller waits on the group and
    /// decides what the collected errors mean.
    pub fn schedule_parallel_command(
        &self,
        ctx: &RunContext,
        command: Command,
        validator: Option<ResponseValidator>,
        group: &ErrorGroup,
        meta: BTreeMap<String, String>,
    ) {
        let job = Job {
            ctx: ctx.clone(),
            command,
            validator,
            meta,
            guard: group.register(),
            attempt: 1,
        };

        self.enqueued.fetch_add(1, Ordering::SeqCst);

        if let Err(mpsc::error::SendError(job)) = self.queue.send(job) {
            job.report(FleetError::CommandFailed(format!(
                "dispatch queue closed before scheduling {}",
                job.command.describe()
            )));
        }
    }

    /// Schedule one command and wait for it; returns its first reported error.
    pub async fn run_command(
        &self,
        ctx: &RunContext,
        command: Command,
        validator: Option<ResponseValidator>,
    ) -> Result<()> {
        let group = ErrorGroup::new();
        self.schedule_parallel_command(ctx, command, validator, &group, BTreeMap::new());
        group.wait().await;

        match group.take_errors().into_iter().next() {
            Some(failure) => Err(failure.error),
            None => Ok(()),
        }
    }

    /// Jobs put on the queue so far, retries included.
    pub fn jobs_enqueued(&self) -> u64 {
        self.enqueued.load(Ordering::SeqCst)
    }
}

async fn pump(worker: Arc<Worker>, mut rx: mpsc::UnboundedReceiver<Job>) {
    while let Some(job) = rx.recv().await {
        let worker = worker.clone();
        tokio::spawn(async move { worker.run(job).await });
    }
    debug!("dispatch queue closed");
}

impl Worker {
    async fn run(&self, job: Job) {
        debug!(
            command = %job.command.command,
            vm = ?job.command.vm,
            attempt = job.attempt,
            "dispatching C2 command"
        );

        let command_id = match self.accept(&job).await {
            Ok(Some(id)) => id,
            Ok(None) => return,
            Err(error) => {
                job.report(error);
                return;
            }
        };

        let waited = tokio::select! {
            _ = job.ctx.cancelled() => {
                debug!(command_id = %command_id, "run cancelled while awaiting response");
                return;
            }
            waited = tokio::time::timeout(
                job.command.timeout,
                self.transport.await_response(&job.ctx, &command_id, &job.command),
            ) => waited,
        };

        let response = match waited {
            Err(_) => {
                job.report(FleetError::CommandFailed(format!(
                    "timeout waiting for response to {} (id {})",
                    job.command.describe(),
                    command_id
                )));
                return;
            }
            Ok(Err(error)) => {
                job.report(FleetError::Transport(format!(
                    "getting response for C2 command {}: {}",
                    job.command.describe(),
                    error
                )));
                return;
            }
            Ok(Ok(response)) => response,
        };

        let Some(validator) = job.validator.clone() else {
            return;
        };

        match validator(&response) {
            Ok(()) => {
                debug!(command_id = %command_id, "C2 response validated");
            }
            Err(ResponseError::Retry(delay)) => {
                info!(
                    command = %job.command.command,
                    delay_ms = delay.as_millis() as u64,
                    "C2 response requested retry"
                );
                tokio::select! {
                    _ = job.ctx.cancelled() => return,
                    _ = tokio::time::sleep(delay) => {}
                }
                self.requeue(job);
            }
            Err(ResponseError::Unexpected(reason)) => {
                job.report(FleetError::UnexpectedResponse(reason));
            }
        }
    }

    /// Submit until the control plane accepts. `Ok(None)` means the run was cancelled.
    async fn accept(&self, job: &Job) -> Result<Option<String>> {
        let deadline = Instant::now() + job.command.timeout;

        loop {
            let submitted = tokio::select! {
                _ = job.ctx.cancelled() => return Ok(None),
                submitted = tokio::time::timeout_at(deadline, self.transport.submit(&job.command)) => submitted,
            };

            match submitted {
                Err(_) => return Err(self.inactive(job)),
                Ok(Ok(id)) if !id.is_empty() => return Ok(Some(id)),
                Ok(Ok(_)) | Ok(Err(TransportError::NotActive)) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(self.inactive(job));
                    }

                    debug!(
                        command = %job.command.command,
                        backoff_ms = self.config.reachability_backoff.as_millis() as u64,
                        "C2 client not active, backing off"
                    );

                    let wake = (now + self.config.reachability_backoff).min(deadline);
                    tokio::select! {
                        _ = job.ctx.cancelled() => return Ok(None),
                        _ = tokio::time::sleep_until(wake) => {}
                    }
                }
                Ok(Err(TransportError::Failed(reason))) => {
                    return Err(FleetError::Transport(format!(
                        "executing C2 command {}: {}",
                        job.command.describe(),
                        reason
                    )));
                }
            }
        }
    }

    fn inactive(&self, job: &Job) -> FleetError {
        FleetError::ControlPlaneInactive {
            command: job.command.describe(),
            timeout: job.command.timeout,
        }
    }

    /// Queue the same command again as a new job. The new registration happens
    /// before the old guard drops so the barrier never reads zero in between.
    fn requeue(&self, job: Job) {
        let Job {
            ctx,
            command,
            validator,
            meta,
            guard,
            attempt,
        } = job;

        let next = Job {
            ctx,
            command,
            validator,
            meta,
            guard: guard.group().register(),
            attempt: attempt + 1,
        };

        let Some(queue) = self.queue.upgrade() else {
            next.report(FleetError::CommandFailed(format!(
                "dispatcher shut down before retrying {}",
                next.command.describe()
            )));
            return;
        };

        self.enqueued.fetch_add(1, Ordering::SeqCst);

        if let Err(mpsc::error::SendError(next)) = queue.send(next) {
            next.report(FleetError::CommandFailed(format!(
                "dispatch queue closed before retrying {}",
                next.command.describe()
            )));
        }

        drop(guard);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::ScriptedControlPlane;
    use crate::domain::RunHandle;
    use std::sync::atomic::AtomicU32;
    use tokio_util::sync::CancellationToken;

    fn ctx() -> RunContext {
        RunContext::new(RunHandle::new("e1", 0), CancellationToken::new())
    }

    fn fast() -> DispatchConfig {
        DispatchConfig {
            reachability_backoff: Duration::from_millis(10),
        }
    }

    #[tokio::test]
    async fn test_accepted_command_without_validator_succeeds() {
        let plane = Arc::new(ScriptedControlPlane::new());
        let dispatcher = Dispatcher::new(plane.clone(), fast());
        let group = ErrorGroup::new();

        for vm in ["a", "b", "c"] {
            let cmd = Command::new("e1", "whoami").on_vm(vm);
            dispatcher.schedule_parallel_command(&ctx(), cmd, None, &group, BTreeMap::new());
        }

        group.wait().await;
        assert!(!group.has_errors());
        assert_eq!(plane.submit_count(), 3);
        assert_eq!(plane.response_count(), 3);
    }

    #[tokio::test]
    async fn test_not_active_then_accepted() {
        let plane = Arc::new(
            ScriptedControlPlane::new()
                .push_submit(Err(TransportError::NotActive))
                .push_submit(Ok(String::new())),
        );
        let dispatcher = Dispatcher::new(plane.clone(), fast());

        let cmd = Command::new("e1", "whoami").on_vm("a");
        dispatcher.run_command(&ctx(), cmd, None).await.unwrap();
        assert_eq!(plane.submit_count(), 3);
    }

    #[tokio::test]
    async fn test_other_submit_error_is_fatal() {
        let plane = Arc::new(ScriptedControlPlane::new().push_submit(Err(TransportError::Failed("no such vm".into()))));
        let dispatcher = Dispatcher::new(plane.clone(), fast());
        let group = ErrorGroup::new();

        let mut meta = BTreeMap::new();
        meta.insert("component".to_string(), "apps".to_string());
        dispatcher.schedule_parallel_command(&ctx(), Command::new("e1", "ls").on_vm("x"), None, &group, meta);

        group.wait().await;
        let errors = group.take_errors();
        assert_eq!(errors.len(), 1);
        assert!(matches!(errors[0].error, FleetError::Transport(_)));
        assert!(errors[0].error.to_string().contains("no such vm"));
        assert_eq!(errors[0].meta["component"], "apps");
        assert_eq!(errors[0].meta["vm"], "x");
        assert_eq!(plane.submit_count(), 1);
    }

    #[tokio::test]
    async fn test_response_error_is_fatal() {
        let plane = Arc::new(ScriptedControlPlane::new().push_response(Err(TransportError::Failed("gone".into()))));
        let dispatcher = Dispatcher::new(plane, fast());

        let err = dispatcher
            .run_command(&ctx(), Command::new("e1", "ls").on_vm("a"), None)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("getting response"));
    }

    #[tokio::test]
    async fn test_response_timeout_is_fatal() {
        let plane = Arc::new(ScriptedControlPlane::new().with_response_delay(Duration::from_millis(200)));
        let dispatcher = Dispatcher::new(plane, fast());

        let cmd = Command::new("e1", "sleep 10").on_vm("a").with_timeout(Duration::from_millis(20));
        let err = dispatcher.run_command(&ctx(), cmd, None).await.unwrap_err();
        assert!(matches!(err, FleetError::CommandFailed(_)));
        assert!(err.to_string().contains("timeout waiting for response"));
    }

    #[tokio::test]
    async fn test_validator_rejection() {
        let plane = Arc::new(ScriptedControlPlane::new().with_default_response("stopped"));
        let dispatcher = Dispatcher::new(plane, fast());

        let validator: ResponseValidator = Arc::new(|resp: &str| {
            if resp.contains("running") {
                Ok(())
            } else {
                Err(ResponseError::Unexpected(format!("service is {}", resp)))
            }
        });

        let err = dispatcher
            .run_command(&ctx(), Command::new("e1", "status").on_vm("a"), Some(validator))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "Unexpected response: service is stopped");
    }

    #[tokio::test]
    async fn test_validator_retry_resubmits_until_ready() {
        let plane = Arc::new(
            ScriptedControlPlane::new()
                .push_response(Ok("booting".into()))
                .push_response(Ok("booting".into()))
                .with_default_response("ready"),
        );
        let dispatcher = Dispatcher::new(plane.clone(), fast());

        let calls = Arc::new(AtomicU32::new(0));
        let seen = calls.clone();
        let validator: ResponseValidator = Arc::new(move |resp: &str| {
            seen.fetch_add(1, Ordering::SeqCst);
            if resp == "ready" {
                Ok(())
            } else {
                Err(ResponseError::Retry(Duration::from_millis(5)))
            }
        });

        dispatcher
            .run_command(&ctx(), Command::new("e1", "status").on_vm("a"), Some(validator))
            .await
            .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(plane.submit_count(), 3);
        assert_eq!(dispatcher.jobs_enqueued(), 3);
    }

    #[tokio::test]
    async fn test_cancelled_command_stops_without_reporting() {
        let plane = Arc::new(ScriptedControlPlane::never_active());
        let dispatcher = Dispatcher::new(plane.clone(), fast());
        let group = ErrorGroup::new();
        let run = ctx();

        dispatcher.schedule_parallel_command(&run, Command::new("e1", "ls").on_vm("a"), None, &group, BTreeMap::new());
        tokio::time::sleep(Duration::from_millis(30)).await;
        run.token().cancel();

        group.wait().await;
        assert!(!group.has_errors());
        assert!(plane.submit_count() >= 1);
    }
}
