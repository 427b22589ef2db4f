//! C2 command component.
//!
//! Runs the commands listed for a phase in the component's metadata through
//! the dispatcher, all in parallel, and fails the phase if any of them failed.
//!
//! ```yaml
//! - name: apps
//!   type: c2
//!   metadata:
//!     start:
//!     - vm: server
//!       command: systemctl start app
//!     - vm: server
//!       command: systemctl is-active app
//!       expect: active
//!       retry-delay-secs: 2
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use super::executor::ComponentExecutor;
use crate::dispatch::{
    Command, DEFAULT_COMMAND_TIMEOUT, Dispatcher, ErrorGroup, ResponseError, ResponseKind, ResponseValidator,
};
use crate::domain::{ComponentSpec, Phase, RunContext};
use crate::error::{FleetError, Result};

/// Component type handled by `C2Executor` unless registered otherwise.
pub const C2_COMPONENT_TYPE: &str = "c2";

/// One command of a phase.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct C2Step {
    /// Target VM; the experiment namespace itself when absent.
    #[serde(default)]
    pub vm: Option<String>,
    pub command: String,
    /// Substring the response must contain.
    #[serde(default)]
    pub expect: Option<String>,
    /// Resubmit after this many seconds while `expect` is not met.
    #[serde(default)]
    pub retry_delay_secs: Option<u64>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub response: ResponseKind,
    #[serde(default)]
    pub skip_active_check: bool,
}

impl C2Step {
    fn command(&self, namespace: &str, default_timeout: Duration) -> Command {
        let timeout = self.timeout_secs.map(Duration::from_secs).unwrap_or(default_timeout);
        let mut command = Command::new(namespace, self.command.clone())
            .with_timeout(timeout)
            .with_response_kind(self.response)
            .skip_active_check(self.skip_active_check);

        if let Some(vm) = &self.vm {
            command = command.on_vm(vm.clone());
        }
        command
    }

    /// No `expect` means any response is accepted.
    pub fn validator(&self) -> Option<ResponseValidator> {
        let expect = self.expect.clone()?;
        let retry = self.retry_delay_secs.map(Duration::from_secs);

        Some(Arc::new(move |response: &str| {
            if response.contains(&expect) {
                Ok(())
            } else if let Some(delay) = retry {
                Err(ResponseError::Retry(delay))
            } else {
                Err(ResponseError::Unexpected(format!(
                    "expected '{}' in response, got '{}'",
                    expect,
                    response.trim()
                )))
            }
        }))
    }
}

/// Commands per phase.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct C2Metadata {
    pub configure: Vec<C2Step>,
    pub start: Vec<C2Step>,
    pub stop: Vec<C2Step>,
    pub cleanup: Vec<C2Step>,
}

impl C2Metadata {
    pub fn steps(&self, phase: Phase) -> &[C2Step] {
        match phase {
            Phase::Configure => &self.configure,
            Phase::Start => &self.start,
            Phase::Stop => &self.stop,
            Phase::Cleanup => &self.cleanup,
        }
    }
}

pub struct C2Executor {
    dispatcher: Arc<Dispatcher>,
    default_timeout: Duration,
}

impl C2Executor {
    pub fn new(dispatcher: Arc<Dispatcher>) -> Self {
        Self {
            dispatcher,
            default_timeout: DEFAULT_COMMAND_TIMEOUT,
        }
    }

    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    async fn run_phase(&self, ctx: &RunContext, component: &ComponentSpec, phase: Phase) -> Result<()> {
        let metadata: C2Metadata = component.decode_metadata()?;
        let steps = metadata.steps(phase);
        if steps.is_empty() {
            return Ok(());
        }

        debug!(component = %component.name, stage = %phase, commands = steps.len(), "scheduling C2 commands");

        let group = ErrorGroup::new();
        for (index, step) in steps.iter().enumerate() {
            let mut meta = BTreeMap::new();
            meta.insert("step".to_string(), index.to_string());

            self.dispatcher.schedule_parallel_command(
                ctx,
                step.command(ctx.experiment(), self.default_timeout),
                step.validator(),
                &group,
                meta,
            );
        }

        group.wait().await;

        let errors = group.take_errors();
        if errors.is_empty() {
            // Cancelled commands end without reporting.
            if ctx.is_cancelled() {
                return Err(FleetError::Cancelled(format!("{} {} C2 commands", component.name, phase)));
            }
            return Ok(());
        }

        let details: Vec<String> = errors.iter().map(|e| e.to_string()).collect();
        Err(FleetError::Component(format!(
            "{} of {} C2 commands failed for {} {}: {}",
            errors.len(),
            steps.len(),
            component.name,
            phase,
            details.join("; ")
        )))
    }
}

#[async_trait]
impl ComponentExecutor for C2Executor {
    async fn configure(&self, ctx: &RunContext, component: &ComponentSpec) -> Result<()> {
        self.run_phase(ctx, component, Phase::Configure).await
    }

    async fn start(&self, ctx: &RunContext, component: &ComponentSpec) -> Result<()> {
        self.run_phase(ctx, component, Phase::Start).await
    }

    async fn stop(&self, ctx: &RunContext, component: &ComponentSpec) -> Result<()> {
        self.run_phase(ctx, component, Phase::Stop).await
    }

    async fn cleanup(&self, ctx: &RunContext, component: &ComponentSpec) -> Result<()> {
        self.run_phase(ctx, component, Phase::Cleanup).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::{DispatchConfig, ScriptedControlPlane};
    use crate::domain::RunHandle;
    use serde_json::json;
    use tokio_util::sync::CancellationToken;

    fn ctx() -> RunContext {
        RunContext::new(RunHandle::new("e1", 0), CancellationToken::new())
    }

    fn executor(plane: Arc<ScriptedControlPlane>) -> C2Executor {
        let dispatcher = Dispatcher::new(plane, DispatchConfig::default());
        C2Executor::new(Arc::new(dispatcher)).with_default_timeout(Duration::from_secs(30))
    }

    fn component(start: serde_json::Value) -> ComponentSpec {
        ComponentSpec::new("apps", C2_COMPONENT_TYPE).with_metadata("start", start)
    }

    #[tokio::test]
    async fn test_commands_are_sent_to_vms() {
        let plane = Arc::new(ScriptedControlPlane::new());
        let exec = executor(plane.clone());
        let spec = component(json!([
            {"vm": "server", "command": "systemctl start app"},
            {"command": "date", "timeout-secs": 5}
        ]));

        exec.start(&ctx(), &spec).await.unwrap();

        let mut submitted = plane.submitted();
        submitted.sort_by(|a, b| a.command.cmp(&b.command));
        assert_eq!(submitted.len(), 2);
        assert_eq!(submitted[0].command, "date");
        assert_eq!(submitted[0].vm, None);
        assert_eq!(submitted[0].timeout, Duration::from_secs(5));
        assert_eq!(submitted[1].vm.as_deref(), Some("server"));
        assert_eq!(submitted[1].namespace, "e1");
        assert_eq!(submitted[1].timeout, Duration::from_secs(30));
    }

    #[tokio::test]
    async fn test_phase_without_commands_sends_nothing() {
        let plane = Arc::new(ScriptedControlPlane::new());
        let exec = executor(plane.clone());

        exec.configure(&ctx(), &component(json!([{"command": "date"}]))).await.unwrap();
        assert_eq!(plane.submit_count(), 0);
    }

    #[tokio::test]
    async fn test_unexpected_response_fails_phase() {
        let plane = Arc::new(ScriptedControlPlane::new().with_default_response("stopped\n"));
        let exec = executor(plane);
        let spec = component(json!([{"vm": "server", "command": "app status", "expect": "running"}]));

        let err = exec.start(&ctx(), &spec).await.unwrap_err();
        let message = err.to_string();
        assert!(message.contains("1 of 1 C2 commands failed for apps start"));
        assert!(message.contains("expected 'running' in response, got 'stopped'"));
        assert!(message.contains("vm=server"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_until_expected_response() {
        let plane = Arc::new(
            ScriptedControlPlane::new()
                .push_response(Ok("booting".to_string()))
                .with_default_response("ready"),
        );
        let exec = executor(plane.clone());
        let spec = component(json!([{"vm": "server", "command": "status", "expect": "ready", "retry-delay-secs": 1}]));

        exec.start(&ctx(), &spec).await.unwrap();
        assert_eq!(plane.submit_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_phase_is_not_a_success() {
        let plane = Arc::new(ScriptedControlPlane::new().with_response_delay(Duration::from_secs(10)));
        let exec = executor(plane.clone());
        let spec = component(json!([{"vm": "server", "command": "long job"}]));

        let token = CancellationToken::new();
        let ctx = RunContext::new(RunHandle::new("e1", 0), token.clone());
        let canceller = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            token.cancel();
        });

        let err = exec.start(&ctx, &spec).await.unwrap_err();
        canceller.await.unwrap();
        assert!(matches!(err, FleetError::Cancelled(_)));
        assert_eq!(plane.submit_count(), 1);
    }

    #[tokio::test]
    async fn test_bad_metadata_is_config_error() {
        let plane = Arc::new(ScriptedControlPlane::new());
        let exec = executor(plane);
        let spec = component(json!([{"vm": "server"}]));

        let err = exec.start(&ctx(), &spec).await.unwrap_err();
        assert!(err.is_config());
    }

    #[test]
    fn test_validator_absent_without_expect() {
        let step: C2Step = serde_json::from_value(json!({"command": "date"})).unwrap();
        assert!(step.validator().is_none());
        assert_eq!(step.response, ResponseKind::Both);
    }
}
