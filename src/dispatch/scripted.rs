//! In-memory control plane with scripted behaviour.
//!
//! Answers submissions and response waits from queues of scripted results,
//! falling back to defaults once a queue is empty, and counts every call.
//! Used by tests and by dry runs that have no real control plane.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;

use super::command::{Command, ResponseKind};
use super::transport::{ControlPlane, TransportError};
use crate::domain::RunContext;

type Scripted = Result<String, TransportError>;

pub struct ScriptedControlPlane {
    submits: Mutex<VecDeque<Scripted>>,
    /// None accepts every submission with a fresh command ID
    default_submit: Option<Scripted>,
    responses: Mutex<VecDeque<Scripted>>,
    default_response: Scripted,
    stderr: String,
    response_delay: Duration,
    submitted: Mutex<Vec<Command>>,
    next_id: AtomicU64,
    response_calls: AtomicU64,
}

impl ScriptedControlPlane {
    /// Accept everything and answer every command with an empty response.
    pub fn new() -> Self {
        Self {
            submits: Mutex::new(VecDeque::new()),
            default_submit: None,
            responses: Mutex::new(VecDeque::new()),
            default_response: Ok(String::new()),
            stderr: String::new(),
            response_delay: Duration::ZERO,
            submitted: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(0),
            response_calls: AtomicU64::new(0),
        }
    }

    /// Every submission fails with `TransportError::NotActive` unless the
    /// command skips the active check.
    pub fn never_active() -> Self {
        Self {
            default_submit: Some(Err(TransportError::NotActive)),
            ..Self::new()
        }
    }

    /// Queue the result of the next unscripted submission.
    pub fn push_submit(self, result: Scripted) -> Self {
        self.submits.lock().unwrap().push_back(result);
        self
    }

    /// Queue the result of the next unscripted response wait.
    pub fn push_response(self, result: Scripted) -> Self {
        self.responses.lock().unwrap().push_back(result);
        self
    }

    pub fn with_default_response(mut self, response: impl Into<String>) -> Self {
        self.default_response = Ok(response.into());
        self
    }

    /// Standard error attached to every successful response.
    pub fn with_stderr(mut self, stderr: impl Into<String>) -> Self {
        self.stderr = stderr.into();
        self
    }

    /// Delay every response by this long.
    pub fn with_response_delay(mut self, delay: Duration) -> Self {
        self.response_delay = delay;
        self
    }

    pub fn submit_count(&self) -> usize {
        self.submitted.lock().unwrap().len()
    }

    pub fn response_count(&self) -> u64 {
        self.response_calls.load(Ordering::SeqCst)
    }

    /// Every command submitted so far, in submission order.
    pub fn submitted(&self) -> Vec<Command> {
        self.submitted.lock().unwrap().clone()
    }

    fn fresh_id(&self) -> String {
        (self.next_id.fetch_add(1, Ordering::SeqCst) + 1).to_string()
    }
}

impl Default for ScriptedControlPlane {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ControlPlane for ScriptedControlPlane {
    async fn submit(&self, command: &Command) -> Result<String, TransportError> {
        self.submitted.lock().unwrap().push(command.clone());

        let scripted = self.submits.lock().unwrap().pop_front();
        match scripted.or_else(|| self.default_submit.clone()) {
            Some(Err(TransportError::NotActive)) if command.skip_active_check => Ok(self.fresh_id()),
            Some(result) => result,
            None => Ok(self.fresh_id()),
        }
    }

    async fn await_response(
        &self,
        _ctx: &RunContext,
        _command_id: &str,
        command: &Command,
    ) -> Result<String, TransportError> {
        self.response_calls.fetch_add(1, Ordering::SeqCst);

        if !self.response_delay.is_zero() {
            tokio::time::sleep(self.response_delay).await;
        }

        let scripted = self.responses.lock().unwrap().pop_front();
        let stdout = scripted.unwrap_or_else(|| self.default_response.clone())?;

        Ok(match command.response_kind {
            ResponseKind::Stdout => stdout,
            ResponseKind::Stderr => self.stderr.clone(),
            ResponseKind::Both => stdout + &self.stderr,
        })
    }
}
