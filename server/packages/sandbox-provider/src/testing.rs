//! In-memory provider for tests.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use crate::{
    Addressing, CommandOutput, CommandRequest, ProviderError, ProviderFuture, SandboxHandle,
    SandboxProvider,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedCommand {
    pub sandbox_id: String,
    pub cmd: String,
    pub cwd: Option<String>,
    pub envs: BTreeMap<String, String>,
    pub timeout: Duration,
}

#[derive(Debug, Default)]
struct MockState {
    sandboxes: BTreeSet<String>,
    created: Vec<(String, String, Duration)>,
    commands: Vec<RecordedCommand>,
    scripted: Vec<(String, CommandOutput)>,
    next_id: u64,
}

/// Provider that keeps sandboxes in memory and records every command.
///
/// Commands succeed with empty output unless a scripted response matches
/// their prefix. Ports resolve to `http://{host}:{port}`.
#[derive(Debug)]
pub struct MockSandboxProvider {
    host: String,
    state: Mutex<MockState>,
}

impl Default for MockSandboxProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl MockSandboxProvider {
    pub fn new() -> Self {
        Self::with_host("127.0.0.1")
    }

    pub fn with_host(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            state: Mutex::new(MockState::default()),
        }
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn handle(&self, sandbox_id: &str) -> SandboxHandle {
        SandboxHandle::new(
            sandbox_id,
            Addressing::Direct {
                host: self.host.clone(),
            },
        )
    }

    pub fn add_sandbox(&self, sandbox_id: impl Into<String>) {
        self.state().sandboxes.insert(sandbox_id.into());
    }

    /// Respond to commands starting with `prefix`. Later scripts win.
    pub fn script(&self, prefix: impl Into<String>, output: CommandOutput) {
        self.state().scripted.push((prefix.into(), output));
    }

    pub fn commands(&self) -> Vec<RecordedCommand> {
        self.state().commands.clone()
    }

    /// `(sandbox_id, template, timeout)` for every sandbox created so far.
    pub fn created(&self) -> Vec<(String, String, Duration)> {
        self.state().created.clone()
    }
}

impl SandboxProvider for MockSandboxProvider {
    fn connect<'a>(&'a self, sandbox_id: &'a str) -> ProviderFuture<'a, SandboxHandle> {
        Box::pin(async move {
            if self.state().sandboxes.contains(sandbox_id) {
                Ok(self.handle(sandbox_id))
            } else {
                Err(ProviderError::NotFound(sandbox_id.to_string()))
            }
        })
    }

    fn create<'a>(
        &'a self,
        template: &'a str,
        timeout: Duration,
    ) -> ProviderFuture<'a, SandboxHandle> {
        Box::pin(async move {
            let sandbox_id = {
                let mut state = self.state();
                state.next_id += 1;
                let sandbox_id = format!("mock-sbx-{}", state.next_id);
                state.sandboxes.insert(sandbox_id.clone());
                state
                    .created
                    .push((sandbox_id.clone(), template.to_string(), timeout));
                sandbox_id
            };
            Ok(self.handle(&sandbox_id))
        })
    }

    fn run_command<'a>(
        &'a self,
        sandbox: &'a SandboxHandle,
        request: CommandRequest,
    ) -> ProviderFuture<'a, CommandOutput> {
        Box::pin(async move {
            let mut state = self.state();
            if !state.sandboxes.contains(&sandbox.sandbox_id) {
                return Err(ProviderError::NotFound(sandbox.sandbox_id.clone()));
            }
            let output = state
                .scripted
                .iter()
                .rev()
                .find(|(prefix, _)| request.cmd.starts_with(prefix.as_str()))
                .map(|(_, output)| output.clone())
                .unwrap_or_default();
            state.commands.push(RecordedCommand {
                sandbox_id: sandbox.sandbox_id.clone(),
                cmd: request.cmd,
                cwd: request.cwd,
                envs: request.envs,
                timeout: request.timeout,
            });
            Ok(output)
        })
    }
}
