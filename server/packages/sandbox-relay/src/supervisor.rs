//! Named long-running processes inside a sandbox, kept alive by pm2.

use std::collections::BTreeMap;
use std::time::Duration;

use sandbox_relay_error::RelayError;
use sandbox_relay_sandbox_provider::{CommandRequest, SandboxHandle, SandboxProvider};
use serde::Deserialize;
use serde_json::Value;

const LIST_TIMEOUT: Duration = Duration::from_secs(30);
const START_TIMEOUT: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Pm2Status {
    Online,
    Stopping,
    Stopped,
    Launching,
    Errored,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Pm2Env {
    pub status: Pm2Status,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Pm2Process {
    pub name: String,
    #[serde(default)]
    pub pm2_env: Option<Pm2Env>,
}

impl Pm2Process {
    pub fn is_online(&self) -> bool {
        matches!(
            self.pm2_env,
            Some(Pm2Env {
                status: Pm2Status::Online
            })
        )
    }
}

#[derive(Debug, Clone)]
pub struct ProcessSpec {
    pub name: String,
    pub command: String,
    pub cwd: String,
    pub env: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnsureOutcome {
    AlreadyRunning,
    Started,
}

/// Parse `pm2 jlist` output. Anything unreadable yields an empty list and
/// entries that don't look like processes are skipped.
pub fn parse_jlist(stdout: &str) -> Vec<Pm2Process> {
    let entries = match serde_json::from_str::<Value>(stdout.trim()) {
        Ok(Value::Array(entries)) => entries,
        Ok(_) | Err(_) => return Vec::new(),
    };
    entries
        .into_iter()
        .filter_map(|entry| serde_json::from_value(entry).ok())
        .collect()
}

pub struct Supervisor<'a> {
    provider: &'a dyn SandboxProvider,
    sandbox: &'a SandboxHandle,
}

impl<'a> Supervisor<'a> {
    pub fn new(provider: &'a dyn SandboxProvider, sandbox: &'a SandboxHandle) -> Self {
        Self { provider, sandbox }
    }

    pub async fn list(&self, cwd: &str) -> Vec<Pm2Process> {
        let request = CommandRequest::new("pm2 jlist", LIST_TIMEOUT).cwd(cwd);
        match self.provider.run_command(self.sandbox, request).await {
            Ok(output) => parse_jlist(&output.stdout),
            Err(err) => {
                tracing::warn!(
                    sandbox_id = %self.sandbox.sandbox_id,
                    error = %err,
                    "pm2 jlist failed"
                );
                Vec::new()
            }
        }
    }

    pub async fn is_online(&self, cwd: &str, name: &str) -> bool {
        self.list(cwd)
            .await
            .iter()
            .any(|process| process.name == name && process.is_online())
    }

    /// Start `spec` unless a process with its name is already online.
    pub async fn ensure(&self, spec: &ProcessSpec) -> Result<EnsureOutcome, RelayError> {
        if self.is_online(&spec.cwd, &spec.name).await {
            tracing::debug!(name = %spec.name, "pm2 process already online");
            return Ok(EnsureOutcome::AlreadyRunning);
        }

        let cmd = format!(
            "pm2 start {} --name {} --update-env",
            shell_quote(&spec.command),
            shell_quote(&spec.name)
        );
        let request = CommandRequest::new(cmd.clone(), START_TIMEOUT)
            .cwd(spec.cwd.clone())
            .envs(spec.env.clone());
        let output = self
            .provider
            .run_command(self.sandbox, request)
            .await
            .map_err(|err| RelayError::CommandFailed {
                command: cmd.clone(),
                exit_code: None,
                stderr: Some(err.to_string()),
            })?;
        if !output.success() {
            return Err(RelayError::CommandFailed {
                command: cmd,
                exit_code: Some(output.exit_code),
                stderr: Some(output.stderr),
            });
        }
        tracing::info!(
            sandbox_id = %self.sandbox.sandbox_id,
            name = %spec.name,
            "started pm2 process"
        );
        Ok(EnsureOutcome::Started)
    }
}

pub(crate) fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "'\\''"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jlist_parsing_tolerates_garbage() {
        assert!(parse_jlist("").is_empty());
        assert!(parse_jlist("[PM2] Spawning PM2 daemon").is_empty());
        assert!(parse_jlist(r#"{"name":"web"}"#).is_empty());

        let processes = parse_jlist(
            r#"[{"name":"web","pm2_env":{"status":"online"}},
                {"pm_id":3},
                {"name":"agent","pm2_env":{"status":"waiting restart"}}]"#,
        );
        assert_eq!(processes.len(), 2);
        assert!(processes[0].is_online());
        assert_eq!(
            processes[1].pm2_env.as_ref().map(|env| env.status),
            Some(Pm2Status::Unknown)
        );
    }

    #[test]
    fn shell_quote_escapes_single_quotes() {
        assert_eq!(shell_quote("npm run dev"), "'npm run dev'");
        assert_eq!(shell_quote("echo 'hi'"), r#"'echo '\''hi'\'''"#);
    }
}
