//! Project lifecycle: bring a sandbox to the point where its dev server and
//! agent server are running.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use sandbox_relay_client::{InitProjectRequest, ProjectEndpoints, ResumeProjectRequest};
use sandbox_relay_error::RelayError;
use sandbox_relay_sandbox_provider::{
    CommandOutput, CommandRequest, ProviderError, SandboxHandle, SandboxProvider,
};

use crate::router::RelayConfig;
use crate::supervisor::{shell_quote, ProcessSpec, Supervisor};

pub const DEFAULT_WORK_DIR: &str = "/workspace";
pub const DEFAULT_PREVIEW_PORT: u16 = 3000;
pub const AGENT_PROCESS_NAME: &str = "agent-opencode-server";
const AGENT_UPDATE_COMMAND: &str = "bun update -g opencode-ai@latest";

const CLONE_TIMEOUT: Duration = Duration::from_secs(10 * 60);
const INIT_SCRIPT_TIMEOUT: Duration = Duration::from_secs(30 * 60);
const AGENT_UPDATE_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug, Clone)]
pub struct ProjectService {
    provider: Arc<dyn SandboxProvider>,
    config: RelayConfig,
}

impl ProjectService {
    pub fn new(provider: Arc<dyn SandboxProvider>, config: RelayConfig) -> Self {
        Self { provider, config }
    }

    /// Create or reuse a sandbox, check out the project and start its
    /// processes. Any failure is logged and reported as an opaque
    /// [`RelayError::InitializeFailed`].
    pub async fn initialize(
        &self,
        project_id: &str,
        request: InitProjectRequest,
    ) -> Result<ProjectEndpoints, RelayError> {
        self.try_initialize(project_id, normalize_init(request))
            .await
            .map_err(|err| {
                tracing::error!(project_id, error = %err, "project initialization failed");
                RelayError::InitializeFailed {
                    project_id: project_id.to_string(),
                }
            })
    }

    /// Endpoints of an existing sandbox, assuming the default preview port.
    pub async fn describe(
        &self,
        project_id: &str,
        sandbox_id: &str,
    ) -> Result<ProjectEndpoints, RelayError> {
        match self.provider.connect(sandbox_id).await {
            Ok(sandbox) => Ok(self.endpoints(project_id, &sandbox, DEFAULT_PREVIEW_PORT)),
            Err(err) => {
                tracing::error!(project_id, sandbox_id, error = %err, "sandbox lookup failed");
                Err(RelayError::ConnectFailed {
                    project_id: project_id.to_string(),
                    sandbox_id: sandbox_id.to_string(),
                })
            }
        }
    }

    /// Reattach to a sandbox: restart the dev server if asked, update and
    /// restart the agent server.
    pub async fn resume(
        &self,
        project_id: &str,
        sandbox_id: &str,
        request: ResumeProjectRequest,
    ) -> Result<ProjectEndpoints, RelayError> {
        self.try_resume(project_id, sandbox_id, normalize_resume(request))
            .await
            .map_err(|err| {
                tracing::error!(project_id, sandbox_id, error = %err, "project resume failed");
                RelayError::ResumeFailed {
                    project_id: project_id.to_string(),
                    sandbox_id: sandbox_id.to_string(),
                }
            })
    }

    async fn try_initialize(
        &self,
        project_id: &str,
        request: InitProjectRequest,
    ) -> Result<ProjectEndpoints, RelayError> {
        tracing::info!(step = "INIT_START", project_id, "initializing project");

        let sandbox = match request.sandbox_id.as_deref() {
            Some(sandbox_id) => {
                tracing::info!(step = "CONNECT_SANDBOX", project_id, sandbox_id);
                match self.provider.connect(sandbox_id).await {
                    Ok(sandbox) => sandbox,
                    Err(err) => {
                        tracing::warn!(
                            step = "CONNECT_ERROR",
                            project_id,
                            sandbox_id,
                            error = %err,
                            "could not connect, creating a new sandbox"
                        );
                        self.create_sandbox(project_id).await?
                    }
                }
            }
            None => self.create_sandbox(project_id).await?,
        };

        let work_dir = request
            .work_dir
            .unwrap_or_else(|| DEFAULT_WORK_DIR.to_string());

        if let Some(github_url) = request.github_url.as_deref() {
            tracing::info!(step = "CLONE_REPO", project_id, github_url, work_dir = %work_dir);
            let cmd = format!(
                "git clone {} {}",
                shell_quote(github_url),
                shell_quote(&work_dir)
            );
            self.run(&sandbox, CommandRequest::new(cmd, CLONE_TIMEOUT))
                .await?;
        }

        if let Some(init_script) = request.init_script {
            tracing::info!(step = "INIT_SCRIPT", project_id, work_dir = %work_dir);
            self.run(
                &sandbox,
                CommandRequest::new(init_script, INIT_SCRIPT_TIMEOUT).cwd(work_dir.clone()),
            )
            .await?;
        }

        let port = request.preview_port.unwrap_or(DEFAULT_PREVIEW_PORT);
        let env = process_env(request.env, port);
        let supervisor = Supervisor::new(self.provider.as_ref(), &sandbox);

        if let (Some(command), Some(name)) = (request.dev_script, request.process_name) {
            supervisor
                .ensure(&ProcessSpec {
                    name,
                    command,
                    cwd: work_dir.clone(),
                    env: env.clone(),
                })
                .await?;
            tracing::info!(step = "DEV_SERVER_STARTED", project_id);
        }

        supervisor.ensure(&self.agent_process(&work_dir, env)).await?;
        tracing::info!(step = "AGENT_STARTED", project_id);

        let endpoints = self.endpoints(project_id, &sandbox, port);
        tracing::info!(
            step = "INIT_COMPLETE",
            project_id,
            sandbox_id = %endpoints.sandbox_id,
            preview_url = %endpoints.preview_url
        );
        Ok(endpoints)
    }

    async fn try_resume(
        &self,
        project_id: &str,
        sandbox_id: &str,
        request: ResumeProjectRequest,
    ) -> Result<ProjectEndpoints, RelayError> {
        tracing::info!(step = "RESUME_START", project_id, sandbox_id);
        let sandbox = self
            .provider
            .connect(sandbox_id)
            .await
            .map_err(|err| provider_error(sandbox_id, err))?;

        let work_dir = request
            .work_dir
            .unwrap_or_else(|| DEFAULT_WORK_DIR.to_string());
        let port = request.preview_port.unwrap_or(DEFAULT_PREVIEW_PORT);
        let env = process_env(request.env, port);
        let supervisor = Supervisor::new(self.provider.as_ref(), &sandbox);

        if let (Some(command), Some(name)) = (request.dev_script, request.process_name) {
            tracing::info!(step = "RESTART_DEV", project_id, name = %name);
            supervisor
                .ensure(&ProcessSpec {
                    name,
                    command,
                    cwd: work_dir.clone(),
                    env: env.clone(),
                })
                .await?;
        }

        tracing::info!(step = "UPDATE_AGENT", project_id, "updating agent server");
        self.run(
            &sandbox,
            CommandRequest::new(AGENT_UPDATE_COMMAND, AGENT_UPDATE_TIMEOUT),
        )
        .await?;
        supervisor.ensure(&self.agent_process(&work_dir, env)).await?;
        tracing::info!(step = "AGENT_READY", project_id);

        let endpoints = self.endpoints(project_id, &sandbox, port);
        tracing::info!(
            step = "RESUME_COMPLETE",
            project_id,
            preview_url = %endpoints.preview_url
        );
        Ok(endpoints)
    }

    async fn create_sandbox(&self, project_id: &str) -> Result<SandboxHandle, RelayError> {
        tracing::info!(
            step = "CREATE_SANDBOX",
            project_id,
            template = %self.config.template
        );
        let sandbox = self
            .provider
            .create(&self.config.template, self.config.sandbox_timeout)
            .await
            .map_err(|err| RelayError::SandboxUnavailable {
                sandbox_id: None,
                message: err.to_string(),
            })?;
        tracing::info!(step = "SANDBOX_CREATED", project_id, sandbox_id = %sandbox.sandbox_id);
        Ok(sandbox)
    }

    async fn run(
        &self,
        sandbox: &SandboxHandle,
        request: CommandRequest,
    ) -> Result<CommandOutput, RelayError> {
        let command = request.cmd.clone();
        let output = self
            .provider
            .run_command(sandbox, request)
            .await
            .map_err(|err| provider_error(&sandbox.sandbox_id, err))?;
        if !output.success() {
            return Err(RelayError::CommandFailed {
                command,
                exit_code: Some(output.exit_code),
                stderr: Some(output.stderr),
            });
        }
        Ok(output)
    }

    fn agent_process(&self, work_dir: &str, env: BTreeMap<String, String>) -> ProcessSpec {
        ProcessSpec {
            name: AGENT_PROCESS_NAME.to_string(),
            command: format!(
                "opencode serve --hostname 0.0.0.0 --port {}",
                self.config.agent_port
            ),
            cwd: work_dir.to_string(),
            env,
        }
    }

    fn endpoints(&self, project_id: &str, sandbox: &SandboxHandle, port: u16) -> ProjectEndpoints {
        ProjectEndpoints {
            project_id: project_id.to_string(),
            sandbox_id: sandbox.sandbox_id.clone(),
            preview_url: format!("https://{}", sandbox.host(port)),
            agent_url: format!("https://{}", sandbox.host(self.config.agent_port)),
        }
    }
}

fn provider_error(sandbox_id: &str, err: ProviderError) -> RelayError {
    match err {
        ProviderError::NotFound(sandbox_id) => RelayError::SandboxNotFound { sandbox_id },
        ProviderError::Timeout(after) => RelayError::Timeout {
            message: Some(format!("command timed out after {}s", after.as_secs())),
        },
        other => RelayError::SandboxUnavailable {
            sandbox_id: Some(sandbox_id.to_string()),
            message: other.to_string(),
        },
    }
}

fn process_env(env: Option<BTreeMap<String, String>>, port: u16) -> BTreeMap<String, String> {
    let mut env = env.unwrap_or_default();
    env.insert("PORT".to_string(), port.to_string());
    env
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|value| !value.trim().is_empty())
}

fn normalize_init(request: InitProjectRequest) -> InitProjectRequest {
    InitProjectRequest {
        sandbox_id: non_empty(request.sandbox_id),
        github_url: non_empty(request.github_url),
        init_script: non_empty(request.init_script),
        dev_script: non_empty(request.dev_script),
        process_name: non_empty(request.process_name),
        work_dir: non_empty(request.work_dir),
        preview_port: request.preview_port.filter(|port| *port != 0),
        env: request.env,
    }
}

fn normalize_resume(request: ResumeProjectRequest) -> ResumeProjectRequest {
    ResumeProjectRequest {
        dev_script: non_empty(request.dev_script),
        process_name: non_empty(request.process_name),
        work_dir: non_empty(request.work_dir),
        preview_port: request.preview_port.filter(|port| *port != 0),
        env: request.env,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blank_fields_are_absent() {
        let request = normalize_init(InitProjectRequest {
            sandbox_id: Some(String::new()),
            github_url: Some("  ".to_string()),
            dev_script: Some("npm run dev".to_string()),
            preview_port: Some(0),
            ..InitProjectRequest::default()
        });
        assert!(request.sandbox_id.is_none());
        assert!(request.github_url.is_none());
        assert_eq!(request.dev_script.as_deref(), Some("npm run dev"));
        assert!(request.preview_port.is_none());
    }

    #[test]
    fn port_overrides_supplied_env() {
        let env = process_env(
            Some(BTreeMap::from([
                ("PORT".to_string(), "1".to_string()),
                ("NODE_ENV".to_string(), "development".to_string()),
            ])),
            5173,
        );
        assert_eq!(env["PORT"], "5173");
        assert_eq!(env["NODE_ENV"], "development");
    }
}
