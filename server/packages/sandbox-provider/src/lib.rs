//! Sandbox provider contract.
//!
//! A provider resolves opaque sandbox identifiers to network endpoints,
//! creates sandboxes from templates and runs one-shot commands inside them.
//! Everything above this crate talks to sandboxes only through
//! [`SandboxProvider`].

use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use thiserror::Error;

pub mod http;
pub mod testing;

pub use http::{HttpProviderConfig, HttpSandboxProvider};

/// Boxed future returned by every provider operation.
pub type ProviderFuture<'a, T> =
    Pin<Box<dyn Future<Output = Result<T, ProviderError>> + Send + 'a>>;

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("sandbox not found: {0}")]
    NotFound(String),
    #[error("provider request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("provider returned {status}: {body}")]
    Api { status: u16, body: String },
    #[error("invalid provider response: {0}")]
    InvalidResponse(String),
    #[error("command timed out after {}ms", .0.as_millis())]
    Timeout(Duration),
}

/// How the ports of a sandbox are reached from outside.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Addressing {
    /// `https://{port}-{sandbox_id}.{domain}`
    Subdomain { domain: String },
    /// `http://{host}:{port}`
    Direct { host: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxHandle {
    pub sandbox_id: String,
    addressing: Addressing,
}

impl SandboxHandle {
    pub fn new(sandbox_id: impl Into<String>, addressing: Addressing) -> Self {
        Self {
            sandbox_id: sandbox_id.into(),
            addressing,
        }
    }

    pub fn host(&self, port: u16) -> String {
        match &self.addressing {
            Addressing::Subdomain { domain } => format!("{port}-{}.{domain}", self.sandbox_id),
            Addressing::Direct { host } => format!("{host}:{port}"),
        }
    }

    pub fn url(&self, port: u16) -> String {
        match &self.addressing {
            Addressing::Subdomain { .. } => format!("https://{}", self.host(port)),
            Addressing::Direct { .. } => format!("http://{}", self.host(port)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandRequest {
    pub cmd: String,
    pub cwd: Option<String>,
    pub envs: BTreeMap<String, String>,
    pub timeout: Duration,
}

impl CommandRequest {
    pub fn new(cmd: impl Into<String>, timeout: Duration) -> Self {
        Self {
            cmd: cmd.into(),
            cwd: None,
            envs: BTreeMap::new(),
            timeout,
        }
    }

    pub fn cwd(mut self, cwd: impl Into<String>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn envs(mut self, envs: BTreeMap<String, String>) -> Self {
        self.envs = envs;
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Access to the third-party sandboxing API.
pub trait SandboxProvider: Send + Sync + std::fmt::Debug + 'static {
    /// Resolve an existing sandbox. Fails if the sandbox is unknown or unreachable.
    fn connect<'a>(&'a self, sandbox_id: &'a str) -> ProviderFuture<'a, SandboxHandle>;

    /// Create a sandbox from `template` that stays alive for `timeout`.
    fn create<'a>(&'a self, template: &'a str, timeout: Duration)
        -> ProviderFuture<'a, SandboxHandle>;

    /// Run a shell command inside the sandbox and wait for it to exit.
    fn run_command<'a>(
        &'a self,
        sandbox: &'a SandboxHandle,
        request: CommandRequest,
    ) -> ProviderFuture<'a, CommandOutput>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subdomain_addressing_prefixes_port() {
        let handle = SandboxHandle::new(
            "isx2k9",
            Addressing::Subdomain {
                domain: "e2b.app".to_string(),
            },
        );
        assert_eq!(handle.host(4096), "4096-isx2k9.e2b.app");
        assert_eq!(handle.url(3000), "https://3000-isx2k9.e2b.app");
    }

    #[test]
    fn direct_addressing_uses_plain_http() {
        let handle = SandboxHandle::new(
            "local",
            Addressing::Direct {
                host: "127.0.0.1".to_string(),
            },
        );
        assert_eq!(handle.url(8080), "http://127.0.0.1:8080");
    }
}
