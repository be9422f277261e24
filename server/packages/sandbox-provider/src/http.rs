use std::collections::BTreeMap;
use std::time::Duration;

use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};

use crate::{
    Addressing, CommandOutput, CommandRequest, ProviderError, ProviderFuture, SandboxHandle,
    SandboxProvider,
};

const DEFAULT_DOMAIN: &str = "e2b.app";
const API_KEY_HEADER: &str = "X-API-Key";
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);
/// Extra time granted to the HTTP call on top of the command's own timeout.
const COMMAND_TIMEOUT_SLACK: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct HttpProviderConfig {
    pub api_url: String,
    pub api_key: Option<String>,
    pub domain: String,
    pub request_timeout: Duration,
}

impl HttpProviderConfig {
    /// Reads `E2B_DOMAIN`, `E2B_API_URL` and `E2B_API_KEY`.
    pub fn from_env() -> Self {
        let domain = std::env::var("E2B_DOMAIN")
            .ok()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .unwrap_or_else(|| DEFAULT_DOMAIN.to_string());
        let api_url = std::env::var("E2B_API_URL")
            .ok()
            .map(|value| value.trim().trim_end_matches('/').to_string())
            .filter(|value| !value.is_empty())
            .unwrap_or_else(|| format!("https://api.{domain}"));
        let api_key = std::env::var("E2B_API_KEY")
            .ok()
            .filter(|value| !value.trim().is_empty());

        Self {
            api_url,
            api_key,
            domain,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }
}

/// Provider backed by an E2B-style REST API.
#[derive(Debug, Clone)]
pub struct HttpSandboxProvider {
    client: Client,
    config: HttpProviderConfig,
}

#[derive(Debug, Deserialize)]
struct SandboxResponse {
    #[serde(rename = "sandboxID")]
    sandbox_id: String,
    #[serde(default)]
    domain: Option<String>,
}

#[derive(Debug, Serialize)]
struct CreateSandboxBody<'a> {
    #[serde(rename = "templateID")]
    template_id: &'a str,
    timeout: u64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RunCommandBody<'a> {
    cmd: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    cwd: Option<&'a str>,
    envs: &'a BTreeMap<String, String>,
    timeout_ms: u64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RunCommandResponse {
    #[serde(default)]
    stdout: String,
    #[serde(default)]
    stderr: String,
    exit_code: i32,
}

impl HttpSandboxProvider {
    pub fn new(config: HttpProviderConfig) -> Result<Self, ProviderError> {
        let client = Client::builder().timeout(config.request_timeout).build()?;
        Ok(Self { client, config })
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let mut request = self
            .client
            .request(method, format!("{}{path}", self.config.api_url));
        if let Some(api_key) = self.config.api_key.as_ref() {
            request = request.header(API_KEY_HEADER, api_key);
        }
        request
    }

    fn handle_from(&self, response: SandboxResponse) -> SandboxHandle {
        let domain = response
            .domain
            .filter(|domain| !domain.is_empty())
            .unwrap_or_else(|| self.config.domain.clone());
        SandboxHandle::new(response.sandbox_id, Addressing::Subdomain { domain })
    }

    async fn read_sandbox(
        &self,
        response: reqwest::Response,
        sandbox_id: Option<&str>,
    ) -> Result<SandboxHandle, ProviderError> {
        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(ProviderError::NotFound(
                sandbox_id.unwrap_or("<new>").to_string(),
            ));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::Api {
                status: status.as_u16(),
                body,
            });
        }
        let payload: SandboxResponse = response
            .json()
            .await
            .map_err(|err| ProviderError::InvalidResponse(err.to_string()))?;
        Ok(self.handle_from(payload))
    }
}

impl SandboxProvider for HttpSandboxProvider {
    fn connect<'a>(&'a self, sandbox_id: &'a str) -> ProviderFuture<'a, SandboxHandle> {
        Box::pin(async move {
            let response = self
                .request(reqwest::Method::GET, &format!("/sandboxes/{sandbox_id}"))
                .send()
                .await?;
            self.read_sandbox(response, Some(sandbox_id)).await
        })
    }

    fn create<'a>(
        &'a self,
        template: &'a str,
        timeout: Duration,
    ) -> ProviderFuture<'a, SandboxHandle> {
        Box::pin(async move {
            let response = self
                .request(reqwest::Method::POST, "/sandboxes")
                .json(&CreateSandboxBody {
                    template_id: template,
                    timeout: timeout.as_secs(),
                })
                .send()
                .await?;
            let handle = self.read_sandbox(response, None).await?;
            tracing::debug!(sandbox_id = %handle.sandbox_id, template, "sandbox created");
            Ok(handle)
        })
    }

    fn run_command<'a>(
        &'a self,
        sandbox: &'a SandboxHandle,
        request: CommandRequest,
    ) -> ProviderFuture<'a, CommandOutput> {
        Box::pin(async move {
            let body = RunCommandBody {
                cmd: &request.cmd,
                cwd: request.cwd.as_deref(),
                envs: &request.envs,
                timeout_ms: request.timeout.as_millis() as u64,
            };
            let response = self
                .request(
                    reqwest::Method::POST,
                    &format!("/sandboxes/{}/commands", sandbox.sandbox_id),
                )
                .timeout(request.timeout + COMMAND_TIMEOUT_SLACK)
                .json(&body)
                .send()
                .await
                .map_err(|err| {
                    if err.is_timeout() {
                        ProviderError::Timeout(request.timeout)
                    } else {
                        ProviderError::Http(err)
                    }
                })?;

            let status = response.status();
            if status == StatusCode::NOT_FOUND {
                return Err(ProviderError::NotFound(sandbox.sandbox_id.clone()));
            }
            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                return Err(ProviderError::Api {
                    status: status.as_u16(),
                    body,
                });
            }
            let payload: RunCommandResponse = response
                .json()
                .await
                .map_err(|err| ProviderError::InvalidResponse(err.to_string()))?;
            Ok(CommandOutput {
                stdout: payload.stdout,
                stderr: payload.stderr,
                exit_code: payload.exit_code,
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sandbox_response_prefers_reported_domain() {
        let provider = HttpSandboxProvider::new(HttpProviderConfig {
            api_url: "http://127.0.0.1:1".to_string(),
            api_key: None,
            domain: "e2b.app".to_string(),
            request_timeout: Duration::from_secs(1),
        })
        .expect("provider");
        let payload: SandboxResponse =
            serde_json::from_str(r#"{"sandboxID":"abc","domain":"eu.e2b.dev"}"#)
                .expect("payload");
        let handle = provider.handle_from(payload);
        assert_eq!(handle.host(4096), "4096-abc.eu.e2b.dev");
    }

    #[test]
    fn run_command_body_uses_camel_case() {
        let envs = BTreeMap::from([("PORT".to_string(), "3000".to_string())]);
        let body = RunCommandBody {
            cmd: "pm2 jlist",
            cwd: Some("/workspace"),
            envs: &envs,
            timeout_ms: 30_000,
        };
        let value = serde_json::to_value(body).expect("serialize");
        assert_eq!(value["timeoutMs"], 30_000);
        assert_eq!(value["envs"]["PORT"], "3000");
    }
}
