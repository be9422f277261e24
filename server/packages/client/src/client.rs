use std::time::Duration;

use reqwest::{Client, Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

use crate::api::{InitProjectRequest, ProjectEndpoints, ResumeProjectRequest, SendMessage};
use crate::model::{MessageWithParts, Session};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const GET_RETRIES: usize = 2;
const RETRY_DELAY: Duration = Duration::from_millis(300);

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("unexpected http status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid base url: {0}")]
    InvalidBaseUrl(String),
}

/// Client for the relay's project endpoints.
#[derive(Debug, Clone)]
pub struct RelayClient {
    http: Client,
    base_url: String,
}

impl RelayClient {
    pub fn new(base_url: impl Into<String>) -> Result<Self, ClientError> {
        let base_url = base_url.into();
        let trimmed = base_url.trim().trim_end_matches('/');
        if !(trimmed.starts_with("http://") || trimmed.starts_with("https://")) {
            return Err(ClientError::InvalidBaseUrl(base_url));
        }
        // No client-wide timeout: the event stream stays open indefinitely.
        let http = Client::builder().build()?;
        Ok(Self {
            http,
            base_url: trimmed.to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Scoped client for the agent behind `(project_id, sandbox_id)`.
    pub fn agent(&self, project_id: &str, sandbox_id: &str) -> AgentClient {
        AgentClient {
            http: self.http.clone(),
            base_url: format!("{}/api/agent/{project_id}/{sandbox_id}", self.base_url),
        }
    }

    pub async fn init_project(
        &self,
        project_id: &str,
        request: &InitProjectRequest,
    ) -> Result<ProjectEndpoints, ClientError> {
        let url = format!("{}/api/projects/{project_id}/init", self.base_url);
        post_json(&self.http, &url, Some(request)).await
    }

    pub async fn get_project(
        &self,
        project_id: &str,
        sandbox_id: &str,
    ) -> Result<ProjectEndpoints, ClientError> {
        let url = format!("{}/api/projects/{project_id}/{sandbox_id}", self.base_url);
        get_json(&self.http, &url).await
    }

    pub async fn resume_project(
        &self,
        project_id: &str,
        sandbox_id: &str,
        request: &ResumeProjectRequest,
    ) -> Result<ProjectEndpoints, ClientError> {
        let url = format!(
            "{}/api/projects/{project_id}/{sandbox_id}/resume",
            self.base_url
        );
        post_json(&self.http, &url, Some(request)).await
    }
}

/// Client for one sandbox's agent service, reached through the relay proxy.
#[derive(Debug, Clone)]
pub struct AgentClient {
    http: Client,
    base_url: String,
}

impl AgentClient {
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    pub async fn list_sessions(&self) -> Result<Vec<Session>, ClientError> {
        get_json(&self.http, &self.url("session")).await
    }

    pub async fn create_session(&self) -> Result<Session, ClientError> {
        post_json(&self.http, &self.url("session"), Some(&serde_json::json!({}))).await
    }

    /// The first existing session, or a new one when there is none.
    pub async fn session(&self) -> Result<Session, ClientError> {
        let mut sessions = self.list_sessions().await?;
        if sessions.is_empty() {
            let session = self.create_session().await?;
            tracing::info!(session_id = %session.id, "created agent session");
            return Ok(session);
        }
        Ok(sessions.swap_remove(0))
    }

    /// Message history of a session. Entries that don't parse are dropped.
    pub async fn messages(&self, session_id: &str) -> Result<Vec<MessageWithParts>, ClientError> {
        let entries: Vec<Value> =
            get_json(&self.http, &self.url(&format!("session/{session_id}/message"))).await?;
        let total = entries.len();
        let history = MessageWithParts::parse_list(entries);
        if history.len() < total {
            tracing::debug!(
                session_id,
                skipped = total - history.len(),
                "skipping malformed history entries"
            );
        }
        Ok(history)
    }

    pub async fn send_message(
        &self,
        session_id: &str,
        message: &SendMessage,
    ) -> Result<MessageWithParts, ClientError> {
        post_json(
            &self.http,
            &self.url(&format!("session/{session_id}/message")),
            Some(&message.to_body()),
        )
        .await
    }

    pub async fn abort(&self, session_id: &str) -> Result<bool, ClientError> {
        let value: Value = post_json::<Value, Value>(
            &self.http,
            &self.url(&format!("session/{session_id}/abort")),
            None,
        )
        .await?;
        Ok(value.as_bool().unwrap_or(false))
    }

    /// Open the agent's server-sent event stream.
    pub async fn open_events(&self) -> Result<reqwest::Response, ClientError> {
        let response = self
            .http
            .get(self.url("event"))
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .send()
            .await?;
        check_status(response).await
    }
}

async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, ClientError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(ClientError::Status {
        status: status.as_u16(),
        body,
    })
}

async fn read_json<T: DeserializeOwned>(response: reqwest::Response) -> Result<T, ClientError> {
    let response = check_status(response).await?;
    let bytes = response.bytes().await?;
    Ok(serde_json::from_slice(&bytes)?)
}

fn retryable_status(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::REQUEST_TIMEOUT
            | StatusCode::TOO_MANY_REQUESTS
            | StatusCode::BAD_GATEWAY
            | StatusCode::SERVICE_UNAVAILABLE
            | StatusCode::GATEWAY_TIMEOUT
    )
}

async fn get_json<T: DeserializeOwned>(http: &Client, url: &str) -> Result<T, ClientError> {
    let mut attempt = 0;
    loop {
        let result = http
            .request(Method::GET, url)
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await;
        let can_retry = attempt < GET_RETRIES;
        match result {
            Ok(response) if can_retry && retryable_status(response.status()) => {
                tracing::debug!(url, status = %response.status(), attempt, "retrying GET");
            }
            Ok(response) => return read_json(response).await,
            Err(err) if can_retry && (err.is_connect() || err.is_timeout()) => {
                tracing::debug!(url, error = %err, attempt, "retrying GET");
            }
            Err(err) => return Err(err.into()),
        }
        attempt += 1;
        tokio::time::sleep(RETRY_DELAY).await;
    }
}

async fn post_json<B: Serialize + ?Sized, T: DeserializeOwned>(
    http: &Client,
    url: &str,
    body: Option<&B>,
) -> Result<T, ClientError> {
    let mut request = http.request(Method::POST, url).timeout(REQUEST_TIMEOUT);
    if let Some(body) = body {
        request = request.json(body);
    }
    read_json(request.send().await?).await
}
