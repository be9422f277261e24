use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use utoipa::ToSchema;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, JsonSchema, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum ErrorType {
    SandboxNotFound,
    SandboxUnavailable,
    CommandFailed,
    InitializeFailed,
    ResumeFailed,
    ConnectFailed,
    PayloadTooLarge,
    Timeout,
}

impl ErrorType {
    pub fn as_urn(&self) -> &'static str {
        match self {
            Self::SandboxNotFound => "urn:sandbox-relay:error:sandbox_not_found",
            Self::SandboxUnavailable => "urn:sandbox-relay:error:sandbox_unavailable",
            Self::CommandFailed => "urn:sandbox-relay:error:command_failed",
            Self::InitializeFailed => "urn:sandbox-relay:error:initialize_failed",
            Self::ResumeFailed => "urn:sandbox-relay:error:resume_failed",
            Self::ConnectFailed => "urn:sandbox-relay:error:connect_failed",
            Self::PayloadTooLarge => "urn:sandbox-relay:error:payload_too_large",
            Self::Timeout => "urn:sandbox-relay:error:timeout",
        }
    }

    pub fn title(&self) -> &'static str {
        match self {
            Self::SandboxNotFound => "Sandbox Not Found",
            Self::SandboxUnavailable => "Sandbox Unavailable",
            Self::CommandFailed => "Command Failed",
            Self::InitializeFailed => "Initialize Failed",
            Self::ResumeFailed => "Resume Failed",
            Self::ConnectFailed => "Connect Failed",
            Self::PayloadTooLarge => "Payload Too Large",
            Self::Timeout => "Timeout",
        }
    }

    pub fn status_code(&self) -> u16 {
        match self {
            Self::SandboxNotFound => 404,
            Self::SandboxUnavailable => 502,
            Self::CommandFailed => 500,
            Self::InitializeFailed => 500,
            Self::ResumeFailed => 500,
            Self::ConnectFailed => 500,
            Self::PayloadTooLarge => 413,
            Self::Timeout => 504,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, ToSchema)]
pub struct ProblemDetails {
    #[serde(rename = "type")]
    pub type_: String,
    pub title: String,
    pub status: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance: Option<String>,
    #[serde(flatten, default, skip_serializing_if = "Map::is_empty")]
    pub extensions: Map<String, Value>,
}

impl ProblemDetails {
    pub fn new(error_type: ErrorType, detail: Option<String>) -> Self {
        Self {
            type_: error_type.as_urn().to_string(),
            title: error_type.title().to_string(),
            status: error_type.status_code(),
            detail,
            instance: None,
            extensions: Map::new(),
        }
    }
}

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("sandbox not found: {sandbox_id}")]
    SandboxNotFound { sandbox_id: String },
    #[error("sandbox unavailable: {message}")]
    SandboxUnavailable {
        sandbox_id: Option<String>,
        message: String,
    },
    #[error("command failed: {command}")]
    CommandFailed {
        command: String,
        exit_code: Option<i32>,
        stderr: Option<String>,
    },
    #[error("failed to initialize sandbox")]
    InitializeFailed { project_id: String },
    #[error("failed to resume sandbox")]
    ResumeFailed {
        project_id: String,
        sandbox_id: String,
    },
    #[error("failed to connect to sandbox")]
    ConnectFailed {
        project_id: String,
        sandbox_id: String,
    },
    #[error("payload exceeds {limit} bytes")]
    PayloadTooLarge { limit: usize },
    #[error("timeout")]
    Timeout { message: Option<String> },
}

impl RelayError {
    pub fn error_type(&self) -> ErrorType {
        match self {
            Self::SandboxNotFound { .. } => ErrorType::SandboxNotFound,
            Self::SandboxUnavailable { .. } => ErrorType::SandboxUnavailable,
            Self::CommandFailed { .. } => ErrorType::CommandFailed,
            Self::InitializeFailed { .. } => ErrorType::InitializeFailed,
            Self::ResumeFailed { .. } => ErrorType::ResumeFailed,
            Self::ConnectFailed { .. } => ErrorType::ConnectFailed,
            Self::PayloadTooLarge { .. } => ErrorType::PayloadTooLarge,
            Self::Timeout { .. } => ErrorType::Timeout,
        }
    }

    fn extensions(&self) -> Map<String, Value> {
        let mut map = Map::new();
        match self {
            Self::SandboxNotFound { sandbox_id } => {
                map.insert("sandboxId".to_string(), Value::String(sandbox_id.clone()));
            }
            Self::SandboxUnavailable { sandbox_id, .. } => {
                if let Some(sandbox_id) = sandbox_id {
                    map.insert("sandboxId".to_string(), Value::String(sandbox_id.clone()));
                }
            }
            Self::CommandFailed {
                command,
                exit_code,
                stderr,
            } => {
                let mut details = Map::new();
                details.insert("command".to_string(), Value::String(command.clone()));
                if let Some(code) = exit_code {
                    details.insert(
                        "exitCode".to_string(),
                        Value::Number(serde_json::Number::from(*code as i64)),
                    );
                }
                if let Some(stderr) = stderr {
                    details.insert("stderr".to_string(), Value::String(stderr.clone()));
                }
                map.insert("details".to_string(), Value::Object(details));
            }
            Self::InitializeFailed { project_id } => {
                map.insert("projectId".to_string(), Value::String(project_id.clone()));
            }
            Self::ResumeFailed {
                project_id,
                sandbox_id,
            }
            | Self::ConnectFailed {
                project_id,
                sandbox_id,
            } => {
                map.insert("projectId".to_string(), Value::String(project_id.clone()));
                map.insert("sandboxId".to_string(), Value::String(sandbox_id.clone()));
            }
            Self::PayloadTooLarge { limit } => {
                map.insert(
                    "limit".to_string(),
                    Value::Number(serde_json::Number::from(*limit as u64)),
                );
            }
            Self::Timeout { message } => {
                if let Some(message) = message {
                    map.insert("message".to_string(), Value::String(message.clone()));
                }
            }
        }
        map
    }

    pub fn to_problem_details(&self) -> ProblemDetails {
        let mut problem = ProblemDetails::new(self.error_type(), Some(self.to_string()));
        problem.extensions = self.extensions();
        problem
    }
}

impl From<RelayError> for ProblemDetails {
    fn from(value: RelayError) -> Self {
        value.to_problem_details()
    }
}

impl From<&RelayError> for ProblemDetails {
    fn from(value: &RelayError) -> Self {
        value.to_problem_details()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn initialize_failure_is_opaque_500() {
        let err = RelayError::InitializeFailed {
            project_id: "abc123".to_string(),
        };
        let problem = err.to_problem_details();
        assert_eq!(problem.status, 500);
        assert_eq!(problem.detail.as_deref(), Some("failed to initialize sandbox"));
        assert_eq!(problem.extensions["projectId"], "abc123");
    }

    #[test]
    fn command_failure_carries_details() {
        let err = RelayError::CommandFailed {
            command: "git clone".to_string(),
            exit_code: Some(128),
            stderr: Some("fatal: repository not found".to_string()),
        };
        let value = serde_json::to_value(err.to_problem_details()).expect("serialize");
        assert_eq!(value["type"], "urn:sandbox-relay:error:command_failed");
        assert_eq!(value["details"]["exitCode"], 128);
        assert_eq!(value["details"]["command"], "git clone");
    }

    #[test]
    fn payload_too_large_reports_limit() {
        let problem = RelayError::PayloadTooLarge { limit: 16 }.to_problem_details();
        assert_eq!(problem.status, 413);
        assert_eq!(problem.type_, "urn:sandbox-relay:error:payload_too_large");
        assert_eq!(problem.extensions["limit"], 16);
    }
}
