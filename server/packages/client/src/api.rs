//! Wire types of the relay's project endpoints and the agent message API.

use std::collections::BTreeMap;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use utoipa::ToSchema;

#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct InitProjectRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sandbox_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub github_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub init_script: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dev_script: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub process_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub work_dir: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preview_port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env: Option<BTreeMap<String, String>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ResumeProjectRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dev_script: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub process_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub work_dir: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preview_port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env: Option<BTreeMap<String, String>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ProjectEndpoints {
    pub project_id: String,
    pub sandbox_id: String,
    pub preview_url: String,
    pub agent_url: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema, JsonSchema)]
pub struct ProxyStatusResponse {
    pub status: u16,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentMode {
    Plan,
    #[default]
    Build,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilePartInput {
    pub mime: String,
    pub filename: String,
    pub url: String,
}

/// A user prompt sent to the agent.
#[derive(Debug, Clone, Default)]
pub struct SendMessage {
    pub text: String,
    pub agent: AgentMode,
    pub files: Vec<FilePartInput>,
    pub model: Option<String>,
    pub provider_id: Option<String>,
}

impl SendMessage {
    /// Request body: file parts first, then the text part when non-empty.
    /// `model` is only sent when a non-blank model id is given.
    pub fn to_body(&self) -> Value {
        let mut parts = Vec::with_capacity(self.files.len() + 1);
        for file in &self.files {
            parts.push(json!({
                "type": "file",
                "mime": file.mime,
                "filename": file.filename,
                "url": file.url,
            }));
        }
        if !self.text.is_empty() {
            parts.push(json!({"type": "text", "text": self.text}));
        }

        let mut body = Map::new();
        body.insert("agent".to_string(), json!(self.agent));
        body.insert("parts".to_string(), Value::Array(parts));
        if let Some(model) = self.model.as_deref().filter(|model| !model.trim().is_empty()) {
            body.insert(
                "model".to_string(),
                json!({"providerID": self.provider_id, "modelID": model}),
            );
        }
        Value::Object(body)
    }
}
