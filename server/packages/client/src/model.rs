//! Agent session entities as seen by the client.
//!
//! Only the identifiers the projection needs are typed; every other field is
//! kept verbatim in `fields` so updates can be shallow-merged without knowing
//! the agent's full schema.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    #[serde(rename = "sessionID")]
    pub session_id: String,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Part {
    pub id: String,
    #[serde(rename = "messageID")]
    pub message_id: String,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

/// One entry of a session's message history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageWithParts {
    pub info: Message,
    #[serde(default)]
    pub parts: Vec<Part>,
}

impl MessageWithParts {
    /// Entries of a history listing that parse. An entry whose `info` is
    /// malformed is skipped; malformed parts are skipped one by one.
    pub fn parse_list(entries: Vec<Value>) -> Vec<Self> {
        entries
            .into_iter()
            .filter_map(|entry| {
                let Value::Object(mut entry) = entry else {
                    return None;
                };
                let info = serde_json::from_value(entry.remove("info")?).ok()?;
                let parts = match entry.remove("parts") {
                    Some(Value::Array(parts)) => parts
                        .into_iter()
                        .filter_map(|part| serde_json::from_value(part).ok())
                        .collect(),
                    _ => Vec::new(),
                };
                Some(Self { info, parts })
            })
            .collect()
    }
}

/// Items stored in keyed, ordered collections.
pub trait Keyed {
    fn key(&self) -> &str;

    /// Overwrite fields present in `update`, keep the rest.
    fn merge(&mut self, update: Self);
}

impl Keyed for Message {
    fn key(&self) -> &str {
        &self.id
    }

    fn merge(&mut self, update: Self) {
        self.session_id = update.session_id;
        self.fields.extend(update.fields);
    }
}

impl Keyed for Part {
    fn key(&self) -> &str {
        &self.id
    }

    fn merge(&mut self, update: Self) {
        self.message_id = update.message_id;
        self.fields.extend(update.fields);
    }
}

/// Append `item` if its key is new, otherwise merge it into the existing
/// entry without moving it.
pub fn upsert<T: Keyed>(items: &mut Vec<T>, item: T) {
    match items.iter_mut().find(|existing| existing.key() == item.key()) {
        Some(existing) => existing.merge(item),
        None => items.push(item),
    }
}

impl Message {
    pub fn text(&self) -> Option<&str> {
        self.fields.get("text").and_then(Value::as_str)
    }
}

impl Part {
    pub fn text(&self) -> Option<&str> {
        self.fields.get("text").and_then(Value::as_str)
    }

    pub fn kind(&self) -> Option<&str> {
        self.fields.get("type").and_then(Value::as_str)
    }
}
