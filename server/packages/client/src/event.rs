use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{Map, Value};
use thiserror::Error;

use crate::model::{Message, Part, Session};

#[derive(Debug, Error)]
pub enum EventError {
    #[error("invalid event json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("event is not an object with a string `type`")]
    MissingType,
    #[error("`session.deleted` properties name no session")]
    MissingSessionId,
    #[error("malformed `{kind}` payload: {source}")]
    Payload {
        kind: String,
        #[source]
        source: serde_json::Error,
    },
}

/// A mutation announced on the agent's event stream.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    SessionUpdated { info: Session },
    /// `session_id` is `None` when the event carries no properties at all.
    SessionDeleted { session_id: Option<String> },
    MessageUpdated { info: Message },
    MessageRemoved { message_id: String },
    PartUpdated { part: Part },
    PartRemoved { message_id: String, part_id: String },
    ServerConnected,
    ConnectionClosed,
    Unknown { kind: String },
}

#[derive(Deserialize)]
struct InfoProperties<T> {
    info: T,
}

#[derive(Deserialize)]
struct SessionRef {
    id: String,
}

#[derive(Deserialize)]
struct SessionDeletedProperties {
    #[serde(rename = "sessionID", default)]
    session_id: Option<String>,
    #[serde(default)]
    info: Option<SessionRef>,
}

#[derive(Deserialize)]
struct MessageRemovedProperties {
    #[serde(rename = "messageID")]
    message_id: String,
}

#[derive(Deserialize)]
struct PartProperties {
    part: Part,
}

#[derive(Deserialize)]
struct PartRemovedProperties {
    #[serde(rename = "messageID")]
    message_id: String,
    #[serde(rename = "partID")]
    part_id: String,
}

impl StreamEvent {
    /// Parse the `data` of one server-sent event.
    pub fn parse(data: &str) -> Result<Self, EventError> {
        let value: Value = serde_json::from_str(data)?;
        Self::from_value(value)
    }

    pub fn from_value(value: Value) -> Result<Self, EventError> {
        let Value::Object(mut object) = value else {
            return Err(EventError::MissingType);
        };
        let kind = match object.remove("type") {
            Some(Value::String(kind)) => kind,
            _ => return Err(EventError::MissingType),
        };
        let (properties, has_properties) = match object.remove("properties") {
            Some(Value::Object(map)) => (map, true),
            _ => (Map::new(), false),
        };

        let event = match kind.as_str() {
            "session.updated" => {
                let props: InfoProperties<Session> = properties_as(&kind, properties)?;
                Self::SessionUpdated { info: props.info }
            }
            "session.deleted" if !has_properties => Self::SessionDeleted { session_id: None },
            "session.deleted" => {
                let props: SessionDeletedProperties = properties_as(&kind, properties)?;
                let session_id = props
                    .session_id
                    .or(props.info.map(|info| info.id))
                    .ok_or(EventError::MissingSessionId)?;
                Self::SessionDeleted {
                    session_id: Some(session_id),
                }
            }
            "message.updated" => {
                let props: InfoProperties<Message> = properties_as(&kind, properties)?;
                Self::MessageUpdated { info: props.info }
            }
            "message.removed" => {
                let props: MessageRemovedProperties = properties_as(&kind, properties)?;
                Self::MessageRemoved {
                    message_id: props.message_id,
                }
            }
            "message.part.updated" => {
                let props: PartProperties = properties_as(&kind, properties)?;
                Self::PartUpdated { part: props.part }
            }
            "message.part.removed" => {
                let props: PartRemovedProperties = properties_as(&kind, properties)?;
                Self::PartRemoved {
                    message_id: props.message_id,
                    part_id: props.part_id,
                }
            }
            "server.connected" => Self::ServerConnected,
            "connection.closed" => Self::ConnectionClosed,
            _ => Self::Unknown { kind },
        };
        Ok(event)
    }

    pub fn kind(&self) -> &str {
        match self {
            Self::SessionUpdated { .. } => "session.updated",
            Self::SessionDeleted { .. } => "session.deleted",
            Self::MessageUpdated { .. } => "message.updated",
            Self::MessageRemoved { .. } => "message.removed",
            Self::PartUpdated { .. } => "message.part.updated",
            Self::PartRemoved { .. } => "message.part.removed",
            Self::ServerConnected => "server.connected",
            Self::ConnectionClosed => "connection.closed",
            Self::Unknown { kind } => kind,
        }
    }
}

fn properties_as<T: DeserializeOwned>(
    kind: &str,
    properties: Map<String, Value>,
) -> Result<T, EventError> {
    serde_json::from_value(Value::Object(properties)).map_err(|source| EventError::Payload {
        kind: kind.to_string(),
        source,
    })
}
