//! Client-side projection of one agent session.

use std::collections::HashMap;

use serde::Serialize;

use crate::event::StreamEvent;
use crate::model::{upsert, Message, Part, Session};

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Projection {
    pub messages: Vec<Message>,
    /// Parts keyed by `messageID`. A key is present only while it has parts.
    pub parts: HashMap<String, Vec<Part>>,
    pub session: Option<Session>,
    pub connected: bool,
}

impl Projection {
    /// Fold one event into the projection.
    ///
    /// Session-scoped events (`session.*`, `message.updated`) only apply when
    /// they name `subscribed`; with no subscribed session they never apply.
    /// A `session.deleted` without properties resets unconditionally.
    pub fn apply(mut self, event: StreamEvent, subscribed: Option<&str>) -> Self {
        match event {
            StreamEvent::SessionUpdated { info } => {
                if is_subscribed(subscribed, &info.id) {
                    self.session = Some(info);
                }
                self
            }
            StreamEvent::SessionDeleted { session_id } => match session_id {
                Some(id) if !is_subscribed(subscribed, &id) => self,
                _ => Self::default(),
            },
            StreamEvent::MessageUpdated { info } => {
                if is_subscribed(subscribed, &info.session_id) {
                    upsert(&mut self.messages, info);
                }
                self
            }
            StreamEvent::MessageRemoved { message_id } => {
                self.messages.retain(|message| message.id != message_id);
                self.parts.remove(&message_id);
                self
            }
            StreamEvent::PartUpdated { part } => {
                let parts = self.parts.entry(part.message_id.clone()).or_default();
                upsert(parts, part);
                self
            }
            StreamEvent::PartRemoved {
                message_id,
                part_id,
            } => {
                if let Some(parts) = self.parts.get_mut(&message_id) {
                    parts.retain(|part| part.id != part_id);
                    if parts.is_empty() {
                        self.parts.remove(&message_id);
                    }
                }
                self
            }
            StreamEvent::ServerConnected => {
                self.connected = true;
                self
            }
            StreamEvent::ConnectionClosed => {
                self.connected = false;
                self
            }
            StreamEvent::Unknown { .. } => self,
        }
    }

    /// Parse and fold a raw event payload. Malformed payloads leave the
    /// projection untouched.
    pub fn apply_raw(self, data: &str, subscribed: Option<&str>) -> Self {
        match StreamEvent::parse(data) {
            Ok(event) => self.apply(event, subscribed),
            Err(err) => {
                tracing::debug!(error = %err, "dropping malformed agent event");
                self
            }
        }
    }

    pub fn message(&self, message_id: &str) -> Option<&Message> {
        self.messages.iter().find(|message| message.id == message_id)
    }

    pub fn parts_for(&self, message_id: &str) -> &[Part] {
        self.parts
            .get(message_id)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }
}

fn is_subscribed(subscribed: Option<&str>, session_id: &str) -> bool {
    subscribed == Some(session_id)
}
