use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::presence::ConnectionId;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    #[default]
    Chat,
    /// System notices such as joins and leaves. Never authored by a client.
    Info,
}

/// One entry of the chat log. Immutable once appended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(rename = "message")]
    pub text: String,
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "type", default)]
    pub kind: MessageKind,
}

impl Message {
    pub fn is_info(&self) -> bool {
        self.kind == MessageKind::Info
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum ClientEvent {
    #[serde(rename = "join")]
    Join(Option<String>),
    #[serde(rename = "chat message")]
    ChatMessage {
        #[serde(default)]
        username: Option<String>,
        message: String,
    },
    #[serde(rename = "leave")]
    Leave,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum ServerEvent {
    #[serde(rename = "connection")]
    Connected {
        #[serde(rename = "connectionId")]
        connection_id: ConnectionId,
    },
    #[serde(rename = "chat message")]
    ChatMessage(Message),
    #[serde(rename = "user joined")]
    UserJoined(Message),
    #[serde(rename = "user left")]
    UserLeft(Message),
    #[serde(rename = "error")]
    Error { kind: String, message: String },
}
