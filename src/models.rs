// src/models.rs

use crate::error::ProtocolError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

/// Raw envelope shared by every frame: `{"type": ..., "payload": {...}}`.
#[derive(Deserialize, Debug)]
struct Envelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    payload: Value,
}

/// A message sent from a client to the server.
/// Decoded from incoming JSON text and validated before any handler sees it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientMessage {
    /// Chat message. `board_id` falls back to the connection's current room.
    Message {
        board_id: Option<String>,
        content: String,
        mentions: Vec<String>,
    },
    Ping { timestamp: Option<i64> },
    Join { board_id: String },
    /// `board_id` falls back to the connection's current room.
    Leave { board_id: Option<String> },
}

#[derive(Deserialize)]
struct ChatPayload {
    #[serde(default, deserialize_with = "optional_board_id")]
    board_id: Option<String>,
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    mentions: Option<Vec<String>>,
}

#[derive(Deserialize)]
struct PingPayload {
    #[serde(default)]
    timestamp: Option<i64>,
}

#[derive(Deserialize)]
struct RoomPayload {
    #[serde(default, deserialize_with = "optional_board_id")]
    board_id: Option<String>,
}

impl ClientMessage {
    /// Decodes one text frame into a typed message.
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        let envelope: Envelope =
            serde_json::from_str(text).map_err(|_| ProtocolError::InvalidFormat)?;
        let payload = match envelope.payload {
            Value::Null => Value::Object(Map::new()),
            other => other,
        };

        match envelope.kind.as_str() {
            "message" => {
                let chat: ChatPayload = parse_payload("message", payload)?;
                let content = chat.content.unwrap_or_default();
                if content.trim().is_empty() {
                    return Err(ProtocolError::Validation("Content is required".to_string()));
                }
                Ok(ClientMessage::Message {
                    board_id: chat.board_id,
                    content,
                    mentions: chat.mentions.unwrap_or_default(),
                })
            }
            "ping" => {
                let ping: PingPayload = parse_payload("ping", payload)?;
                Ok(ClientMessage::Ping {
                    timestamp: ping.timestamp,
                })
            }
            "join" => {
                let room: RoomPayload = parse_payload("join", payload)?;
                let board_id = room.board_id.ok_or_else(|| {
                    ProtocolError::Validation("board_id is required".to_string())
                })?;
                Ok(ClientMessage::Join { board_id })
            }
            "leave" => {
                let room: RoomPayload = parse_payload("leave", payload)?;
                Ok(ClientMessage::Leave {
                    board_id: room.board_id,
                })
            }
            other => Err(ProtocolError::UnknownType(other.to_string())),
        }
    }
}

fn parse_payload<T: for<'de> Deserialize<'de>>(
    kind: &str,
    payload: Value,
) -> Result<T, ProtocolError> {
    serde_json::from_value(payload)
        .map_err(|e| ProtocolError::Validation(format!("Invalid {} payload: {}", kind, e)))
}

/// A message sent from the server to a client.
/// Serialized into the same `type`/`payload` envelope the client speaks.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ServerMessage {
    Message(ChatMessage),
    Pong {
        timestamp: i64,
    },
    Joined {
        board_id: String,
    },
    Left {
        board_id: String,
    },
    Error {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        code: Option<String>,
    },
}

impl From<&ProtocolError> for ServerMessage {
    fn from(error: &ProtocolError) -> Self {
        ServerMessage::Error {
            message: error.to_string(),
            code: Some(error.code().to_string()),
        }
    }
}

/// A chat message as stored and delivered. `id` and `created_at` come from the store.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ChatMessage {
    pub id: String,
    pub board_id: String,
    pub user_id: String,
    pub username: String,
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub mentions: Vec<String>,
    pub created_at: DateTime<Utc>,
}

/// A chat message that has not been persisted yet.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NewMessage {
    pub board_id: String,
    pub user_id: String,
    pub username: String,
    pub content: String,
    pub mentions: Vec<String>,
}

impl NewMessage {
    /// Attaches the store-assigned fields.
    pub fn into_persisted(self, id: String, created_at: DateTime<Utc>) -> ChatMessage {
        ChatMessage {
            id,
            board_id: self.board_id,
            user_id: self.user_id,
            username: self.username,
            content: self.content,
            mentions: self.mentions,
            created_at,
        }
    }
}

/// Identifiers arrive as strings from some clients and as integers from others.
#[derive(Deserialize)]
#[serde(untagged)]
enum RawId {
    Text(String),
    Number(i64),
}

impl From<RawId> for String {
    fn from(raw: RawId) -> Self {
        match raw {
            RawId::Text(text) => text,
            RawId::Number(number) => number.to_string(),
        }
    }
}

/// Accepts a string or integer id and normalizes it to a string.
pub fn flexible_id<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    RawId::deserialize(deserializer).map(String::from)
}

fn optional_board_id<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<RawId>::deserialize(deserializer)?;
    Ok(raw
        .map(String::from)
        .map(|id| id.trim().to_string())
        .filter(|id| !id.is_empty()))
}
