//! Message codec: the JSON wire contract.
//!
//! Every frame is a JSON object with a `type` discriminant. Decoding turns a
//! raw text frame into a closed tagged union before any business logic runs;
//! validation here is structural only (presence and type of fields), the
//! router owns the dispatch rules. Field names and enumerated values are
//! part of the wire contract shared with the client side.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A peer reference as it appears on the wire: `{"_id": "..."}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Peer {
    #[serde(rename = "_id")]
    pub id: String,
}

/// Content type of a chat message. Carried on the wire by the `type` token
/// itself — a bare `message` means text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentType {
    Text,
    Image,
    Video,
    File,
}

impl ContentType {
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "text" => Some(Self::Text),
            "image" => Some(Self::Image),
            "video" => Some(Self::Video),
            "file" => Some(Self::File),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Image => "image",
            Self::Video => "video",
            Self::File => "file",
        }
    }
}

/// Presence status values stored in the user directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceStatus {
    Online,
    Offline,
    Away,
}

impl PresenceStatus {
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "online" => Some(Self::Online),
            "offline" => Some(Self::Offline),
            "away" => Some(Self::Away),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Online => "online",
            Self::Offline => "offline",
            Self::Away => "away",
        }
    }
}

/// Typing indicator. Relayed verbatim to every connected participant other
/// than the sender.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypingEvent {
    pub is_typing: bool,
    pub sender: Peer,
    pub participants: Vec<Peer>,
    pub conversation: String,
}

/// Chat message as received from a client. The content type comes from the
/// frame's `type` token, not a body field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageEvent {
    pub sender: Peer,
    pub participants: Vec<Peer>,
    pub conversation: String,
    pub content: String,
    pub content_type: ContentType,
}

/// Body fields shared by the message-family inbound types.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MessagePayload {
    sender: Peer,
    participants: Vec<Peer>,
    conversation: String,
    content: String,
}

/// Presence update request for a user in the directory.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserStatusEvent {
    pub user_id: String,
    pub status: PresenceStatus,
    #[serde(default)]
    pub last_seen: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AuthenticatePayload {
    user_id: String,
}

/// Every frame a client can legally send, decoded and shape-checked.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundEvent {
    Authenticate { user_id: String },
    Typing(TypingEvent),
    Message(MessageEvent),
    UserStatus(UserStatusEvent),
}

/// Chat message as delivered to peers: the inbound shape enriched with the
/// server-assigned id and persistence timestamp.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageFrame {
    #[serde(rename = "_id")]
    pub id: String,
    pub sender: Peer,
    pub participants: Vec<Peer>,
    pub conversation: String,
    pub content: String,
    pub content_type: ContentType,
    pub timestamp: DateTime<Utc>,
}

/// Every frame the relay delivers to a client.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum OutboundEvent {
    #[serde(rename = "typing")]
    Typing(TypingEvent),
    #[serde(rename = "message")]
    Message(MessageFrame),
    #[serde(rename = "user-status", rename_all = "camelCase")]
    UserStatus {
        user_id: String,
        status: PresenceStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        last_seen: Option<DateTime<Utc>>,
    },
    #[serde(rename = "error", rename_all = "camelCase")]
    Error {
        error: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        details: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        received_type: Option<String>,
    },
}

impl OutboundEvent {
    /// Error envelope addressed to the originating connection only.
    pub fn error(reason: impl Into<String>) -> Self {
        OutboundEvent::Error {
            error: reason.into(),
            details: None,
            received_type: None,
        }
    }
}

/// Why a frame failed to decode. The connection survives every variant;
/// the raw type token is preserved where the frame was well-formed enough
/// to carry one.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("malformed frame: {0}")]
    Malformed(serde_json::Error),
    #[error("frame has no type field")]
    MissingType,
    #[error("unknown message type: {received}")]
    UnknownType { received: String },
    #[error("invalid {received} payload: {source}")]
    InvalidPayload {
        received: String,
        #[source]
        source: serde_json::Error,
    },
}

impl DecodeError {
    /// The raw `type` token, when one was present.
    pub fn received_type(&self) -> Option<&str> {
        match self {
            Self::UnknownType { received } | Self::InvalidPayload { received, .. } => {
                Some(received)
            }
            _ => None,
        }
    }
}

/// Parse an inbound text frame into a typed event.
pub fn decode(raw: &str) -> Result<InboundEvent, DecodeError> {
    let value: serde_json::Value = serde_json::from_str(raw).map_err(DecodeError::Malformed)?;

    let token = value
        .get("type")
        .and_then(|t| t.as_str())
        .ok_or(DecodeError::MissingType)?
        .to_string();

    match token.as_str() {
        "authenticate" => {
            let payload: AuthenticatePayload = parse_payload(&token, value)?;
            Ok(InboundEvent::Authenticate {
                user_id: payload.user_id,
            })
        }
        "typing" => Ok(InboundEvent::Typing(parse_payload(&token, value)?)),
        "message" | "text" | "image" | "video" | "file" => {
            let payload: MessagePayload = parse_payload(&token, value)?;
            Ok(InboundEvent::Message(MessageEvent {
                sender: payload.sender,
                participants: payload.participants,
                conversation: payload.conversation,
                content: payload.content,
                content_type: ContentType::from_str(&token).unwrap_or(ContentType::Text),
            }))
        }
        "user-status" => Ok(InboundEvent::UserStatus(parse_payload(&token, value)?)),
        _ => Err(DecodeError::UnknownType { received: token }),
    }
}

/// Serialize an outbound event to its wire form.
pub fn encode(event: &OutboundEvent) -> Result<String, serde_json::Error> {
    serde_json::to_string(event)
}

fn parse_payload<T: DeserializeOwned>(
    token: &str,
    value: serde_json::Value,
) -> Result<T, DecodeError> {
    serde_json::from_value(value).map_err(|source| DecodeError::InvalidPayload {
        received: token.to_string(),
        source,
    })
}
