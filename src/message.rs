//! Envelope and wire protocol definitions
//!
//! Every frame crossing a connection is a JSON object. Outbound frames
//! carry the full envelope; inbound frames only need `content`, the rest
//! is stamped by the connection adapter.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, Serializer};

use crate::error::DecodeError;
use crate::types::{ClientId, ClientIdentity, RoomId};

/// Content of the join announcement
pub const JOIN_CONTENT: &str = "A new user has joined the room";

/// Envelope kind, serialized as the `type` field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvelopeKind {
    /// A member joined the room
    Join,
    /// A member left the room
    Leave,
    /// Chat text from a member
    Chat,
    /// Notice from the server, no sender
    System,
}

/// Message record fanned out by the hub
///
/// Immutable once built: fields are only readable, and each recipient
/// receives its own clone.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    kind: EnvelopeKind,
    room_id: RoomId,
    #[serde(rename = "username", serialize_with = "serialize_sender")]
    sender: Option<ClientIdentity>,
    content: String,
    timestamp: DateTime<Utc>,
}

fn serialize_sender<S>(sender: &Option<ClientIdentity>, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    let name = sender.as_ref().map(|s| s.display_name.as_str()).unwrap_or("");
    serializer.serialize_str(name)
}

impl Envelope {
    fn from_member(kind: EnvelopeKind, sender: &ClientIdentity, content: String) -> Self {
        Self {
            kind,
            room_id: sender.room_id.clone(),
            sender: Some(sender.clone()),
            content,
            timestamp: Utc::now(),
        }
    }

    /// Join announcement for a newly registered member
    pub fn join(member: &ClientIdentity) -> Self {
        Self::from_member(EnvelopeKind::Join, member, JOIN_CONTENT.to_string())
    }

    /// Leave notice for a departed member
    pub fn leave(member: &ClientIdentity) -> Self {
        let content = format!("{} has left the room", member.display_name);
        Self::from_member(EnvelopeKind::Leave, member, content)
    }

    /// Chat message stamped with the sender's bound identity
    pub fn chat(sender: &ClientIdentity, content: String) -> Self {
        Self::from_member(EnvelopeKind::Chat, sender, content)
    }

    /// Server notice addressed to a whole room
    pub fn system(room_id: RoomId, content: String) -> Self {
        Self {
            kind: EnvelopeKind::System,
            room_id,
            sender: None,
            content,
            timestamp: Utc::now(),
        }
    }

    pub fn kind(&self) -> EnvelopeKind {
        self.kind
    }

    pub fn room_id(&self) -> &RoomId {
        &self.room_id
    }

    pub fn sender(&self) -> Option<&ClientIdentity> {
        self.sender.as_ref()
    }

    /// Connection id of the sender, if any
    pub fn sender_id(&self) -> Option<&ClientId> {
        self.sender.as_ref().map(|s| &s.connection_id)
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    /// Serialize to the JSON text carried by one frame
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Client → Server frame
///
/// Any `type`, `room_id`, `username` or `timestamp` a client sends is
/// ignored; only `content` is read.
#[derive(Debug, Deserialize)]
pub struct InboundFrame {
    pub content: String,
}

impl InboundFrame {
    /// Decode and validate one inbound text frame
    pub fn decode(text: &str, max_len: usize) -> Result<String, DecodeError> {
        let frame: InboundFrame = serde_json::from_str(text)?;
        if frame.content.trim().is_empty() {
            return Err(DecodeError::EmptyContent);
        }
        if frame.content.len() > max_len {
            return Err(DecodeError::TooLong {
                len: frame.content.len(),
                max: max_len,
            });
        }
        Ok(frame.content)
    }
}

/// Entry of a membership query
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MemberInfo {
    pub connection_id: ClientId,
    pub username: String,
}

impl From<&ClientIdentity> for MemberInfo {
    fn from(identity: &ClientIdentity) -> Self {
        Self {
            connection_id: identity.connection_id.clone(),
            username: identity.display_name.clone(),
        }
    }
}
