//! Basic type definitions for the chat hub
//!
//! Provides newtype wrappers for type safety:
//! - `ClientId`: opaque per-connection identifier
//! - `RoomId`: room identifier shared with the persistence layer
//! - `ClientIdentity`: the immutable identity bound to one connection

use base64::engine::general_purpose::URL_SAFE;
use base64::Engine;
use rand::RngCore;
use serde::Serialize;
use uuid::Uuid;

/// Unique connection identifier (newtype pattern)
///
/// Either supplied by the caller at upgrade time or a fresh UUID v4.
/// Implements Hash and Eq for use as HashMap keys.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct ClientId(pub String);

impl ClientId {
    /// Create a new random client ID
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Wrap a caller-resolved identifier
    pub fn from_string(id: String) -> Self {
        Self(id)
    }
}

impl Default for ClientId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ClientId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Room identifier
///
/// Rooms are keyed by an opaque string. Ids minted here are 16 random
/// bytes in URL-safe base64, the same shape the room store hands out.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct RoomId(pub String);

impl RoomId {
    /// Generate a new random room id
    pub fn generate() -> Self {
        let mut bytes = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(URL_SAFE.encode(bytes))
    }

    /// Create a RoomId from a string
    pub fn from_string(id: String) -> Self {
        Self(id)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for RoomId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl std::fmt::Display for RoomId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identity bound to a connection at registration
///
/// Immutable for the lifetime of the connection; changing room means
/// reconnecting.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClientIdentity {
    pub connection_id: ClientId,
    pub display_name: String,
    pub room_id: RoomId,
}

impl ClientIdentity {
    pub fn new(connection_id: ClientId, display_name: impl Into<String>, room_id: RoomId) -> Self {
        Self {
            connection_id,
            display_name: display_name.into(),
            room_id,
        }
    }
}
