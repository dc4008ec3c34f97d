//! Persisted records: users, rooms and turns.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Wraps an existing identifier.
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            /// Borrow the identifier as a string slice.
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(id: &str) -> Self {
                Self(id.to_string())
            }
        }

        impl From<String> for $name {
            fn from(id: String) -> Self {
                Self(id)
            }
        }
    };
}

string_id!(
    /// Opaque per-user identity key (device fingerprint or account id).
    UserId
);

string_id!(
    /// Room identifier, `room_<uuid>`.
    RoomId
);

string_id!(
    /// Turn (message) identifier.
    TurnId
);

impl RoomId {
    /// Builds a room id from a uuid.
    pub fn from_uuid(uuid: uuid::Uuid) -> Self {
        Self(format!("room_{uuid}"))
    }
}

/// A participant. `room_id == None` means unpaired.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    /// Identity key.
    pub id: UserId,
    /// First contact.
    pub created_at: DateTime<Utc>,
    /// Current room, if paired.
    #[serde(default)]
    pub room_id: Option<RoomId>,
}

impl User {
    /// A freshly created, unpaired user.
    pub fn new(id: UserId, created_at: DateTime<Utc>) -> Self {
        Self { id, created_at, room_id: None }
    }

    /// Whether the user currently belongs to a room.
    pub fn is_paired(&self) -> bool {
        self.room_id.is_some()
    }
}

/// A pairing of users for one reshuffle epoch.
///
/// Membership is fixed at creation. Rooms are superseded by the next
/// reshuffle, never edited.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Room {
    /// Room identifier.
    pub id: RoomId,
    /// When the pairing engine created the room.
    pub created_at: DateTime<Utc>,
    /// Member identities, normally exactly two.
    pub users: Vec<UserId>,
}

impl Room {
    /// Whether `user` is a member of this room.
    pub fn has_member(&self, user: &UserId) -> bool {
        self.users.contains(user)
    }
}

/// One persisted chat message.
///
/// Timestamps are optional because records written by older clients may
/// lack them. Such turns sort first when replayed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Turn {
    /// Turn identifier.
    pub id: TurnId,
    /// Owning room.
    pub room_id: RoomId,
    /// Who sent it.
    pub original_sender_id: UserId,
    /// Text as submitted.
    pub original_text: String,
    /// Text after the transform step (equals `original_text` on fallback).
    pub processed_text: String,
    /// When the relay received the message.
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    /// When the transform step finished.
    #[serde(default)]
    pub processed_at: Option<DateTime<Utc>>,
}
