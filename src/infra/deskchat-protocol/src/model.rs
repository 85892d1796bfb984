use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt(f)
            }
        }

        impl std::str::FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Uuid::parse_str(s).map(Self)
            }
        }
    };
}

uuid_id!(
    /// Backend-assigned room identifier.
    RoomId
);
uuid_id!(
    /// Backend-assigned message identifier. Never minted by a client for a
    /// confirmed message.
    MessageId
);
uuid_id!(
    /// Client-generated identifier of an optimistic entry. Sent with the
    /// write as `client_ref` so the push echo can be correlated.
    TempId
);

impl RoomId {
    /// The single system-wide broadcast room.
    pub const BROADCAST: RoomId = RoomId(Uuid::from_u128(0xb40a_dca5_7000_4000_8000_0000_0000_0001));
}

/// Opaque user identifier issued by the auth provider.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub String);

impl UserId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Ticket identifier from the ticketing system.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TicketId(pub String);

impl TicketId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl fmt::Display for TicketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoomKind {
    Ticket,
    Direct,
    Broadcast,
}

impl RoomKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ticket => "ticket",
            Self::Direct => "direct",
            Self::Broadcast => "broadcast",
        }
    }

    pub fn from_label(s: &str) -> Option<Self> {
        match s {
            "ticket" => Some(Self::Ticket),
            "direct" => Some(Self::Direct),
            "broadcast" => Some(Self::Broadcast),
            _ => None,
        }
    }
}

/// What a chat surface is about. Resolved to a [`RoomId`] by the room
/// resolver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RoomContext {
    Ticket { ticket_id: TicketId },
    Direct { a: UserId, b: UserId },
    Broadcast,
}

impl RoomContext {
    pub fn ticket(ticket_id: impl Into<String>) -> Self {
        Self::Ticket {
            ticket_id: TicketId::new(ticket_id),
        }
    }

    pub fn direct(a: UserId, b: UserId) -> Self {
        Self::Direct { a, b }
    }

    pub fn kind(&self) -> RoomKind {
        match self {
            Self::Ticket { .. } => RoomKind::Ticket,
            Self::Direct { .. } => RoomKind::Direct,
            Self::Broadcast => RoomKind::Broadcast,
        }
    }

    /// Normalized lookup key. Direct pairs are order-independent, so
    /// `(a, b)` and `(b, a)` produce the same key. The lower id is length
    /// prefixed because user ids may themselves contain `:`.
    pub fn key(&self) -> String {
        match self {
            Self::Ticket { ticket_id } => format!("ticket:{ticket_id}"),
            Self::Direct { a, b } => {
                let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
                format!("direct:{}:{lo}:{hi}", lo.as_str().len())
            }
            Self::Broadcast => "broadcast".to_string(),
        }
    }

    /// Participants implied by the context itself.
    pub fn participants(&self) -> Vec<UserId> {
        match self {
            Self::Direct { a, b } if a == b => vec![a.clone()],
            Self::Direct { a, b } => vec![a.clone(), b.clone()],
            _ => Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Room {
    pub room_id: RoomId,
    pub kind: RoomKind,
    pub context_key: String,
    /// Explicit name for group and broadcast rooms.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Membership {
    pub room_id: RoomId,
    pub user_id: UserId,
    pub active: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserRole {
    Admin,
    Agent,
    User,
}

impl UserRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Admin => "admin",
            Self::Agent => "agent",
            Self::User => "user",
        }
    }

    pub fn from_label(s: &str) -> Self {
        match s {
            "admin" => Self::Admin,
            "agent" => Self::Agent,
            _ => Self::User,
        }
    }

    /// Roles allowed to purge the broadcast room.
    pub fn can_moderate(&self) -> bool {
        matches!(self, Self::Admin)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    pub user_id: UserId,
    pub full_name: String,
    pub role: UserRole,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub name: String,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
}

/// A confirmed chat message as stored by the backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub message_id: MessageId,
    pub room_id: RoomId,
    pub sender_id: UserId,
    pub body: String,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<Attachment>,
    /// The optimistic entry this message confirms, if it was sent with one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_ref: Option<TempId>,
}

impl ChatMessage {
    /// Total order within a room: `(created_at, message_id)`.
    pub fn order_key(&self) -> (DateTime<Utc>, MessageId) {
        (self.created_at, self.message_id)
    }
}

/// Write request for a new message. The backend assigns id and timestamp.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageDraft {
    pub room_id: RoomId,
    pub sender_id: UserId,
    pub body: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<Attachment>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_ref: Option<TempId>,
}
