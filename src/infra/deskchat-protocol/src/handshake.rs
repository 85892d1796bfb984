use serde::{Deserialize, Serialize};

use crate::{Profile, RoomId, UserId, VersionRange};

/// First text frame a client sends after the upgrade.
///
/// The caller's identity is established by the surrounding auth layer; the
/// hello only names which user this connection acts for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientHello {
    pub protocol: VersionRange,
    /// Human-readable client identifier (e.g. "deskchat-web/0.1.0").
    pub client_id: String,
    pub user_id: UserId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerHello {
    pub protocol_version: u16,
    /// Server identifier (e.g. "deskchat-gateway/0.1.0").
    pub server_id: String,
    /// Profile of the user this connection acts for.
    pub profile: Profile,
    /// Well-known id of the system-wide broadcast room.
    pub broadcast_room_id: RoomId,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub services: Vec<ServiceCapability>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceCapability {
    /// Service namespace (e.g. "rooms", "messages").
    pub service: String,
    pub version: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HelloReject {
    pub code: HelloRejectCode,
    pub reason: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HelloRejectCode {
    VersionMismatch,
    UnknownUser,
    ServerError,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HandshakeResponse {
    Hello(ServerHello),
    Reject(HelloReject),
}
