use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{ChatMessage, MessageId, ProtocolError, RoomId};

/// Topic prefix for per-room message change events.
pub const ROOM_TOPIC_PREFIX: &str = "room.";

/// Topic that carries [`MessageChange`] events for a room.
pub fn room_topic(room_id: RoomId) -> String {
    format!("{ROOM_TOPIC_PREFIX}{room_id}.messages")
}

/// A change to the Message entity of one room, pushed by the backend.
///
/// Discriminated by `op`:
/// - `insert`: a new confirmed message
/// - `update`: an existing message was rewritten in place
/// - `delete`: one or more messages were removed (a purge is a single
///   delete carrying every removed id)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum MessageChange {
    Insert {
        message: ChatMessage,
    },
    Update {
        message: ChatMessage,
    },
    Delete {
        room_id: RoomId,
        message_ids: Vec<MessageId>,
    },
}

impl MessageChange {
    pub fn room_id(&self) -> RoomId {
        match self {
            Self::Insert { message } | Self::Update { message } => message.room_id,
            Self::Delete { room_id, .. } => *room_id,
        }
    }

    pub fn op(&self) -> &'static str {
        match self {
            Self::Insert { .. } => "insert",
            Self::Update { .. } => "update",
            Self::Delete { .. } => "delete",
        }
    }

    /// Decode the `params` of a `room.<id>.messages` event and check it
    /// belongs to `expected_room`. Clients of the socket protocol use this
    /// on every event frame; in-process channels already carry typed
    /// changes and only need [`validate`](Self::validate).
    pub fn from_event_params(
        params: Option<Value>,
        expected_room: RoomId,
    ) -> Result<Self, ProtocolError> {
        let params =
            params.ok_or_else(|| ProtocolError::InvalidChange("missing params".into()))?;
        let change: MessageChange = serde_json::from_value(params)?;
        change.validate(expected_room)?;
        Ok(change)
    }

    pub fn validate(&self, expected_room: RoomId) -> Result<(), ProtocolError> {
        let room_id = self.room_id();
        if room_id != expected_room {
            return Err(ProtocolError::InvalidChange(format!(
                "change for room {room_id} delivered on channel for {expected_room}"
            )));
        }
        match self {
            Self::Insert { message } | Self::Update { message } if message.body.is_empty() => {
                Err(ProtocolError::InvalidChange(format!(
                    "message {} has an empty body",
                    message.message_id
                )))
            }
            Self::Delete { message_ids, .. } if message_ids.is_empty() => Err(
                ProtocolError::InvalidChange("delete without message ids".into()),
            ),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{TempId, UserId};
    use chrono::Utc;
    use serde_json::json;

    fn message(room_id: RoomId) -> ChatMessage {
        ChatMessage {
            message_id: MessageId::new(),
            room_id,
            sender_id: UserId::new("u1"),
            body: "hello".into(),
            created_at: Utc::now(),
            attachments: vec![],
            client_ref: Some(TempId::new()),
        }
    }

    #[test]
    fn insert_is_tagged_by_op() {
        let room = RoomId::new();
        let change = MessageChange::Insert {
            message: message(room),
        };
        let json = serde_json::to_value(&change).unwrap();
        assert_eq!(json["op"], "insert");
        assert_eq!(json["message"]["body"], "hello");
    }

    #[test]
    fn decode_checks_room() {
        let room = RoomId::new();
        let other = RoomId::new();
        let params = serde_json::to_value(MessageChange::Insert {
            message: message(room),
        })
        .unwrap();

        assert!(MessageChange::from_event_params(Some(params.clone()), room).is_ok());
        let err = MessageChange::from_event_params(Some(params), other).unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidChange(_)));
    }

    #[test]
    fn decode_rejects_unknown_op() {
        let params = json!({ "op": "upsert", "message": {} });
        let err = MessageChange::from_event_params(Some(params), RoomId::new()).unwrap_err();
        assert!(matches!(err, ProtocolError::Json(_)));
    }

    #[test]
    fn decode_rejects_missing_params() {
        assert!(MessageChange::from_event_params(None, RoomId::new()).is_err());
    }

    #[test]
    fn empty_delete_is_invalid() {
        let room = RoomId::new();
        let change = MessageChange::Delete {
            room_id: room,
            message_ids: vec![],
        };
        assert!(change.validate(room).is_err());
    }

    #[test]
    fn topic_names_room() {
        let room = RoomId::new();
        assert_eq!(room_topic(room), format!("room.{room}.messages"));
    }
}
