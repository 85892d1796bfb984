use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Top-level frame sent over a text WebSocket frame.
///
/// Discriminated by `type`:
/// - `request`: client → backend RPC (`rooms.resolve`, `messages.send`, ...)
/// - `response`: backend → client RPC reply
/// - `event`: backend → client push (`room.<id>.messages`)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    Request(Request),
    Response(Response),
    Event(Event),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    /// Correlates the response.
    pub id: Uuid,
    /// Dotted method name, namespace first (e.g. "messages.send").
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// Well-known RPC error codes.
pub mod error_codes {
    pub const METHOD_NOT_FOUND: i32 = -32601;
    pub const INVALID_PARAMS: i32 = -32602;
    pub const INTERNAL_ERROR: i32 = -32603;
    pub const UNAUTHORIZED: i32 = -32001;
    pub const FORBIDDEN: i32 = -32003;
    pub const NOT_FOUND: i32 = -32004;
}

/// Backend → client push event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Event topic (e.g. "room.<room_id>.messages").
    pub topic: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl Request {
    pub fn new(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            id: Uuid::new_v4(),
            method: method.into(),
            params,
        }
    }
}

impl Response {
    pub fn success(id: Uuid, result: Value) -> Self {
        Self {
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn error(id: Uuid, code: i32, message: impl Into<String>) -> Self {
        Self {
            id,
            result: None,
            error: Some(RpcError {
                code,
                message: message.into(),
                data: None,
            }),
        }
    }
}

impl Event {
    pub fn new(topic: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            topic: topic.into(),
            params,
        }
    }
}

pub fn encode_message(msg: &Message) -> Result<String, serde_json::Error> {
    serde_json::to_string(msg)
}

pub fn decode_message(text: &str) -> Result<Message, serde_json::Error> {
    serde_json::from_str(text)
}
