use thiserror::Error;

/// Protocol-level errors.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid message change: {0}")]
    InvalidChange(String),

    #[error("version negotiation failed")]
    VersionMismatch,
}
