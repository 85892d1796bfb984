use deskchat_protocol::{RoomId, TempId, UserId};
use thiserror::Error;

/// Failure reported by a [`ChatBackend`](crate::backend::ChatBackend) call.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BackendError {
    #[error("backend unavailable: {0}")]
    Unavailable(String),

    #[error("backend call timed out")]
    Timeout,

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("storage error: {0}")]
    Storage(String),
}

/// Errors surfaced by the messaging core to a chat surface.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ChatError {
    /// The room for a context could not be looked up or created. No
    /// subscription is opened without a resolved room.
    #[error("could not open chat ({context}): {source}")]
    RoomResolutionFailed {
        context: String,
        #[source]
        source: BackendError,
    },

    /// The write for a message failed. The optimistic entry is gone; `body`
    /// is handed back so the input can be restored.
    #[error("message not sent: {reason}")]
    SendFailed {
        temp_id: TempId,
        body: String,
        reason: BackendError,
    },

    /// The push channel could not be established, or dropped and could not be
    /// re-established, within the configured attempts.
    #[error("live updates unavailable for room {room_id} after {attempts} attempt(s): {reason}")]
    SubscriptionDegraded {
        room_id: RoomId,
        attempts: u32,
        reason: BackendError,
    },

    /// Non-fatal; callers fall back to a placeholder identity.
    #[error("profile lookup failed for {user_id}: {reason}")]
    IdentityLookupFailed {
        user_id: UserId,
        reason: BackendError,
    },

    #[error("message is empty")]
    EmptyMessage,

    #[error("message is {len} characters, limit is {max}")]
    MessageTooLong { len: usize, max: usize },

    #[error("no chat room is open")]
    NotOpen,

    #[error("forbidden: {0}")]
    Forbidden(String),

    /// The privileged purge of a room's history failed.
    #[error("could not clear history: {reason}")]
    ClearFailed { reason: BackendError },

    /// The room was closed locally but the membership could not be ended.
    #[error("could not leave room {room_id}: {reason}")]
    LeaveFailed { room_id: RoomId, reason: BackendError },
}

impl ChatError {
    /// Transient failures the user can retry from the surface.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::RoomResolutionFailed { .. }
                | Self::SendFailed { .. }
                | Self::SubscriptionDegraded { .. }
                | Self::ClearFailed { .. }
                | Self::LeaveFailed { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn send_failure_keeps_body() {
        let err = ChatError::SendFailed {
            temp_id: TempId::new(),
            body: "draft".into(),
            reason: BackendError::Timeout,
        };
        assert!(err.is_retryable());
        assert_eq!(err.to_string(), "message not sent: backend call timed out");
        match err {
            ChatError::SendFailed { body, .. } => assert_eq!(body, "draft"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn validation_errors_are_not_retryable() {
        assert!(!ChatError::EmptyMessage.is_retryable());
        assert!(!ChatError::MessageTooLong { len: 2000, max: 1000 }.is_retryable());
    }
}
