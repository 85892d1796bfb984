//! Per-connection RPC services exposing the local backend over the socket.

mod messages;
mod profiles;
mod rooms;

pub use messages::MessagesService;
pub use profiles::ProfilesService;
pub use rooms::RoomsService;

use serde::de::DeserializeOwned;
use serde_json::Value;
use uuid::Uuid;

use deskchat_protocol::{error_codes, Profile, Response, RoomId};

use crate::backend::ChatBackend;
use crate::error::{BackendError, ChatError};

fn parse_params<T: DeserializeOwned>(id: Uuid, params: Option<Value>) -> Result<T, Response> {
    let Some(params) = params else {
        return Err(Response::error(id, error_codes::INVALID_PARAMS, "missing params"));
    };
    serde_json::from_value(params).map_err(|e| {
        Response::error(id, error_codes::INVALID_PARAMS, format!("invalid params: {e}"))
    })
}

pub(crate) fn backend_error(id: Uuid, e: &BackendError) -> Response {
    let code = match e {
        BackendError::NotFound(_) => error_codes::NOT_FOUND,
        BackendError::PermissionDenied(_) => error_codes::FORBIDDEN,
        _ => error_codes::INTERNAL_ERROR,
    };
    Response::error(id, code, e.to_string())
}

fn chat_error(id: Uuid, e: &ChatError) -> Response {
    match e {
        ChatError::RoomResolutionFailed { source, .. } => backend_error(id, source),
        ChatError::EmptyMessage | ChatError::MessageTooLong { .. } => {
            Response::error(id, error_codes::INVALID_PARAMS, e.to_string())
        }
        ChatError::Forbidden(_) => Response::error(id, error_codes::FORBIDDEN, e.to_string()),
        _ => Response::error(id, error_codes::INTERNAL_ERROR, e.to_string()),
    }
}

/// The broadcast room is open to everyone; other rooms need an active
/// membership.
pub(crate) async fn check_room_access(
    backend: &dyn ChatBackend,
    caller: &Profile,
    room_id: RoomId,
) -> Result<(), BackendError> {
    if room_id == RoomId::BROADCAST {
        return Ok(());
    }
    let members = backend.room_members(room_id).await?;
    if members.is_empty() {
        return Err(BackendError::NotFound(format!("room {room_id}")));
    }
    if members
        .iter()
        .any(|m| m.active && m.user_id == caller.user_id)
    {
        Ok(())
    } else {
        Err(BackendError::PermissionDenied(format!(
            "{} is not a member of room {room_id}",
            caller.user_id
        )))
    }
}
