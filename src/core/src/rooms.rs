use std::sync::Arc;

use deskchat_protocol::{RoomContext, RoomId, RoomKind, UserId};

use crate::backend::{ChatBackend, RoomRequest};
use crate::error::{BackendError, ChatError};

/// Outcome of resolving a [`RoomContext`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedRoom {
    pub room_id: RoomId,
    pub context: RoomContext,
    /// Explicit room name, if the backend has one.
    pub name: Option<String>,
}

/// A direct conversation the caller takes part in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectRoom {
    pub room_id: RoomId,
    /// The other participant; the caller for a self-conversation.
    pub peer: UserId,
}

/// Maps a chat context to its room, creating the room on first use.
///
/// Uniqueness comes from the backend's get-or-create; nothing here locks.
pub struct RoomResolver {
    backend: Arc<dyn ChatBackend>,
    caller: UserId,
}

impl RoomResolver {
    pub fn new(backend: Arc<dyn ChatBackend>, caller: UserId) -> Self {
        Self { backend, caller }
    }

    pub fn caller(&self) -> &UserId {
        &self.caller
    }

    pub async fn resolve(&self, context: &RoomContext) -> Result<ResolvedRoom, ChatError> {
        let members = match context {
            // The broadcast room is seeded; no round trip.
            RoomContext::Broadcast => {
                return Ok(ResolvedRoom {
                    room_id: RoomId::BROADCAST,
                    context: RoomContext::Broadcast,
                    name: None,
                })
            }
            RoomContext::Ticket { .. } => vec![self.caller.clone()],
            RoomContext::Direct { .. } => {
                let participants = context.participants();
                if !participants.contains(&self.caller) {
                    return Err(ChatError::RoomResolutionFailed {
                        context: context.key(),
                        source: BackendError::PermissionDenied(format!(
                            "{} is not part of this conversation",
                            self.caller
                        )),
                    });
                }
                participants
            }
        };

        let room = self
            .backend
            .get_or_create_room(RoomRequest {
                context: context.clone(),
                members,
                name: None,
            })
            .await
            .map_err(|source| ChatError::RoomResolutionFailed {
                context: context.key(),
                source,
            })?;

        tracing::debug!(room_id = %room.room_id, context = %context.key(), "room resolved");
        Ok(ResolvedRoom {
            room_id: room.room_id,
            context: context.clone(),
            name: room.name,
        })
    }

    /// The caller's active direct conversations, newest first. Rooms whose
    /// peer has left are skipped.
    pub async fn direct_rooms(&self) -> Result<Vec<DirectRoom>, ChatError> {
        let failed = |source| ChatError::RoomResolutionFailed {
            context: format!("direct rooms of {}", self.caller),
            source,
        };
        let rooms = self
            .backend
            .rooms_for_user(&self.caller)
            .await
            .map_err(failed)?;

        let mut direct = Vec::new();
        for room in rooms.into_iter().filter(|r| r.kind == RoomKind::Direct) {
            let members = self
                .backend
                .room_members(room.room_id)
                .await
                .map_err(failed)?;
            let solo = members.iter().all(|m| m.user_id == self.caller);
            let peer = members
                .into_iter()
                .filter(|m| m.active)
                .map(|m| m.user_id)
                .find(|id| *id != self.caller);
            // A peer who left no longer counts as a counterpart.
            let peer = match peer {
                Some(peer) => peer,
                None if solo => self.caller.clone(),
                None => continue,
            };
            direct.push(DirectRoom {
                room_id: room.room_id,
                peer,
            });
        }
        Ok(direct)
    }
}
