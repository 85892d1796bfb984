use std::sync::{Arc, Mutex};

use tokio::sync::broadcast::{self, error::RecvError};
use uuid::Uuid;

use deskchat_protocol::{
    ChatMessage, MessageChange, MessageDraft, MessageId, Membership, Profile, Room, RoomId, UserId,
};

use super::{BackendFuture, ChatBackend, PushChannel, RoomRequest};
use crate::error::BackendError;
use crate::storage::Store;

/// In-process backend: a [`Store`] plus a push hub.
///
/// Every successful write is published on a tokio broadcast channel;
/// each [`PushChannel`] filters the hub down to its own room. A receiver
/// that lags or sees the hub close ends its stream, which subscribers
/// observe as an unexpected drop.
#[derive(Clone)]
pub struct LocalBackend {
    store: Arc<dyn Store>,
    hub: broadcast::Sender<MessageChange>,
    channels: Arc<Mutex<Vec<(Uuid, RoomId)>>>,
}

impl LocalBackend {
    pub fn new(store: Arc<dyn Store>, capacity: usize) -> Self {
        let (hub, _) = broadcast::channel(capacity.max(1));
        Self {
            store,
            hub,
            channels: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    /// Rooms with an open push channel, one entry per channel.
    pub fn active_channels(&self) -> Vec<RoomId> {
        match self.channels.lock() {
            Ok(channels) => channels.iter().map(|(_, room)| *room).collect(),
            Err(_) => Vec::new(),
        }
    }

    /// Raw feed of every change in every room.
    pub fn changes(&self) -> broadcast::Receiver<MessageChange> {
        self.hub.subscribe()
    }

    fn publish(&self, change: MessageChange) {
        // No receivers is not an error: nobody is watching this room.
        let delivered = self.hub.send(change).unwrap_or(0);
        tracing::trace!(delivered, "published message change");
    }

    fn open_channel(&self, room_id: RoomId) -> PushChannel {
        let rx = self.changes();
        let events = futures::stream::unfold(rx, move |mut rx| async move {
            loop {
                match rx.recv().await {
                    Ok(change) if change.room_id() == room_id => return Some((change, rx)),
                    Ok(_) => continue,
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!(%room_id, skipped, "push channel lagged; dropping it");
                        return None;
                    }
                    Err(RecvError::Closed) => return None,
                }
            }
        });

        let channel_id = Uuid::new_v4();
        if let Ok(mut channels) = self.channels.lock() {
            channels.push((channel_id, room_id));
        }
        let channels = self.channels.clone();
        PushChannel::new(room_id, events).with_close_hook(move || {
            if let Ok(mut channels) = channels.lock() {
                channels.retain(|(id, _)| *id != channel_id);
            }
            tracing::debug!(%room_id, %channel_id, "push channel released");
        })
    }
}

fn storage(e: String) -> BackendError {
    BackendError::Storage(e)
}

impl ChatBackend for LocalBackend {
    fn get_profile(&self, user_id: &UserId) -> BackendFuture<'_, Profile> {
        let user_id = user_id.clone();
        Box::pin(async move {
            self.store
                .get_profile(&user_id)
                .map_err(storage)?
                .ok_or_else(|| BackendError::NotFound(format!("profile {user_id}")))
        })
    }

    fn get_or_create_room(&self, request: RoomRequest) -> BackendFuture<'_, Room> {
        Box::pin(async move {
            let key = request.context.key();
            let (room, created) = self
                .store
                .get_or_create_room(
                    request.context.kind(),
                    &key,
                    request.name.as_deref(),
                    &request.members,
                )
                .map_err(storage)?;
            if created {
                tracing::info!(room_id = %room.room_id, context = %key, "room created");
            }
            Ok(room)
        })
    }

    fn room_members(&self, room_id: RoomId) -> BackendFuture<'_, Vec<Membership>> {
        Box::pin(async move { self.store.list_members(room_id).map_err(storage) })
    }

    fn rooms_for_user(&self, user_id: &UserId) -> BackendFuture<'_, Vec<Room>> {
        let user_id = user_id.clone();
        Box::pin(async move { self.store.rooms_for_user(&user_id).map_err(storage) })
    }

    fn leave_room(&self, room_id: RoomId, user_id: &UserId) -> BackendFuture<'_, bool> {
        let user_id = user_id.clone();
        Box::pin(async move {
            let left = self
                .store
                .deactivate_member(room_id, &user_id)
                .map_err(storage)?;
            if left {
                tracing::info!(%room_id, %user_id, "member left room");
            }
            Ok(left)
        })
    }

    fn recent_messages(
        &self,
        room_id: RoomId,
        limit: usize,
    ) -> BackendFuture<'_, Vec<ChatMessage>> {
        Box::pin(async move { self.store.recent_messages(room_id, limit).map_err(storage) })
    }

    fn insert_message(&self, draft: MessageDraft) -> BackendFuture<'_, ChatMessage> {
        Box::pin(async move {
            let message = self.store.insert_message(&draft).map_err(storage)?;
            self.publish(MessageChange::Insert {
                message: message.clone(),
            });
            Ok(message)
        })
    }

    fn purge_messages(&self, room_id: RoomId) -> BackendFuture<'_, Vec<MessageId>> {
        Box::pin(async move {
            let message_ids = self.store.purge_messages(room_id).map_err(storage)?;
            tracing::info!(%room_id, removed = message_ids.len(), "room history purged");
            if !message_ids.is_empty() {
                self.publish(MessageChange::Delete {
                    room_id,
                    message_ids: message_ids.clone(),
                });
            }
            Ok(message_ids)
        })
    }

    fn subscribe(&self, room_id: RoomId) -> BackendFuture<'_, PushChannel> {
        Box::pin(async move {
            if self.store.get_room(room_id).map_err(storage)?.is_none() {
                return Err(BackendError::NotFound(format!("room {room_id}")));
            }
            Ok(self.open_channel(room_id))
        })
    }
}
