use std::sync::{Arc, Mutex};

use tokio::sync::watch;

use deskchat_protocol::{Attachment, ChatMessage, MessageDraft, RoomContext, RoomId, UserId};

use super::view::{ticket_title, DisplayMessage, Surface};
use super::Session;
use crate::backend::ChatBackend;
use crate::config::ChatConfig;
use crate::error::ChatError;
use crate::identity::{Identity, IdentityResolver};
use crate::message_store::{LogEntry, MessageStore, SharedLog};
use crate::rooms::{DirectRoom, ResolvedRoom, RoomResolver};
use crate::subscription::{ChannelState, SubscriptionManager};

#[derive(Debug, Clone)]
struct OpenRoom {
    room: ResolvedRoom,
    epoch: u64,
}

/// Drives one chat surface: resolves the room, loads history, keeps the
/// push channel open and runs optimistic sends.
///
/// All methods take `&self`. Sends may overlap each other and a room
/// switch; room transitions (`open`, `close`, `reconnect`) are serialized.
pub struct ChatController {
    session: Session,
    backend: Arc<dyn ChatBackend>,
    config: Arc<ChatConfig>,
    identities: IdentityResolver,
    rooms: RoomResolver,
    log: Arc<SharedLog>,
    subscription: SubscriptionManager,
    current: Mutex<Option<OpenRoom>>,
    transition: tokio::sync::Mutex<()>,
}

impl ChatController {
    pub fn new(backend: Arc<dyn ChatBackend>, config: Arc<ChatConfig>, session: Session) -> Self {
        let log = Arc::new(SharedLog::new());
        Self {
            identities: IdentityResolver::new(backend.clone(), config.identity_cache_ttl()),
            rooms: RoomResolver::new(backend.clone(), session.user_id.clone()),
            subscription: SubscriptionManager::new(backend.clone(), config.clone(), log.clone()),
            session,
            backend,
            config,
            log,
            current: Mutex::new(None),
            transition: tokio::sync::Mutex::new(()),
        }
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Resolve, load and subscribe, in that order.
    ///
    /// If the room resolves and history loads but the push channel cannot
    /// be established, the room stays open with its history and
    /// `SubscriptionDegraded` is returned; [`reconnect`](Self::reconnect)
    /// retries.
    pub async fn open(&self, surface: Surface) -> Result<RoomId, ChatError> {
        let _transition = self.transition.lock().await;
        self.teardown().await;

        let context = surface.context(&self.session.user_id);
        let room = self.rooms.resolve(&context).await?;
        let room_id = room.room_id;

        let history = self
            .backend
            .recent_messages(room_id, self.config.history_limit)
            .await
            .map_err(|source| ChatError::RoomResolutionFailed {
                context: context.key(),
                source,
            })?;
        let mut store = MessageStore::new(room_id);
        store.load(history);
        let epoch = self.log.reset(Some(store));
        self.set_current(Some(OpenRoom { room, epoch }));
        tracing::info!(%room_id, context = %context.key(), "chat opened");

        self.subscription.open(room_id, epoch).await?;
        self.catch_up(room_id, epoch).await;
        Ok(room_id)
    }

    /// Retry the push channel for the open room.
    pub async fn reconnect(&self) -> Result<(), ChatError> {
        let _transition = self.transition.lock().await;
        let open = self.current().ok_or(ChatError::NotOpen)?;
        let room_id = open.room.room_id;
        self.subscription.open(room_id, open.epoch).await?;
        self.catch_up(room_id, open.epoch).await;
        Ok(())
    }

    /// Leave the current room. Safe to call repeatedly.
    pub async fn close(&self) {
        let _transition = self.transition.lock().await;
        self.teardown().await;
    }

    /// Close the open room and end the caller's membership of it. Messages
    /// already sent keep their sender; resolving the room again rejoins.
    pub async fn leave(&self) -> Result<RoomId, ChatError> {
        let _transition = self.transition.lock().await;
        let open = self.current().ok_or(ChatError::NotOpen)?;
        if open.room.context == RoomContext::Broadcast {
            return Err(ChatError::Forbidden(
                "the broadcast room cannot be left".into(),
            ));
        }

        let room_id = open.room.room_id;
        self.teardown().await;
        let left = self
            .backend
            .leave_room(room_id, &self.session.user_id)
            .await
            .map_err(|reason| ChatError::LeaveFailed { room_id, reason })?;
        tracing::info!(%room_id, user_id = %self.session.user_id, left, "left room");
        Ok(room_id)
    }

    pub async fn send(&self, body: impl Into<String>) -> Result<ChatMessage, ChatError> {
        self.send_with_attachments(body, Vec::new()).await
    }

    /// Show the message at once, write it, then confirm or roll back.
    pub async fn send_with_attachments(
        &self,
        body: impl Into<String>,
        attachments: Vec<Attachment>,
    ) -> Result<ChatMessage, ChatError> {
        let body = body.into();
        if body.trim().is_empty() {
            return Err(ChatError::EmptyMessage);
        }
        let len = body.chars().count();
        if len > self.config.max_body_len {
            return Err(ChatError::MessageTooLong {
                len,
                max: self.config.max_body_len,
            });
        }

        let open = self.current().ok_or(ChatError::NotOpen)?;
        let room_id = open.room.room_id;
        let sender_id = self.session.user_id.clone();
        let temp_id = self
            .log
            .with_store(open.epoch, |store| {
                store.insert_optimistic(sender_id.clone(), body.clone(), attachments.clone())
            })
            .ok_or(ChatError::NotOpen)?;

        let draft = MessageDraft {
            room_id,
            sender_id,
            body: body.clone(),
            attachments,
            client_ref: Some(temp_id),
        };
        match self.backend.insert_message(draft).await {
            Ok(message) => {
                let outcome = self
                    .log
                    .with_store(open.epoch, |store| store.reconcile(temp_id, message.clone()));
                match outcome {
                    Some(outcome) => {
                        tracing::debug!(%room_id, %temp_id, message_id = %message.message_id, ?outcome, "send confirmed")
                    }
                    None => tracing::debug!(%room_id, %temp_id, "send confirmed after leaving room"),
                }
                Ok(message)
            }
            Err(reason) => {
                self.log
                    .with_store(open.epoch, |store| store.rollback(temp_id));
                tracing::warn!(%room_id, %temp_id, error = %reason, "send failed");
                Err(ChatError::SendFailed {
                    temp_id,
                    body,
                    reason,
                })
            }
        }
    }

    /// Purge the broadcast room. Admins only.
    pub async fn clear_history(&self) -> Result<usize, ChatError> {
        if !self.session.role.can_moderate() {
            return Err(ChatError::Forbidden(format!(
                "{} may not clear chat history",
                self.session.role.as_str()
            )));
        }
        let open = self.current().ok_or(ChatError::NotOpen)?;
        if open.room.context != RoomContext::Broadcast {
            return Err(ChatError::Forbidden(
                "only the broadcast room can be cleared".into(),
            ));
        }

        let room_id = open.room.room_id;
        let removed = self
            .backend
            .purge_messages(room_id)
            .await
            .map_err(|reason| ChatError::ClearFailed { reason })?;
        // Other subscribers get the same ids through the push channel.
        self.log
            .with_store(open.epoch, |store| store.apply_delete(&removed));
        tracing::info!(%room_id, removed = removed.len(), user_id = %self.session.user_id, "history cleared");
        Ok(removed.len())
    }

    /// Current log annotated with sender identities.
    pub async fn render(&self) -> Vec<DisplayMessage> {
        let entries = self.log.entries();
        let identities = self
            .identities
            .resolve_all(entries.iter().map(|e| &e.sender_id))
            .await;
        entries
            .into_iter()
            .map(|entry| {
                let sender = identities
                    .get(&entry.sender_id)
                    .cloned()
                    .unwrap_or_else(|| Identity::placeholder(entry.sender_id.clone()));
                DisplayMessage::new(entry, sender, &self.session.user_id)
            })
            .collect()
    }

    /// Heading for the open room.
    pub async fn room_title(&self) -> Option<String> {
        let open = self.current()?;
        let room = open.room;
        let title = match &room.context {
            RoomContext::Broadcast => room
                .name
                .unwrap_or_else(|| self.config.broadcast_room_name.clone()),
            RoomContext::Ticket { ticket_id } => {
                room.name.unwrap_or_else(|| ticket_title(ticket_id))
            }
            RoomContext::Direct { .. } => self.member_title(&room).await,
        };
        Some(title)
    }

    /// Two-party rooms show the other person; larger rooms their name.
    async fn member_title(&self, room: &ResolvedRoom) -> String {
        let others: Vec<UserId> = match self.backend.room_members(room.room_id).await {
            Ok(members) => members
                .into_iter()
                .filter(|m| m.active && m.user_id != self.session.user_id)
                .map(|m| m.user_id)
                .collect(),
            Err(e) => {
                tracing::warn!(room_id = %room.room_id, error = %e, "member lookup failed");
                room.context
                    .participants()
                    .into_iter()
                    .filter(|id| *id != self.session.user_id)
                    .collect()
            }
        };

        match (others.as_slice(), &room.name) {
            ([peer], _) => self.identities.identity(peer).await.full_name,
            ([], _) => self.identities.identity(&self.session.user_id).await.full_name,
            (_, Some(name)) => name.clone(),
            (_, None) => {
                let names = self.identities.resolve_all(others.iter()).await;
                let mut names: Vec<String> = names.into_values().map(|i| i.full_name).collect();
                names.sort();
                names.join(", ")
            }
        }
    }

    pub async fn direct_rooms(&self) -> Result<Vec<DirectRoom>, ChatError> {
        self.rooms.direct_rooms().await
    }

    pub fn room(&self) -> Option<ResolvedRoom> {
        self.current().map(|open| open.room)
    }

    pub fn entries(&self) -> Vec<LogEntry> {
        self.log.entries()
    }

    pub fn status(&self) -> ChannelState {
        self.subscription.state()
    }

    pub fn watch_status(&self) -> watch::Receiver<ChannelState> {
        self.subscription.watch_state()
    }

    /// Ticks whenever the visible log changes.
    pub fn watch_log(&self) -> watch::Receiver<u64> {
        self.log.watch()
    }

    fn current(&self) -> Option<OpenRoom> {
        self.current.lock().ok().and_then(|open| open.clone())
    }

    fn set_current(&self, open: Option<OpenRoom>) {
        if let Ok(mut current) = self.current.lock() {
            *current = open;
        }
    }

    async fn teardown(&self) {
        self.subscription.close().await;
        if let Some(open) = self.current() {
            tracing::info!(room_id = %open.room.room_id, "chat closed");
        }
        self.set_current(None);
        self.log.reset(None);
    }

    /// Merge anything sent between the history load and the channel open.
    async fn catch_up(&self, room_id: RoomId, epoch: u64) {
        match self
            .backend
            .recent_messages(room_id, self.config.history_limit)
            .await
        {
            Ok(messages) => {
                self.log.with_store(epoch, |store| store.merge_all(messages));
            }
            Err(e) => tracing::warn!(%room_id, error = %e, "catch-up fetch failed"),
        }
    }
}
