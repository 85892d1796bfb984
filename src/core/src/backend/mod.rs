mod local;

pub use local::LocalBackend;

use std::future::Future;
use std::pin::Pin;

use futures::stream::{BoxStream, Stream, StreamExt};

use deskchat_protocol::{
    ChatMessage, MessageChange, MessageDraft, MessageId, Membership, Profile, Room, RoomContext,
    RoomId, UserId,
};

use crate::error::BackendError;

/// Boxed future returned by [`ChatBackend`] methods.
pub type BackendFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, BackendError>> + Send + 'a>>;

/// Look up or create the room for a context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomRequest {
    pub context: RoomContext,
    /// Users who must hold a membership once the call returns.
    pub members: Vec<UserId>,
    pub name: Option<String>,
}

/// Data, auth-adjacent and realtime operations the messaging core needs
/// from the outside world.
///
/// Object-safe so the core can hold an `Arc<dyn ChatBackend>`; a local
/// SQLite implementation and test fakes both plug in here.
pub trait ChatBackend: Send + Sync + 'static {
    fn get_profile(&self, user_id: &UserId) -> BackendFuture<'_, Profile>;

    /// Atomic get-or-create. Two calls with equivalent contexts return the
    /// same room, including when they race.
    fn get_or_create_room(&self, request: RoomRequest) -> BackendFuture<'_, Room>;

    fn room_members(&self, room_id: RoomId) -> BackendFuture<'_, Vec<Membership>>;

    fn rooms_for_user(&self, user_id: &UserId) -> BackendFuture<'_, Vec<Room>>;

    /// Soft-deactivate a membership. The row and the user's messages stay;
    /// returns `false` when there was no active membership to end.
    fn leave_room(&self, room_id: RoomId, user_id: &UserId) -> BackendFuture<'_, bool>;

    /// The newest `limit` messages, oldest first.
    fn recent_messages(&self, room_id: RoomId, limit: usize)
        -> BackendFuture<'_, Vec<ChatMessage>>;

    /// Persist a message and return the authoritative row.
    fn insert_message(&self, draft: MessageDraft) -> BackendFuture<'_, ChatMessage>;

    /// Remove every message in a room. Callers check the role first.
    fn purge_messages(&self, room_id: RoomId) -> BackendFuture<'_, Vec<MessageId>>;

    /// Open a push channel carrying message changes for one room.
    fn subscribe(&self, room_id: RoomId) -> BackendFuture<'_, PushChannel>;
}

/// A live stream of [`MessageChange`]s for one room.
///
/// The stream ending means the channel dropped. [`PushChannel::close`]
/// releases the backend side before returning; dropping the channel does
/// the same.
pub struct PushChannel {
    room_id: RoomId,
    events: BoxStream<'static, MessageChange>,
    on_close: Option<Box<dyn FnOnce() + Send>>,
}

impl PushChannel {
    pub fn new(room_id: RoomId, events: impl Stream<Item = MessageChange> + Send + 'static) -> Self {
        Self {
            room_id,
            events: events.boxed(),
            on_close: None,
        }
    }

    /// Run `hook` exactly once when the channel is closed or dropped.
    pub fn with_close_hook(mut self, hook: impl FnOnce() + Send + 'static) -> Self {
        self.on_close = Some(Box::new(hook));
        self
    }

    pub fn room_id(&self) -> RoomId {
        self.room_id
    }

    /// Next change, or `None` once the channel has dropped.
    pub async fn next_change(&mut self) -> Option<MessageChange> {
        self.events.next().await
    }

    pub fn close(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if let Some(hook) = self.on_close.take() {
            hook();
        }
    }
}

impl Drop for PushChannel {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for PushChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PushChannel")
            .field("room_id", &self.room_id)
            .field("open", &self.on_close.is_some())
            .finish()
    }
}
