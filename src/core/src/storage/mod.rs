mod sqlite;

pub use sqlite::SqliteStore;

use deskchat_protocol::{
    ChatMessage, MessageDraft, MessageId, Membership, Profile, Room, RoomId, RoomKind, UserId,
};

/// Persistence behind the local backend.
///
/// All methods use `&self`; implementations handle interior mutability.
/// Uniqueness of rooms per context key and of memberships per
/// `(room, user)` is enforced here, not by callers.
pub trait Store: Send + Sync + 'static {
    fn upsert_profile(&self, profile: &Profile) -> Result<(), String>;

    fn get_profile(&self, user_id: &UserId) -> Result<Option<Profile>, String>;

    /// Look up the room for `context_key`, creating it if absent, and make
    /// sure every listed member has a membership row. Returns the room and
    /// whether this call created it.
    fn get_or_create_room(
        &self,
        kind: RoomKind,
        context_key: &str,
        name: Option<&str>,
        members: &[UserId],
    ) -> Result<(Room, bool), String>;

    fn get_room(&self, room_id: RoomId) -> Result<Option<Room>, String>;

    /// All membership rows for a room, including deactivated ones.
    fn list_members(&self, room_id: RoomId) -> Result<Vec<Membership>, String>;

    /// Soft-remove a member. Returns false if there was no active row.
    fn deactivate_member(&self, room_id: RoomId, user_id: &UserId) -> Result<bool, String>;

    /// Rooms the user is an active member of, newest first.
    fn rooms_for_user(&self, user_id: &UserId) -> Result<Vec<Room>, String>;

    /// Persist a message; the store assigns `message_id` and `created_at`.
    fn insert_message(&self, draft: &MessageDraft) -> Result<ChatMessage, String>;

    /// Most recent `limit` messages, oldest first.
    fn recent_messages(&self, room_id: RoomId, limit: usize) -> Result<Vec<ChatMessage>, String>;

    /// Delete every message in a room. Returns the removed ids.
    fn purge_messages(&self, room_id: RoomId) -> Result<Vec<MessageId>, String>;
}
