use std::path::Path;
use std::str::FromStr;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension};

use deskchat_protocol::{
    Attachment, ChatMessage, MessageDraft, MessageId, Membership, Profile, Room, RoomId, RoomKind,
    UserId, UserRole,
};

use super::Store;

/// SQLite-backed store for profiles, rooms, memberships and messages.
///
/// Uses a `Mutex<Connection>` for interior mutability. The schema is
/// created on `open()` and the broadcast room is seeded with its
/// well-known id.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

#[derive(Debug, thiserror::Error)]
#[error("unknown label: {0}")]
struct UnknownLabel(String);

impl SqliteStore {
    pub fn open(path: &Path) -> Result<Self, String> {
        let conn = Connection::open(path).map_err(|e| format!("sqlite open: {e}"))?;
        Self::with_connection(conn)
    }

    /// In-memory database (tests, demos).
    pub fn open_memory() -> Result<Self, String> {
        let conn = Connection::open_in_memory().map_err(|e| format!("sqlite open: {e}"))?;
        Self::with_connection(conn)
    }

    fn with_connection(conn: Connection) -> Result<Self, String> {
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.migrate()?;
        Ok(store)
    }

    fn migrate(&self) -> Result<(), String> {
        let conn = self.conn.lock().map_err(|e| format!("lock: {e}"))?;

        conn.execute_batch(
            "
            PRAGMA foreign_keys = ON;

            CREATE TABLE IF NOT EXISTS profiles (
                user_id    TEXT PRIMARY KEY,
                full_name  TEXT NOT NULL,
                role       TEXT NOT NULL DEFAULT 'user'
            );

            CREATE TABLE IF NOT EXISTS rooms (
                room_id        TEXT PRIMARY KEY,
                kind           TEXT NOT NULL,
                context_key    TEXT NOT NULL UNIQUE,
                name           TEXT,
                created_at_us  INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS memberships (
                room_id  TEXT NOT NULL REFERENCES rooms(room_id),
                user_id  TEXT NOT NULL,
                active   INTEGER NOT NULL DEFAULT 1,
                PRIMARY KEY (room_id, user_id)
            );

            CREATE TABLE IF NOT EXISTS messages (
                message_id     TEXT PRIMARY KEY,
                room_id        TEXT NOT NULL REFERENCES rooms(room_id),
                sender_id      TEXT NOT NULL,
                body           TEXT NOT NULL,
                created_at_us  INTEGER NOT NULL,
                attachments    TEXT NOT NULL DEFAULT '[]',
                client_ref     TEXT
            );

            CREATE INDEX IF NOT EXISTS messages_room_order
                ON messages (room_id, created_at_us, message_id);
            ",
        )
        .map_err(|e| format!("migrate: {e}"))?;

        conn.execute(
            "INSERT INTO rooms (room_id, kind, context_key, name, created_at_us)
             VALUES (?1, 'broadcast', 'broadcast', NULL, ?2)
             ON CONFLICT DO NOTHING",
            params![RoomId::BROADCAST.to_string(), Utc::now().timestamp_micros()],
        )
        .map_err(|e| format!("seed broadcast room: {e}"))?;

        Ok(())
    }
}

const ROOM_COLUMNS: &str = "room_id, kind, context_key, name, created_at_us";
const MESSAGE_COLUMNS: &str =
    "message_id, room_id, sender_id, body, created_at_us, attachments, client_ref";

fn conversion_err(
    idx: usize,
    err: impl std::error::Error + Send + Sync + 'static,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(err))
}

fn parse_id<T>(idx: usize, raw: &str) -> rusqlite::Result<T>
where
    T: FromStr<Err = uuid::Error>,
{
    raw.parse().map_err(|e| conversion_err(idx, e))
}

fn timestamp(idx: usize, micros: i64) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp_micros(micros)
        .ok_or_else(|| conversion_err(idx, UnknownLabel(format!("timestamp {micros}"))))
}

fn room_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Room> {
    let room_id: String = row.get(0)?;
    let kind: String = row.get(1)?;
    Ok(Room {
        room_id: parse_id(0, &room_id)?,
        kind: RoomKind::from_label(&kind).ok_or_else(|| conversion_err(1, UnknownLabel(kind)))?,
        context_key: row.get(2)?,
        name: row.get(3)?,
        created_at: timestamp(4, row.get(4)?)?,
    })
}

fn message_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ChatMessage> {
    let message_id: String = row.get(0)?;
    let room_id: String = row.get(1)?;
    let attachments: String = row.get(5)?;
    let client_ref: Option<String> = row.get(6)?;
    Ok(ChatMessage {
        message_id: parse_id(0, &message_id)?,
        room_id: parse_id(1, &room_id)?,
        sender_id: UserId(row.get(2)?),
        body: row.get(3)?,
        created_at: timestamp(4, row.get(4)?)?,
        attachments: serde_json::from_str::<Vec<Attachment>>(&attachments)
            .map_err(|e| conversion_err(5, e))?,
        client_ref: client_ref.map(|r| parse_id(6, &r)).transpose()?,
    })
}

impl Store for SqliteStore {
    fn upsert_profile(&self, profile: &Profile) -> Result<(), String> {
        let conn = self.conn.lock().map_err(|e| format!("lock: {e}"))?;
        conn.execute(
            "INSERT INTO profiles (user_id, full_name, role)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(user_id) DO UPDATE SET
                full_name = excluded.full_name,
                role = excluded.role",
            params![profile.user_id.as_str(), profile.full_name, profile.role.as_str()],
        )
        .map_err(|e| format!("upsert_profile: {e}"))?;
        Ok(())
    }

    fn get_profile(&self, user_id: &UserId) -> Result<Option<Profile>, String> {
        let conn = self.conn.lock().map_err(|e| format!("lock: {e}"))?;
        conn.query_row(
            "SELECT user_id, full_name, role FROM profiles WHERE user_id = ?1",
            params![user_id.as_str()],
            |row| {
                Ok(Profile {
                    user_id: UserId(row.get(0)?),
                    full_name: row.get(1)?,
                    role: UserRole::from_label(&row.get::<_, String>(2)?),
                })
            },
        )
        .optional()
        .map_err(|e| format!("get_profile: {e}"))
    }

    fn get_or_create_room(
        &self,
        kind: RoomKind,
        context_key: &str,
        name: Option<&str>,
        members: &[UserId],
    ) -> Result<(Room, bool), String> {
        let mut conn = self.conn.lock().map_err(|e| format!("lock: {e}"))?;
        let tx = conn
            .transaction()
            .map_err(|e| format!("get_or_create_room begin: {e}"))?;

        let inserted = tx
            .execute(
                "INSERT INTO rooms (room_id, kind, context_key, name, created_at_us)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(context_key) DO NOTHING",
                params![
                    RoomId::new().to_string(),
                    kind.as_str(),
                    context_key,
                    name,
                    Utc::now().timestamp_micros(),
                ],
            )
            .map_err(|e| format!("get_or_create_room insert: {e}"))?;

        let room = tx
            .query_row(
                &format!("SELECT {ROOM_COLUMNS} FROM rooms WHERE context_key = ?1"),
                params![context_key],
                room_from_row,
            )
            .map_err(|e| format!("get_or_create_room select: {e}"))?;

        if room.kind != kind {
            return Err(format!(
                "get_or_create_room: key {context_key} belongs to a {} room",
                room.kind.as_str()
            ));
        }

        for member in members {
            tx.execute(
                "INSERT INTO memberships (room_id, user_id, active)
                 VALUES (?1, ?2, 1)
                 ON CONFLICT(room_id, user_id) DO UPDATE SET active = 1",
                params![room.room_id.to_string(), member.as_str()],
            )
            .map_err(|e| format!("get_or_create_room membership: {e}"))?;
        }

        tx.commit()
            .map_err(|e| format!("get_or_create_room commit: {e}"))?;
        Ok((room, inserted == 1))
    }

    fn get_room(&self, room_id: RoomId) -> Result<Option<Room>, String> {
        let conn = self.conn.lock().map_err(|e| format!("lock: {e}"))?;
        conn.query_row(
            &format!("SELECT {ROOM_COLUMNS} FROM rooms WHERE room_id = ?1"),
            params![room_id.to_string()],
            room_from_row,
        )
        .optional()
        .map_err(|e| format!("get_room: {e}"))
    }

    fn list_members(&self, room_id: RoomId) -> Result<Vec<Membership>, String> {
        let conn = self.conn.lock().map_err(|e| format!("lock: {e}"))?;
        let mut stmt = conn
            .prepare(
                "SELECT user_id, active FROM memberships
                 WHERE room_id = ?1 ORDER BY user_id",
            )
            .map_err(|e| format!("list_members prepare: {e}"))?;

        let rows = stmt
            .query_map(params![room_id.to_string()], |row| {
                Ok(Membership {
                    room_id,
                    user_id: UserId(row.get(0)?),
                    active: row.get::<_, i64>(1)? != 0,
                })
            })
            .map_err(|e| format!("list_members query: {e}"))?;

        rows.collect::<Result<Vec<_>, _>>()
            .map_err(|e| format!("list_members collect: {e}"))
    }

    fn deactivate_member(&self, room_id: RoomId, user_id: &UserId) -> Result<bool, String> {
        let conn = self.conn.lock().map_err(|e| format!("lock: {e}"))?;
        let changed = conn
            .execute(
                "UPDATE memberships SET active = 0
                 WHERE room_id = ?1 AND user_id = ?2 AND active = 1",
                params![room_id.to_string(), user_id.as_str()],
            )
            .map_err(|e| format!("deactivate_member: {e}"))?;
        Ok(changed == 1)
    }

    fn rooms_for_user(&self, user_id: &UserId) -> Result<Vec<Room>, String> {
        let conn = self.conn.lock().map_err(|e| format!("lock: {e}"))?;
        let mut stmt = conn
            .prepare(
                "SELECT r.room_id, r.kind, r.context_key, r.name, r.created_at_us
                 FROM rooms r JOIN memberships m ON m.room_id = r.room_id
                 WHERE m.user_id = ?1 AND m.active = 1
                 ORDER BY r.created_at_us DESC",
            )
            .map_err(|e| format!("rooms_for_user prepare: {e}"))?;

        let rows = stmt
            .query_map(params![user_id.as_str()], room_from_row)
            .map_err(|e| format!("rooms_for_user query: {e}"))?;

        rows.collect::<Result<Vec<_>, _>>()
            .map_err(|e| format!("rooms_for_user collect: {e}"))
    }

    fn insert_message(&self, draft: &MessageDraft) -> Result<ChatMessage, String> {
        let mut conn = self.conn.lock().map_err(|e| format!("lock: {e}"))?;
        let tx = conn
            .transaction()
            .map_err(|e| format!("insert_message begin: {e}"))?;

        // Timestamps within a room never go backwards, even if the wall
        // clock does.
        let last: Option<i64> = tx
            .query_row(
                "SELECT MAX(created_at_us) FROM messages WHERE room_id = ?1",
                params![draft.room_id.to_string()],
                |row| row.get(0),
            )
            .map_err(|e| format!("insert_message last: {e}"))?;
        let now = Utc::now().timestamp_micros();
        let created_us = match last {
            Some(last) if last >= now => last + 1,
            _ => now,
        };

        let attachments =
            serde_json::to_string(&draft.attachments).map_err(|e| format!("insert_message: {e}"))?;
        let message = ChatMessage {
            message_id: MessageId::new(),
            room_id: draft.room_id,
            sender_id: draft.sender_id.clone(),
            body: draft.body.clone(),
            created_at: DateTime::<Utc>::from_timestamp_micros(created_us)
                .ok_or_else(|| format!("insert_message: bad timestamp {created_us}"))?,
            attachments: draft.attachments.clone(),
            client_ref: draft.client_ref,
        };

        tx.execute(
            &format!("INSERT INTO messages ({MESSAGE_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)"),
            params![
                message.message_id.to_string(),
                message.room_id.to_string(),
                message.sender_id.as_str(),
                message.body,
                created_us,
                attachments,
                message.client_ref.map(|r| r.to_string()),
            ],
        )
        .map_err(|e| format!("insert_message: {e}"))?;

        tx.commit().map_err(|e| format!("insert_message commit: {e}"))?;
        Ok(message)
    }

    fn recent_messages(&self, room_id: RoomId, limit: usize) -> Result<Vec<ChatMessage>, String> {
        let conn = self.conn.lock().map_err(|e| format!("lock: {e}"))?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {MESSAGE_COLUMNS} FROM messages
                 WHERE room_id = ?1
                 ORDER BY created_at_us DESC, message_id DESC
                 LIMIT ?2"
            ))
            .map_err(|e| format!("recent_messages prepare: {e}"))?;

        let rows = stmt
            .query_map(
                params![room_id.to_string(), i64::try_from(limit).unwrap_or(i64::MAX)],
                message_from_row,
            )
            .map_err(|e| format!("recent_messages query: {e}"))?;

        let mut messages = rows
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| format!("recent_messages collect: {e}"))?;
        messages.reverse();
        Ok(messages)
    }

    fn purge_messages(&self, room_id: RoomId) -> Result<Vec<MessageId>, String> {
        let mut conn = self.conn.lock().map_err(|e| format!("lock: {e}"))?;
        let tx = conn
            .transaction()
            .map_err(|e| format!("purge_messages begin: {e}"))?;

        let ids = {
            let mut stmt = tx
                .prepare(
                    "SELECT message_id FROM messages WHERE room_id = ?1
                     ORDER BY created_at_us, message_id",
                )
                .map_err(|e| format!("purge_messages prepare: {e}"))?;
            let rows = stmt
                .query_map(params![room_id.to_string()], |row| {
                    let raw: String = row.get(0)?;
                    parse_id::<MessageId>(0, &raw)
                })
                .map_err(|e| format!("purge_messages query: {e}"))?;
            rows.collect::<Result<Vec<_>, _>>()
                .map_err(|e| format!("purge_messages collect: {e}"))?
        };

        tx.execute(
            "DELETE FROM messages WHERE room_id = ?1",
            params![room_id.to_string()],
        )
        .map_err(|e| format!("purge_messages delete: {e}"))?;
        tx.commit().map_err(|e| format!("purge_messages commit: {e}"))?;
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use deskchat_protocol::{RoomContext, TempId};

    fn make_store() -> SqliteStore {
        SqliteStore::open_memory().unwrap()
    }

    fn user(id: &str) -> UserId {
        UserId::new(id)
    }

    fn draft(room_id: RoomId, body: &str) -> MessageDraft {
        MessageDraft {
            room_id,
            sender_id: user("alice"),
            body: body.into(),
            attachments: vec![],
            client_ref: None,
        }
    }

    fn ticket_room(store: &SqliteStore, ticket: &str) -> Room {
        let ctx = RoomContext::ticket(ticket);
        store
            .get_or_create_room(ctx.kind(), &ctx.key(), None, &[user("alice")])
            .unwrap()
            .0
    }

    #[test]
    fn broadcast_room_is_seeded() {
        let store = make_store();
        let room = store.get_room(RoomId::BROADCAST).unwrap().unwrap();
        assert_eq!(room.kind, RoomKind::Broadcast);
        assert_eq!(room.context_key, "broadcast");
    }

    #[test]
    fn upsert_and_get_profile() {
        let store = make_store();
        let mut profile = Profile {
            user_id: user("u1"),
            full_name: "Ada".into(),
            role: UserRole::Agent,
        };
        store.upsert_profile(&profile).unwrap();
        profile.role = UserRole::Admin;
        store.upsert_profile(&profile).unwrap();

        let loaded = store.get_profile(&user("u1")).unwrap().unwrap();
        assert_eq!(loaded, profile);
        assert!(store.get_profile(&user("nobody")).unwrap().is_none());
    }

    #[test]
    fn get_or_create_is_idempotent_for_direct_pairs() {
        let store = make_store();
        let ab = RoomContext::direct(user("alice"), user("bob"));
        let ba = RoomContext::direct(user("bob"), user("alice"));

        let (first, created) = store
            .get_or_create_room(ab.kind(), &ab.key(), None, &ab.participants())
            .unwrap();
        assert!(created);
        let (second, created) = store
            .get_or_create_room(ba.kind(), &ba.key(), None, &ba.participants())
            .unwrap();
        assert!(!created);
        assert_eq!(first.room_id, second.room_id);

        let members = store.list_members(first.room_id).unwrap();
        assert_eq!(members.len(), 2);
        assert!(members.iter().all(|m| m.active));
    }

    #[test]
    fn concurrent_creation_yields_one_room() {
        let store = Arc::new(make_store());
        let ctx = RoomContext::ticket("T-9");
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let store = store.clone();
                let ctx = ctx.clone();
                std::thread::spawn(move || {
                    store
                        .get_or_create_room(
                            ctx.kind(),
                            &ctx.key(),
                            None,
                            &[UserId::new(format!("viewer-{i}"))],
                        )
                        .unwrap()
                        .0
                        .room_id
                })
            })
            .collect();
        let ids: Vec<RoomId> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert!(ids.windows(2).all(|w| w[0] == w[1]));
        assert_eq!(store.list_members(ids[0]).unwrap().len(), 8);
    }

    #[test]
    fn kind_mismatch_on_existing_key_is_rejected() {
        let store = make_store();
        let err = store
            .get_or_create_room(RoomKind::Ticket, "broadcast", None, &[])
            .unwrap_err();
        assert!(err.contains("broadcast room"));
    }

    #[test]
    fn deactivated_member_is_kept_but_inactive() {
        let store = make_store();
        let room = ticket_room(&store, "T-1");
        assert!(store.deactivate_member(room.room_id, &user("alice")).unwrap());
        assert!(!store.deactivate_member(room.room_id, &user("alice")).unwrap());

        let members = store.list_members(room.room_id).unwrap();
        assert_eq!(members.len(), 1);
        assert!(!members[0].active);
        assert!(store.rooms_for_user(&user("alice")).unwrap().is_empty());
    }

    #[test]
    fn rejoining_reactivates_without_duplicating() {
        let store = make_store();
        let room = ticket_room(&store, "T-1");
        store.deactivate_member(room.room_id, &user("alice")).unwrap();

        let again = ticket_room(&store, "T-1");
        assert_eq!(again.room_id, room.room_id);
        let members = store.list_members(room.room_id).unwrap();
        assert_eq!(members.len(), 1);
        assert!(members[0].active);
        assert_eq!(store.rooms_for_user(&user("alice")).unwrap().len(), 1);
    }

    #[test]
    fn oversized_limit_returns_everything() {
        let store = make_store();
        let room = ticket_room(&store, "T-3");
        for body in ["a", "b", "c"] {
            store.insert_message(&draft(room.room_id, body)).unwrap();
        }
        let all = store.recent_messages(room.room_id, usize::MAX).unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].body, "a");
    }

    #[test]
    fn insert_assigns_id_and_monotonic_time() {
        let store = make_store();
        let room = ticket_room(&store, "T-2");
        let temp = TempId::new();
        let mut first_draft = draft(room.room_id, "one");
        first_draft.client_ref = Some(temp);

        let first = store.insert_message(&first_draft).unwrap();
        let second = store.insert_message(&draft(room.room_id, "two")).unwrap();

        assert_ne!(first.message_id, second.message_id);
        assert!(second.order_key() > first.order_key());
        assert_eq!(first.client_ref, Some(temp));
    }

    #[test]
    fn insert_into_unknown_room_fails() {
        let store = make_store();
        assert!(store.insert_message(&draft(RoomId::new(), "lost")).is_err());
    }

    #[test]
    fn recent_messages_returns_newest_window_ascending() {
        let store = make_store();
        let room = ticket_room(&store, "T-3");
        for i in 0..5 {
            store.insert_message(&draft(room.room_id, &format!("m{i}"))).unwrap();
        }
        let recent = store.recent_messages(room.room_id, 3).unwrap();
        let bodies: Vec<_> = recent.iter().map(|m| m.body.as_str()).collect();
        assert_eq!(bodies, vec!["m2", "m3", "m4"]);
    }

    #[test]
    fn attachments_survive_storage() {
        let store = make_store();
        let room = ticket_room(&store, "T-4");
        let mut with_file = draft(room.room_id, "see log");
        with_file.attachments = vec![Attachment {
            name: "log.txt".into(),
            url: "https://files.example/log.txt".into(),
            content_type: Some("text/plain".into()),
        }];
        store.insert_message(&with_file).unwrap();
        let loaded = store.recent_messages(room.room_id, 10).unwrap();
        assert_eq!(loaded[0].attachments, with_file.attachments);
    }

    #[test]
    fn purge_removes_only_that_room() {
        let store = make_store();
        let other = ticket_room(&store, "T-5");
        let a = store.insert_message(&draft(RoomId::BROADCAST, "a")).unwrap();
        let b = store.insert_message(&draft(RoomId::BROADCAST, "b")).unwrap();
        store.insert_message(&draft(other.room_id, "keep")).unwrap();

        let removed = store.purge_messages(RoomId::BROADCAST).unwrap();
        assert_eq!(removed, vec![a.message_id, b.message_id]);
        assert!(store.recent_messages(RoomId::BROADCAST, 10).unwrap().is_empty());
        assert_eq!(store.recent_messages(other.room_id, 10).unwrap().len(), 1);
    }

    #[test]
    fn rooms_for_user_lists_active_memberships() {
        let store = make_store();
        let ctx = RoomContext::direct(user("alice"), user("carol"));
        store
            .get_or_create_room(ctx.kind(), &ctx.key(), None, &ctx.participants())
            .unwrap();
        ticket_room(&store, "T-6");

        let rooms = store.rooms_for_user(&user("alice")).unwrap();
        assert_eq!(rooms.len(), 2);
        assert_eq!(store.rooms_for_user(&user("carol")).unwrap().len(), 1);
    }
}
