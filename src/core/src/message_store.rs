use std::collections::HashSet;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use tokio::sync::watch;

use deskchat_protocol::{Attachment, ChatMessage, MessageId, RoomId, TempId, UserId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryStatus {
    /// Inserted locally, write not yet answered.
    Pending,
    Confirmed,
    /// The write failed; only seen on entries handed back by `rollback`.
    Failed,
}

/// One row of the visible log: a confirmed message or an optimistic one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    /// Set for entries this client sent, kept after confirmation.
    pub temp_id: Option<TempId>,
    /// Backend id; `None` while pending.
    pub message_id: Option<MessageId>,
    pub sender_id: UserId,
    pub body: String,
    pub created_at: DateTime<Utc>,
    pub attachments: Vec<Attachment>,
    pub status: EntryStatus,
}

impl LogEntry {
    fn confirmed(message: ChatMessage) -> Self {
        Self {
            temp_id: message.client_ref,
            message_id: Some(message.message_id),
            sender_id: message.sender_id,
            body: message.body,
            created_at: message.created_at,
            attachments: message.attachments,
            status: EntryStatus::Confirmed,
        }
    }

    fn order_key(&self) -> (DateTime<Utc>, Option<MessageId>) {
        (self.created_at, self.message_id)
    }

    pub fn is_pending(&self) -> bool {
        self.status == EntryStatus::Pending
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// The optimistic entry now holds the confirmed message.
    Replaced,
    /// The entry was already confirmed with this id (the echo won).
    AlreadyConfirmed,
    /// The confirmed id was already in the log as its own entry; the
    /// optimistic copy was dropped.
    Collapsed,
    /// No entry with that temp id; nothing changed.
    Missing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    Inserted,
    /// Echo of this client's own pending send, confirmed in place.
    Reconciled,
    Duplicate,
    /// Addressed to a different room; dropped.
    Ignored,
}

/// Ordered, deduplicated message log of one room.
///
/// Positions are stable: once an entry is placed it is never moved.
/// Confirmed messages merged from the backend are inserted at their
/// chronological position; the sender's own messages stay where the
/// optimistic copy was shown. No two entries share a `message_id`.
#[derive(Debug, Clone)]
pub struct MessageStore {
    room_id: RoomId,
    entries: Vec<LogEntry>,
}

impl MessageStore {
    pub fn new(room_id: RoomId) -> Self {
        Self {
            room_id,
            entries: Vec::new(),
        }
    }

    pub fn room_id(&self) -> RoomId {
        self.room_id
    }

    pub fn entries(&self) -> &[LogEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn pending_count(&self) -> usize {
        self.entries.iter().filter(|e| e.is_pending()).count()
    }

    pub fn contains_message(&self, message_id: MessageId) -> bool {
        self.position_of_message(message_id).is_some()
    }

    /// Replace confirmed history with `messages` (the initial window).
    /// Pending sends survive after the loaded history.
    pub fn load(&mut self, mut messages: Vec<ChatMessage>) {
        messages.retain(|m| m.room_id == self.room_id);
        messages.sort_by_key(|m| m.order_key());
        messages.dedup_by_key(|m| m.message_id);

        let pending: Vec<LogEntry> = self.entries.drain(..).filter(|e| e.is_pending()).collect();
        self.entries = messages.into_iter().map(LogEntry::confirmed).collect();
        for entry in pending {
            if let Some(temp_id) = entry.temp_id {
                // A pending send may already be part of the fetched window.
                if self.position_of_temp(temp_id).is_some() {
                    continue;
                }
            }
            self.entries.push(entry);
        }
        self.check_unique("load");
    }

    /// Append a pending entry and return its temp id.
    pub fn insert_optimistic(
        &mut self,
        sender_id: UserId,
        body: String,
        attachments: Vec<Attachment>,
    ) -> TempId {
        let temp_id = TempId::new();
        self.entries.push(LogEntry {
            temp_id: Some(temp_id),
            message_id: None,
            sender_id,
            body,
            created_at: Utc::now(),
            attachments,
            status: EntryStatus::Pending,
        });
        temp_id
    }

    /// Swap the optimistic entry for its confirmed message, in place.
    pub fn reconcile(&mut self, temp_id: TempId, confirmed: ChatMessage) -> ReconcileOutcome {
        let Some(pos) = self.position_of_temp(temp_id) else {
            return ReconcileOutcome::Missing;
        };
        if self.entries[pos].message_id == Some(confirmed.message_id) {
            return ReconcileOutcome::AlreadyConfirmed;
        }
        if self.contains_message(confirmed.message_id) {
            self.entries.remove(pos);
            tracing::debug!(%temp_id, message_id = %confirmed.message_id, "optimistic copy collapsed");
            return ReconcileOutcome::Collapsed;
        }

        let mut entry = LogEntry::confirmed(confirmed);
        entry.temp_id = Some(temp_id);
        self.entries[pos] = entry;
        self.check_unique("reconcile");
        ReconcileOutcome::Replaced
    }

    /// Apply a confirmed message from the push channel or a resync.
    /// Idempotent by `message_id`.
    pub fn merge_remote(&mut self, message: ChatMessage) -> MergeOutcome {
        if message.room_id != self.room_id {
            tracing::warn!(
                room_id = %self.room_id,
                other = %message.room_id,
                "ignoring message for another room"
            );
            return MergeOutcome::Ignored;
        }
        if self.contains_message(message.message_id) {
            return MergeOutcome::Duplicate;
        }

        if let Some(temp_id) = message.client_ref {
            if let Some(pos) = self.position_of_temp(temp_id) {
                if self.entries[pos].is_pending() {
                    self.entries[pos] = LogEntry::confirmed(message);
                    self.check_unique("merge_remote");
                    return MergeOutcome::Reconciled;
                }
            }
        }

        let key = (message.created_at, Some(message.message_id));
        let pos = self
            .entries
            .iter()
            .rposition(|e| e.order_key() <= key)
            .map_or(0, |i| i + 1);
        self.entries.insert(pos, LogEntry::confirmed(message));
        self.check_unique("merge_remote");
        MergeOutcome::Inserted
    }

    /// Merge a batch (e.g. a resync window). Returns how many were new.
    pub fn merge_all(&mut self, messages: impl IntoIterator<Item = ChatMessage>) -> usize {
        let mut merged = 0;
        for message in messages {
            if matches!(
                self.merge_remote(message),
                MergeOutcome::Inserted | MergeOutcome::Reconciled
            ) {
                merged += 1;
            }
        }
        merged
    }

    /// Remove a pending entry after its write failed. The removed entry is
    /// returned marked `Failed`.
    pub fn rollback(&mut self, temp_id: TempId) -> Option<LogEntry> {
        let pos = self.position_of_temp(temp_id)?;
        if !self.entries[pos].is_pending() {
            tracing::warn!(%temp_id, "refusing to roll back a confirmed message");
            return None;
        }
        let mut entry = self.entries.remove(pos);
        entry.status = EntryStatus::Failed;
        Some(entry)
    }

    /// Rewrite a confirmed message in place. Unknown ids are ignored.
    pub fn apply_update(&mut self, message: ChatMessage) -> bool {
        let Some(pos) = self.position_of_message(message.message_id) else {
            return false;
        };
        let entry = &mut self.entries[pos];
        entry.body = message.body;
        entry.attachments = message.attachments;
        true
    }

    /// Remove confirmed messages by id. Returns how many were present.
    pub fn apply_delete(&mut self, message_ids: &[MessageId]) -> usize {
        let doomed: HashSet<&MessageId> = message_ids.iter().collect();
        let before = self.entries.len();
        self.entries
            .retain(|e| !matches!(e.message_id, Some(id) if doomed.contains(&id)));
        before - self.entries.len()
    }

    fn position_of_temp(&self, temp_id: TempId) -> Option<usize> {
        self.entries.iter().position(|e| e.temp_id == Some(temp_id))
    }

    fn position_of_message(&self, message_id: MessageId) -> Option<usize> {
        self.entries
            .iter()
            .position(|e| e.message_id == Some(message_id))
    }

    fn check_unique(&self, op: &str) {
        let mut seen = HashSet::with_capacity(self.entries.len());
        for id in self.entries.iter().filter_map(|e| e.message_id) {
            if !seen.insert(id) {
                tracing::error!(room_id = %self.room_id, message_id = %id, op, "duplicate message in log");
                debug_assert!(false, "duplicate message {id} after {op}");
            }
        }
    }
}

/// The log currently on screen, shared between a controller, its
/// in-flight sends and the push-channel pump.
///
/// Every room switch bumps the epoch. Writers pass the epoch they
/// started under, so work begun for an old room never lands in the new
/// room's log. Each applied mutation bumps a revision observers can watch.
pub struct SharedLog {
    inner: Mutex<LogSlot>,
    revision: watch::Sender<u64>,
}

struct LogSlot {
    epoch: u64,
    store: Option<MessageStore>,
}

impl SharedLog {
    pub fn new() -> Self {
        let (revision, _) = watch::channel(0);
        Self {
            inner: Mutex::new(LogSlot {
                epoch: 0,
                store: None,
            }),
            revision,
        }
    }

    pub fn epoch(&self) -> u64 {
        self.inner.lock().map(|slot| slot.epoch).unwrap_or(u64::MAX)
    }

    /// Install `store` (or nothing) and start a new epoch.
    pub fn reset(&self, store: Option<MessageStore>) -> u64 {
        let epoch = match self.inner.lock() {
            Ok(mut slot) => {
                slot.epoch += 1;
                slot.store = store;
                slot.epoch
            }
            Err(_) => u64::MAX,
        };
        self.revision.send_modify(|r| *r += 1);
        epoch
    }

    /// Run `f` on the log if it still belongs to `epoch`.
    pub fn with_store<R>(&self, epoch: u64, f: impl FnOnce(&mut MessageStore) -> R) -> Option<R> {
        let out = {
            let mut slot = self.inner.lock().ok()?;
            if slot.epoch != epoch {
                return None;
            }
            f(slot.store.as_mut()?)
        };
        self.revision.send_modify(|r| *r += 1);
        Some(out)
    }

    /// Read the current log regardless of epoch.
    pub fn read<R>(&self, f: impl FnOnce(&MessageStore) -> R) -> Option<R> {
        let slot = self.inner.lock().ok()?;
        slot.store.as_ref().map(f)
    }

    pub fn room_id(&self) -> Option<RoomId> {
        self.read(|store| store.room_id())
    }

    pub fn entries(&self) -> Vec<LogEntry> {
        self.read(|store| store.entries().to_vec()).unwrap_or_default()
    }

    /// Revision counter that ticks on every change.
    pub fn watch(&self) -> watch::Receiver<u64> {
        self.revision.subscribe()
    }
}

impl Default for SharedLog {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn at(room_id: RoomId, secs: i64, body: &str) -> ChatMessage {
        ChatMessage {
            message_id: MessageId::new(),
            room_id,
            sender_id: UserId::new("bob"),
            body: body.into(),
            created_at: DateTime::<Utc>::from_timestamp(1_700_000_000 + secs, 0).unwrap(),
            attachments: vec![],
            client_ref: None,
        }
    }

    fn bodies(store: &MessageStore) -> Vec<&str> {
        store.entries().iter().map(|e| e.body.as_str()).collect()
    }

    fn confirm(store_room: RoomId, temp_id: TempId, body: &str, when: DateTime<Utc>) -> ChatMessage {
        ChatMessage {
            message_id: MessageId::new(),
            room_id: store_room,
            sender_id: UserId::new("alice"),
            body: body.into(),
            created_at: when,
            attachments: vec![],
            client_ref: Some(temp_id),
        }
    }

    #[test]
    fn load_sorts_and_dedups() {
        let room = RoomId::new();
        let mut store = MessageStore::new(room);
        let first = at(room, 1, "first");
        let second = at(room, 2, "second");
        store.load(vec![second.clone(), first.clone(), second.clone()]);
        assert_eq!(bodies(&store), vec!["first", "second"]);
    }

    #[test]
    fn optimistic_entry_is_visible_and_pending() {
        let mut store = MessageStore::new(RoomId::new());
        let temp = store.insert_optimistic(UserId::new("alice"), "hi".into(), vec![]);
        let entry = &store.entries()[0];
        assert_eq!(entry.temp_id, Some(temp));
        assert_eq!(entry.status, EntryStatus::Pending);
        assert!(entry.message_id.is_none());
    }

    #[test]
    fn reconcile_keeps_position_even_if_confirmed_later() {
        let room = RoomId::new();
        let mut store = MessageStore::new(room);
        store.load(vec![at(room, 10, "history")]);
        let temp = store.insert_optimistic(UserId::new("alice"), "mine".into(), vec![]);
        let mut bob = at(room, 0, "bob later");
        bob.created_at = Utc::now() + Duration::seconds(1);
        store.merge_remote(bob.clone());
        assert_eq!(bodies(&store), vec!["history", "mine", "bob later"]);

        // The server stamped it after "bob later"; it stays where it was shown.
        let confirmed = confirm(room, temp, "mine", bob.created_at + Duration::seconds(5));
        assert_eq!(store.reconcile(temp, confirmed.clone()), ReconcileOutcome::Replaced);
        assert_eq!(bodies(&store), vec!["history", "mine", "bob later"]);
        assert_eq!(store.entries()[1].message_id, Some(confirmed.message_id));
        assert_eq!(store.entries()[1].status, EntryStatus::Confirmed);
    }

    #[test]
    fn echo_before_response_reconciles_once() {
        let room = RoomId::new();
        let mut store = MessageStore::new(room);
        let temp = store.insert_optimistic(UserId::new("alice"), "hello".into(), vec![]);
        let confirmed = confirm(room, temp, "hello", Utc::now());

        assert_eq!(store.merge_remote(confirmed.clone()), MergeOutcome::Reconciled);
        assert_eq!(
            store.reconcile(temp, confirmed.clone()),
            ReconcileOutcome::AlreadyConfirmed
        );
        assert_eq!(store.merge_remote(confirmed), MergeOutcome::Duplicate);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn response_before_echo_drops_the_echo() {
        let room = RoomId::new();
        let mut store = MessageStore::new(room);
        let temp = store.insert_optimistic(UserId::new("alice"), "hello".into(), vec![]);
        let confirmed = confirm(room, temp, "hello", Utc::now());

        assert_eq!(store.reconcile(temp, confirmed.clone()), ReconcileOutcome::Replaced);
        assert_eq!(store.merge_remote(confirmed), MergeOutcome::Duplicate);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn uncorrelated_echo_is_collapsed_on_reconcile() {
        let room = RoomId::new();
        let mut store = MessageStore::new(room);
        let temp = store.insert_optimistic(UserId::new("alice"), "hello".into(), vec![]);
        let mut echo = confirm(room, temp, "hello", Utc::now());
        echo.client_ref = None;

        assert_eq!(store.merge_remote(echo.clone()), MergeOutcome::Inserted);
        assert_eq!(store.reconcile(temp, echo), ReconcileOutcome::Collapsed);
        assert_eq!(store.len(), 1);
        assert_eq!(store.pending_count(), 0);
    }

    #[test]
    fn remote_merge_is_chronological() {
        let room = RoomId::new();
        let mut store = MessageStore::new(room);
        store.load(vec![at(room, 1, "a"), at(room, 3, "c")]);
        store.merge_remote(at(room, 2, "b"));
        store.merge_remote(at(room, 0, "zero"));
        store.merge_remote(at(room, 4, "d"));
        assert_eq!(bodies(&store), vec!["zero", "a", "b", "c", "d"]);
    }

    #[test]
    fn rollback_removes_only_pending() {
        let room = RoomId::new();
        let mut store = MessageStore::new(room);
        let kept = store.insert_optimistic(UserId::new("alice"), "kept".into(), vec![]);
        let failed = store.insert_optimistic(UserId::new("alice"), "failed".into(), vec![]);
        store.reconcile(kept, confirm(room, kept, "kept", Utc::now()));

        let removed = store.rollback(failed).unwrap();
        assert_eq!(removed.body, "failed");
        assert_eq!(removed.status, EntryStatus::Failed);
        assert!(store.rollback(kept).is_none());
        assert_eq!(bodies(&store), vec!["kept"]);
    }

    #[test]
    fn overlapping_sends_each_reconcile() {
        let room = RoomId::new();
        let mut store = MessageStore::new(room);
        let t1 = store.insert_optimistic(UserId::new("alice"), "one".into(), vec![]);
        let t2 = store.insert_optimistic(UserId::new("alice"), "two".into(), vec![]);
        let now = Utc::now();

        // Second confirmed first, with the earlier timestamp.
        store.reconcile(t2, confirm(room, t2, "two", now));
        store.reconcile(t1, confirm(room, t1, "one", now + Duration::seconds(1)));
        assert_eq!(bodies(&store), vec!["one", "two"]);
        assert_eq!(store.pending_count(), 0);
    }

    #[test]
    fn update_and_delete_apply_in_place() {
        let room = RoomId::new();
        let mut store = MessageStore::new(room);
        let a = at(room, 1, "a");
        let b = at(room, 2, "b");
        store.load(vec![a.clone(), b.clone()]);

        let mut edited = a.clone();
        edited.body = "a (edited)".into();
        assert!(store.apply_update(edited));
        assert!(!store.apply_update(at(room, 9, "unknown")));
        assert_eq!(bodies(&store), vec!["a (edited)", "b"]);

        assert_eq!(store.apply_delete(&[b.message_id, MessageId::new()]), 1);
        assert_eq!(bodies(&store), vec!["a (edited)"]);
    }

    #[test]
    fn delete_keeps_pending_entries() {
        let room = RoomId::new();
        let mut store = MessageStore::new(room);
        let old = at(room, 1, "old");
        store.load(vec![old.clone()]);
        store.insert_optimistic(UserId::new("alice"), "new".into(), vec![]);
        store.apply_delete(&[old.message_id]);
        assert_eq!(bodies(&store), vec!["new"]);
    }

    #[test]
    fn reload_keeps_unconfirmed_sends() {
        let room = RoomId::new();
        let mut store = MessageStore::new(room);
        let temp = store.insert_optimistic(UserId::new("alice"), "pending".into(), vec![]);
        let landed = confirm(room, temp, "pending", Utc::now());
        let other = store.insert_optimistic(UserId::new("alice"), "still pending".into(), vec![]);

        store.load(vec![at(room, 1, "old"), landed]);
        assert_eq!(bodies(&store), vec!["old", "pending", "still pending"]);
        assert!(store.rollback(other).is_some());
    }

    #[test]
    fn merge_all_counts_new_messages() {
        let room = RoomId::new();
        let mut store = MessageStore::new(room);
        let a = at(room, 1, "a");
        store.load(vec![a.clone()]);
        assert_eq!(store.merge_all(vec![a, at(room, 2, "b")]), 1);
    }

    #[test]
    fn stale_epoch_cannot_write() {
        let log = SharedLog::new();
        let room_a = RoomId::new();
        let old = log.reset(Some(MessageStore::new(room_a)));
        let new = log.reset(Some(MessageStore::new(RoomId::new())));
        assert_ne!(old, new);

        assert!(log
            .with_store(old, |s| s.merge_remote(at(room_a, 1, "late")))
            .is_none());
        assert!(log.entries().is_empty());
        assert!(log.with_store(new, |s| s.len()).is_some());
    }

    #[test]
    fn changes_tick_revision() {
        let log = SharedLog::new();
        let room = RoomId::new();
        let mut rx = log.watch();
        let epoch = log.reset(Some(MessageStore::new(room)));
        rx.borrow_and_update();
        log.with_store(epoch, |s| s.merge_remote(at(room, 1, "a")));
        assert!(rx.has_changed().unwrap());
        assert_eq!(log.room_id(), Some(room));
    }

    #[test]
    fn foreign_room_message_is_ignored() {
        let mut store = MessageStore::new(RoomId::new());
        assert_eq!(
            store.merge_remote(at(RoomId::new(), 1, "stray")),
            MergeOutcome::Ignored
        );
        assert!(store.is_empty());
    }
}
