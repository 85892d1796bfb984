use chrono::{DateTime, Utc};

use deskchat_protocol::{Attachment, MessageId, RoomContext, TempId, TicketId, UserId};

use crate::identity::Identity;
use crate::message_store::{EntryStatus, LogEntry};

/// The three chat surfaces of the app.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Surface {
    /// Conversation attached to a support ticket.
    Ticket(TicketId),
    /// System-wide team chat.
    Broadcast,
    /// One-to-one conversation with `peer`.
    Direct(UserId),
}

impl Surface {
    pub fn ticket(ticket_id: impl Into<String>) -> Self {
        Self::Ticket(TicketId::new(ticket_id))
    }

    pub fn direct(peer: impl Into<String>) -> Self {
        Self::Direct(UserId::new(peer))
    }

    pub fn context(&self, caller: &UserId) -> RoomContext {
        match self {
            Self::Ticket(ticket_id) => RoomContext::Ticket {
                ticket_id: ticket_id.clone(),
            },
            Self::Broadcast => RoomContext::Broadcast,
            Self::Direct(peer) => RoomContext::direct(caller.clone(), peer.clone()),
        }
    }
}

/// A log entry annotated for display.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisplayMessage {
    pub temp_id: Option<TempId>,
    pub message_id: Option<MessageId>,
    pub sender: Identity,
    pub body: String,
    pub created_at: DateTime<Utc>,
    pub attachments: Vec<Attachment>,
    pub status: EntryStatus,
    /// Sent by the session user.
    pub own: bool,
}

impl DisplayMessage {
    pub(super) fn new(entry: LogEntry, sender: Identity, me: &UserId) -> Self {
        Self {
            own: entry.sender_id == *me,
            temp_id: entry.temp_id,
            message_id: entry.message_id,
            sender,
            body: entry.body,
            created_at: entry.created_at,
            attachments: entry.attachments,
            status: entry.status,
        }
    }
}

pub(super) fn ticket_title(ticket_id: &TicketId) -> String {
    format!("Ticket #{ticket_id}")
}
