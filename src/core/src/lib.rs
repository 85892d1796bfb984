//! Realtime messaging core for the deskchat support desk.
//!
//! The client half ([`ChatController`] and the pieces under it) keeps one
//! room's message log consistent while sends, pushes and room switches
//! race each other. The server half ([`build_router`]) hosts a
//! [`LocalBackend`] over a WebSocket RPC protocol.

pub mod backend;
pub mod chat;
pub mod config;
mod connection;
pub mod error;
pub mod identity;
pub mod message_store;
pub mod paths;
pub mod rooms;
mod router;
mod server;
mod services;
pub mod storage;
pub mod subscription;

pub use backend::{BackendFuture, ChatBackend, LocalBackend, PushChannel, RoomRequest};
pub use chat::{ChatController, DisplayMessage, Session, Surface};
pub use config::{ChatConfig, ServerConfig};
pub use error::{BackendError, ChatError};
pub use identity::{Identity, IdentityResolver};
pub use message_store::{EntryStatus, LogEntry, MessageStore, SharedLog};
pub use rooms::{DirectRoom, ResolvedRoom, RoomResolver};
pub use server::build_router;
pub use storage::{SqliteStore, Store};
pub use subscription::{ChannelState, SubscriptionManager};
