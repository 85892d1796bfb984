use std::future::Future;
use std::pin::Pin;

use serde_json::Value;
use uuid::Uuid;

use deskchat_protocol::Response;

/// Trait implemented by each RPC service (profiles, rooms, messages).
///
/// Services are connection-scoped: one instance per WS connection, built
/// for the user the connection acts for and dropped when it closes.
pub trait ServiceHandler: Send {
    /// The service namespace prefix (e.g. "rooms").
    fn namespace(&self) -> &str;

    /// Handle an RPC request. `method` is the full dotted method name
    /// (e.g. "rooms.resolve").
    fn handle_request(
        &mut self,
        id: Uuid,
        method: &str,
        params: Option<Value>,
    ) -> Pin<Box<dyn Future<Output = Response> + Send + '_>>;
}
