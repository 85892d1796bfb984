use std::collections::HashMap;

use serde_json::Value;
use uuid::Uuid;

use deskchat_protocol::{error_codes, Response};

use super::handler::ServiceHandler;

/// Routes RPC requests to the correct service handler based on method prefix.
///
/// Method names use `service.method` convention (e.g. "messages.send").
/// The router extracts the first dotted segment as the namespace and delegates
/// to the matching `ServiceHandler`.
pub struct MessageRouter {
    /// namespace → handler
    services: HashMap<String, Box<dyn ServiceHandler>>,
}

impl MessageRouter {
    pub fn new() -> Self {
        Self {
            services: HashMap::new(),
        }
    }

    /// Register a service handler. The handler's `namespace()` is used as key.
    pub fn register(&mut self, handler: Box<dyn ServiceHandler>) {
        let ns = handler.namespace().to_string();
        self.services.insert(ns, handler);
    }

    /// e.g. "rooms.resolve" → "rooms"
    fn extract_namespace(method: &str) -> Option<&str> {
        method.split('.').next().filter(|s| !s.is_empty())
    }

    pub async fn route_request(
        &mut self,
        id: Uuid,
        method: &str,
        params: Option<Value>,
    ) -> Response {
        let ns = match Self::extract_namespace(method) {
            Some(ns) => ns,
            None => {
                return Response::error(
                    id,
                    error_codes::METHOD_NOT_FOUND,
                    format!("invalid method format: {method}"),
                )
            }
        };

        match self.services.get_mut(ns) {
            Some(handler) => handler.handle_request(id, method, params).await,
            None => Response::error(
                id,
                error_codes::METHOD_NOT_FOUND,
                format!("unknown service: {ns}"),
            ),
        }
    }
}

impl Default for MessageRouter {
    fn default() -> Self {
        Self::new()
    }
}
