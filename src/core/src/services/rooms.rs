use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde::Deserialize;
use serde_json::{json, Value};
use uuid::Uuid;

use deskchat_protocol::{error_codes, Profile, Response, RoomContext, RoomId};

use super::{backend_error, chat_error, check_room_access, parse_params};
use crate::backend::ChatBackend;
use crate::rooms::RoomResolver;
use crate::router::ServiceHandler;

#[derive(Debug, Deserialize)]
struct ResolveParams {
    context: RoomContext,
}

#[derive(Debug, Deserialize)]
struct RoomParams {
    room_id: RoomId,
}

/// Room resolution and membership queries for the connected user.
pub struct RoomsService {
    backend: Arc<dyn ChatBackend>,
    caller: Profile,
    resolver: RoomResolver,
}

impl RoomsService {
    pub fn new(backend: Arc<dyn ChatBackend>, caller: Profile) -> Self {
        let resolver = RoomResolver::new(backend.clone(), caller.user_id.clone());
        Self {
            backend,
            caller,
            resolver,
        }
    }

    async fn resolve(&self, id: Uuid, params: Option<Value>) -> Response {
        let params: ResolveParams = match parse_params(id, params) {
            Ok(p) => p,
            Err(resp) => return resp,
        };
        match self.resolver.resolve(&params.context).await {
            Ok(room) => Response::success(
                id,
                json!({
                    "room_id": room.room_id,
                    "context": room.context,
                    "name": room.name,
                }),
            ),
            Err(e) => chat_error(id, &e),
        }
    }

    async fn members(&self, id: Uuid, params: Option<Value>) -> Response {
        let params: RoomParams = match parse_params(id, params) {
            Ok(p) => p,
            Err(resp) => return resp,
        };
        if let Err(e) = check_room_access(&*self.backend, &self.caller, params.room_id).await {
            return backend_error(id, &e);
        }
        match self.backend.room_members(params.room_id).await {
            Ok(members) => Response::success(id, json!({ "members": members })),
            Err(e) => backend_error(id, &e),
        }
    }

    /// Ends the caller's membership. Messages they sent stay in the room.
    async fn leave(&self, id: Uuid, params: Option<Value>) -> Response {
        let params: RoomParams = match parse_params(id, params) {
            Ok(p) => p,
            Err(resp) => return resp,
        };
        if params.room_id == RoomId::BROADCAST {
            return Response::error(
                id,
                error_codes::FORBIDDEN,
                "the broadcast room cannot be left",
            );
        }
        if let Err(e) = check_room_access(&*self.backend, &self.caller, params.room_id).await {
            return backend_error(id, &e);
        }
        match self
            .backend
            .leave_room(params.room_id, &self.caller.user_id)
            .await
        {
            Ok(left) => Response::success(id, json!({ "left": left })),
            Err(e) => backend_error(id, &e),
        }
    }

    async fn list(&self, id: Uuid) -> Response {
        match self.backend.rooms_for_user(&self.caller.user_id).await {
            Ok(rooms) => Response::success(id, json!({ "rooms": rooms })),
            Err(e) => backend_error(id, &e),
        }
    }

    async fn direct(&self, id: Uuid) -> Response {
        match self.resolver.direct_rooms().await {
            Ok(rooms) => {
                let rooms: Vec<Value> = rooms
                    .into_iter()
                    .map(|r| json!({ "room_id": r.room_id, "peer": r.peer }))
                    .collect();
                Response::success(id, json!({ "rooms": rooms }))
            }
            Err(e) => chat_error(id, &e),
        }
    }
}

impl ServiceHandler for RoomsService {
    fn namespace(&self) -> &str {
        "rooms"
    }

    fn handle_request(
        &mut self,
        id: Uuid,
        method: &str,
        params: Option<Value>,
    ) -> Pin<Box<dyn Future<Output = Response> + Send + '_>> {
        let method = method.to_string();
        Box::pin(async move {
            match method.as_str() {
                "rooms.resolve" => self.resolve(id, params).await,
                "rooms.members" => self.members(id, params).await,
                "rooms.leave" => self.leave(id, params).await,
                "rooms.list" => self.list(id).await,
                "rooms.direct" => self.direct(id).await,
                _ => Response::error(
                    id,
                    error_codes::METHOD_NOT_FOUND,
                    format!("unknown method: {method}"),
                ),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::LocalBackend;
    use crate::storage::SqliteStore;
    use deskchat_protocol::{UserId, UserRole};

    fn profile(id: &str) -> Profile {
        Profile {
            user_id: UserId::new(id),
            full_name: id.to_uppercase(),
            role: UserRole::Agent,
        }
    }

    fn make_backend() -> Arc<LocalBackend> {
        Arc::new(LocalBackend::new(Arc::new(SqliteStore::open_memory().unwrap()), 16))
    }

    async fn call(svc: &mut RoomsService, method: &str, params: Value) -> Response {
        svc.handle_request(Uuid::new_v4(), method, Some(params)).await
    }

    #[tokio::test]
    async fn leave_then_resolve_rejoins() {
        let backend = make_backend();
        let mut svc = RoomsService::new(backend.clone(), profile("alice"));
        let resolved = call(&mut svc, "rooms.resolve", json!({ "context": RoomContext::ticket("T-9") }))
            .await
            .result
            .expect("resolved");
        let room_id = resolved["room_id"].clone();

        let left = call(&mut svc, "rooms.leave", json!({ "room_id": room_id })).await;
        assert_eq!(left.result, Some(json!({ "left": true })));

        // Gone from the list and locked out of the member view.
        let listed = call(&mut svc, "rooms.list", json!({})).await.result.expect("list");
        assert_eq!(listed["rooms"], json!([]));
        let members = call(&mut svc, "rooms.members", json!({ "room_id": room_id })).await;
        assert_eq!(members.error.map(|e| e.code), Some(error_codes::FORBIDDEN));

        call(&mut svc, "rooms.resolve", json!({ "context": RoomContext::ticket("T-9") }))
            .await
            .result
            .expect("resolved again");
        let members = call(&mut svc, "rooms.members", json!({ "room_id": room_id }))
            .await
            .result
            .expect("members");
        assert_eq!(members["members"].as_array().map(Vec::len), Some(1));
        assert_eq!(members["members"][0]["active"], true);
    }

    #[tokio::test]
    async fn broadcast_room_cannot_be_left() {
        let mut svc = RoomsService::new(make_backend(), profile("alice"));
        let resp = call(&mut svc, "rooms.leave", json!({ "room_id": RoomId::BROADCAST })).await;
        assert_eq!(resp.error.map(|e| e.code), Some(error_codes::FORBIDDEN));
    }
}
