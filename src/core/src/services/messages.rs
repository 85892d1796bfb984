use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde::Deserialize;
use serde_json::{json, Value};
use uuid::Uuid;

use deskchat_protocol::{
    error_codes, Attachment, MessageDraft, Profile, Response, RoomId, TempId,
};

use super::{backend_error, check_room_access, parse_params};
use crate::backend::ChatBackend;
use crate::config::ChatConfig;
use crate::router::ServiceHandler;

#[derive(Debug, Deserialize)]
struct ListParams {
    room_id: RoomId,
    limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct SendParams {
    room_id: RoomId,
    body: String,
    #[serde(default)]
    attachments: Vec<Attachment>,
    client_ref: Option<TempId>,
}

#[derive(Debug, Deserialize)]
struct PurgeParams {
    room_id: RoomId,
}

/// Message history, writes and the privileged purge.
///
/// Live updates are not served here; `messages.subscribe` is handled by
/// the connection, which owns the topic filter.
pub struct MessagesService {
    backend: Arc<dyn ChatBackend>,
    caller: Profile,
    config: Arc<ChatConfig>,
}

impl MessagesService {
    pub fn new(backend: Arc<dyn ChatBackend>, caller: Profile, config: Arc<ChatConfig>) -> Self {
        Self {
            backend,
            caller,
            config,
        }
    }

    async fn list(&self, id: Uuid, params: Option<Value>) -> Response {
        let params: ListParams = match parse_params(id, params) {
            Ok(p) => p,
            Err(resp) => return resp,
        };
        if let Err(e) = check_room_access(&*self.backend, &self.caller, params.room_id).await {
            return backend_error(id, &e);
        }
        let limit = params
            .limit
            .unwrap_or(self.config.history_limit)
            .min(self.config.history_limit);
        match self.backend.recent_messages(params.room_id, limit).await {
            Ok(messages) => Response::success(id, json!({ "messages": messages })),
            Err(e) => backend_error(id, &e),
        }
    }

    async fn send(&self, id: Uuid, params: Option<Value>) -> Response {
        let params: SendParams = match parse_params(id, params) {
            Ok(p) => p,
            Err(resp) => return resp,
        };
        if params.body.trim().is_empty() {
            return Response::error(id, error_codes::INVALID_PARAMS, "message is empty");
        }
        let len = params.body.chars().count();
        if len > self.config.max_body_len {
            return Response::error(
                id,
                error_codes::INVALID_PARAMS,
                format!("message is {len} characters, limit is {}", self.config.max_body_len),
            );
        }
        if let Err(e) = check_room_access(&*self.backend, &self.caller, params.room_id).await {
            return backend_error(id, &e);
        }

        let draft = MessageDraft {
            room_id: params.room_id,
            sender_id: self.caller.user_id.clone(),
            body: params.body,
            attachments: params.attachments,
            client_ref: params.client_ref,
        };
        match self.backend.insert_message(draft).await {
            Ok(message) => Response::success(id, json!({ "message": message })),
            Err(e) => backend_error(id, &e),
        }
    }

    async fn purge(&self, id: Uuid, params: Option<Value>) -> Response {
        let params: PurgeParams = match parse_params(id, params) {
            Ok(p) => p,
            Err(resp) => return resp,
        };
        if !self.caller.role.can_moderate() {
            return Response::error(
                id,
                error_codes::FORBIDDEN,
                "clearing history requires an admin",
            );
        }
        if params.room_id != RoomId::BROADCAST {
            return Response::error(
                id,
                error_codes::FORBIDDEN,
                "only the broadcast room can be cleared",
            );
        }
        match self.backend.purge_messages(params.room_id).await {
            Ok(removed) => {
                tracing::info!(room_id = %params.room_id, user_id = %self.caller.user_id, removed = removed.len(), "history purged over rpc");
                Response::success(id, json!({ "removed": removed.len() }))
            }
            Err(e) => backend_error(id, &e),
        }
    }
}

impl ServiceHandler for MessagesService {
    fn namespace(&self) -> &str {
        "messages"
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
                "messages.list" => self.list(id, params).await,
                "messages.send" => self.send(id, params).await,
                "messages.purge" => self.purge(id, params).await,
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
    use crate::backend::{LocalBackend, RoomRequest};
    use crate::storage::SqliteStore;
    use deskchat_protocol::{RoomContext, UserId, UserRole};

    fn profile(id: &str, role: UserRole) -> Profile {
        Profile {
            user_id: UserId::new(id),
            full_name: id.to_uppercase(),
            role,
        }
    }

    fn service(backend: &Arc<LocalBackend>, caller: Profile) -> MessagesService {
        MessagesService::new(backend.clone(), caller, Arc::new(ChatConfig::default()))
    }

    fn make_backend() -> Arc<LocalBackend> {
        Arc::new(LocalBackend::new(Arc::new(SqliteStore::open_memory().unwrap()), 16))
    }

    fn error_code(resp: &Response) -> Option<i32> {
        resp.error.as_ref().map(|e| e.code)
    }

    #[tokio::test]
    async fn send_rejects_blank_body() {
        let backend = make_backend();
        let mut svc = service(&backend, profile("alice", UserRole::Agent));
        let resp = svc
            .handle_request(
                Uuid::new_v4(),
                "messages.send",
                Some(json!({ "room_id": RoomId::BROADCAST, "body": "   " })),
            )
            .await;
        assert_eq!(error_code(&resp), Some(error_codes::INVALID_PARAMS));
    }

    #[tokio::test]
    async fn send_stamps_caller_as_sender() {
        let backend = make_backend();
        let mut svc = service(&backend, profile("alice", UserRole::Agent));
        let resp = svc
            .handle_request(
                Uuid::new_v4(),
                "messages.send",
                Some(json!({ "room_id": RoomId::BROADCAST, "body": "hello", "sender_id": "mallory" })),
            )
            .await;
        let result = resp.result.expect("success");
        assert_eq!(result["message"]["sender_id"], "alice");
        assert_eq!(result["message"]["body"], "hello");
    }

    #[tokio::test]
    async fn non_member_cannot_post_into_ticket_room() {
        let backend = make_backend();
        let room = backend
            .get_or_create_room(RoomRequest {
                context: RoomContext::ticket("T-9"),
                members: vec![UserId::new("alice")],
                name: None,
            })
            .await
            .unwrap();
        let mut svc = service(&backend, profile("bob", UserRole::User));
        let resp = svc
            .handle_request(
                Uuid::new_v4(),
                "messages.send",
                Some(json!({ "room_id": room.room_id, "body": "hi" })),
            )
            .await;
        assert_eq!(error_code(&resp), Some(error_codes::FORBIDDEN));
    }

    #[tokio::test]
    async fn purge_requires_admin() {
        let backend = make_backend();
        let params = json!({ "room_id": RoomId::BROADCAST });

        let mut agent = service(&backend, profile("alice", UserRole::Agent));
        let resp = agent
            .handle_request(Uuid::new_v4(), "messages.purge", Some(params.clone()))
            .await;
        assert_eq!(error_code(&resp), Some(error_codes::FORBIDDEN));

        agent
            .handle_request(
                Uuid::new_v4(),
                "messages.send",
                Some(json!({ "room_id": RoomId::BROADCAST, "body": "one" })),
            )
            .await;
        let mut admin = service(&backend, profile("root", UserRole::Admin));
        let resp = admin
            .handle_request(Uuid::new_v4(), "messages.purge", Some(params))
            .await;
        assert_eq!(resp.result.expect("success")["removed"], 1);
    }

    #[tokio::test]
    async fn missing_params_and_unknown_method() {
        let backend = make_backend();
        let mut svc = service(&backend, profile("alice", UserRole::Agent));
        let resp = svc
            .handle_request(Uuid::new_v4(), "messages.list", None)
            .await;
        assert_eq!(error_code(&resp), Some(error_codes::INVALID_PARAMS));
        let resp = svc
            .handle_request(Uuid::new_v4(), "messages.edit", None)
            .await;
        assert_eq!(error_code(&resp), Some(error_codes::METHOD_NOT_FOUND));
    }
}
