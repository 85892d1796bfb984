use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde::Deserialize;
use serde_json::{json, Value};
use uuid::Uuid;

use deskchat_protocol::{error_codes, Profile, Response, UserId};

use super::{backend_error, parse_params};
use crate::backend::ChatBackend;
use crate::router::ServiceHandler;

#[derive(Debug, Deserialize)]
struct GetParams {
    user_id: UserId,
}

/// Read-only profile lookups.
pub struct ProfilesService {
    backend: Arc<dyn ChatBackend>,
    caller: Profile,
}

impl ProfilesService {
    pub fn new(backend: Arc<dyn ChatBackend>, caller: Profile) -> Self {
        Self { backend, caller }
    }

    async fn get(&self, id: Uuid, params: Option<Value>) -> Response {
        let params: GetParams = match parse_params(id, params) {
            Ok(p) => p,
            Err(resp) => return resp,
        };
        match self.backend.get_profile(&params.user_id).await {
            Ok(profile) => Response::success(id, json!({ "profile": profile })),
            Err(e) => backend_error(id, &e),
        }
    }
}

impl ServiceHandler for ProfilesService {
    fn namespace(&self) -> &str {
        "profiles"
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
                "profiles.get" => self.get(id, params).await,
                "profiles.me" => Response::success(id, json!({ "profile": self.caller })),
                _ => Response::error(
                    id,
                    error_codes::METHOD_NOT_FOUND,
                    format!("unknown method: {method}"),
                ),
            }
        })
    }
}
