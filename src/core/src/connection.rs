use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::broadcast;
use tracing::Instrument;
use uuid::Uuid;

use deskchat_protocol::{
    decode_message, encode_message, error_codes, room_topic, ClientHello, Event,
    HandshakeResponse, HelloReject, HelloRejectCode, Message as ProtoMessage, MessageChange,
    Profile, Response, RoomId, ServerHello, VersionRange, PROTOCOL_VERSION,
};

use crate::backend::{ChatBackend, LocalBackend};
use crate::config::{ChatConfig, ServerConfig};
use crate::error::BackendError;
use crate::router::{MessageRouter, ServiceRegistry, TopicFilter};
use crate::services::{
    backend_error, check_room_access, MessagesService, ProfilesService, RoomsService,
};

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);
const CLOSE_IDLE: u16 = 4000;
const CLOSE_REJECTED: u16 = 4001;
const CLOSE_LAGGED: u16 = 4002;

/// Represents a connection after a successful handshake.
#[derive(Debug)]
pub struct Connection {
    pub id: Uuid,
    pub profile: Profile,
    pub negotiated_version: u16,
}

/// Parameters required to run a connection session.
#[derive(Clone)]
pub struct ConnectionParams {
    pub config: ServerConfig,
    pub chat: Arc<ChatConfig>,
    pub registry: ServiceRegistry,
    pub backend: Arc<LocalBackend>,
}

type WsSink = SplitSink<WebSocket, Message>;
type WsStream = SplitStream<WebSocket>;

/// Run the full connection lifecycle: handshake, then the message loop with
/// heartbeat and idle timeout.
pub async fn run_connection(socket: WebSocket, params: ConnectionParams) {
    let conn_id = Uuid::new_v4();
    let span = tracing::info_span!("conn", id = %conn_id);
    run_session(conn_id, socket, params).instrument(span).await;
}

async fn run_session(conn_id: Uuid, socket: WebSocket, params: ConnectionParams) {
    let (mut sink, mut stream) = socket.split();

    let Some(conn) = handshake(conn_id, &mut sink, &mut stream, &params).await else {
        return;
    };
    tracing::info!(
        user_id = %conn.profile.user_id,
        version = conn.negotiated_version,
        "handshake complete"
    );

    run_message_loop(&mut sink, &mut stream, &conn, &params).await;

    tracing::info!(conn_id = %conn.id, "connection closed");
}

async fn handshake(
    conn_id: Uuid,
    sink: &mut WsSink,
    stream: &mut WsStream,
    params: &ConnectionParams,
) -> Option<Connection> {
    let hello = match tokio::time::timeout(HANDSHAKE_TIMEOUT, stream.next()).await {
        Ok(Some(Ok(Message::Text(text)))) => match serde_json::from_str::<ClientHello>(&text) {
            Ok(h) => h,
            Err(e) => {
                send_reject(sink, HelloRejectCode::ServerError, &format!("invalid handshake: {e}"))
                    .await;
                return None;
            }
        },
        _ => {
            send_reject(sink, HelloRejectCode::ServerError, "expected text handshake frame").await;
            return None;
        }
    };

    let server_range = VersionRange::new(PROTOCOL_VERSION, PROTOCOL_VERSION);
    let negotiated = match server_range.negotiate(&hello.protocol) {
        Ok(v) => v,
        Err(e) => {
            send_reject(sink, HelloRejectCode::VersionMismatch, &e.to_string()).await;
            return None;
        }
    };

    let profile = match params.backend.get_profile(&hello.user_id).await {
        Ok(profile) => profile,
        Err(BackendError::NotFound(_)) => {
            send_reject(
                sink,
                HelloRejectCode::UnknownUser,
                &format!("unknown user: {}", hello.user_id),
            )
            .await;
            return None;
        }
        Err(e) => {
            tracing::warn!(user_id = %hello.user_id, "profile lookup failed: {e}");
            send_reject(sink, HelloRejectCode::ServerError, "profile lookup failed").await;
            return None;
        }
    };

    let server_hello = HandshakeResponse::Hello(ServerHello {
        protocol_version: negotiated,
        server_id: format!("deskchat-gateway/{}", env!("CARGO_PKG_VERSION")),
        profile: profile.clone(),
        broadcast_room_id: RoomId::BROADCAST,
        services: params.registry.capabilities(),
    });
    let json = serde_json::to_string(&server_hello).ok()?;
    if sink.send(Message::Text(json.into())).await.is_err() {
        return None;
    }

    tracing::debug!(client_id = %hello.client_id, "client hello accepted");
    Some(Connection {
        id: conn_id,
        profile,
        negotiated_version: negotiated,
    })
}

async fn run_message_loop(
    sink: &mut WsSink,
    stream: &mut WsStream,
    conn: &Connection,
    params: &ConnectionParams,
) {
    let heartbeat_interval = params.config.heartbeat_interval;
    let idle_timeout = params.config.idle_timeout;
    let mut idle_deadline = tokio::time::Instant::now() + idle_timeout;
    let mut heartbeat = tokio::time::interval(heartbeat_interval);
    heartbeat.tick().await;

    let backend: Arc<dyn ChatBackend> = params.backend.clone();
    let mut router = MessageRouter::new();
    router.register(Box::new(ProfilesService::new(
        backend.clone(),
        conn.profile.clone(),
    )));
    router.register(Box::new(RoomsService::new(
        backend.clone(),
        conn.profile.clone(),
    )));
    router.register(Box::new(MessagesService::new(
        backend.clone(),
        conn.profile.clone(),
        params.chat.clone(),
    )));

    let mut topics = TopicFilter::new();
    let mut changes = params.backend.changes();

    loop {
        tokio::select! {
            msg = stream.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        idle_deadline = tokio::time::Instant::now() + idle_timeout;
                        let resp = handle_text_message(
                            &text,
                            conn,
                            &*backend,
                            &mut router,
                            &mut topics,
                        ).await;
                        if let Some(resp) = resp {
                            send_response(sink, resp).await;
                        }
                    }
                    Some(Ok(Message::Binary(_))) => {
                        idle_deadline = tokio::time::Instant::now() + idle_timeout;
                        tracing::debug!("binary frame ignored");
                    }
                    Some(Ok(Message::Ping(data))) => {
                        idle_deadline = tokio::time::Instant::now() + idle_timeout;
                        let _ = sink.send(Message::Pong(data)).await;
                    }
                    Some(Ok(Message::Pong(_))) => {
                        idle_deadline = tokio::time::Instant::now() + idle_timeout;
                    }
                    Some(Ok(Message::Close(frame))) => {
                        if let Some(frame) = frame {
                            tracing::info!(code = %frame.code, reason = %frame.reason, "ws close");
                        } else {
                            tracing::info!("ws close");
                        }
                        break;
                    }
                    None => {
                        tracing::info!("ws stream ended");
                        break;
                    }
                    Some(Err(e)) => {
                        tracing::warn!("ws error: {e}");
                        break;
                    }
                }
            }
            _ = heartbeat.tick() => {
                if sink.send(Message::Ping(Vec::new().into())).await.is_err() {
                    break;
                }
            }
            _ = tokio::time::sleep_until(idle_deadline) => {
                tracing::info!("idle timeout");
                send_close(sink, CLOSE_IDLE, "idle timeout").await;
                break;
            }
            change = changes.recv() => {
                match change {
                    Ok(change) => {
                        forward_change(sink, &topics, &*backend, &conn.profile, change).await
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        // Dropped changes cannot be replayed; the client resyncs on reconnect.
                        tracing::warn!(skipped, "change stream lagged");
                        send_close(sink, CLOSE_LAGGED, "event stream lagged").await;
                        break;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }
    }
}

/// Send a change to the client if it subscribed to the room's topic and
/// may still read the room. Access is checked per change so wildcard
/// patterns and memberships that ended after subscribing both stay
/// inside the caller's rooms.
async fn forward_change(
    sink: &mut WsSink,
    topics: &TopicFilter,
    backend: &dyn ChatBackend,
    caller: &Profile,
    change: MessageChange,
) {
    let room_id = change.room_id();
    let topic = room_topic(room_id);
    if !topics.matches(&topic) {
        return;
    }
    if let Err(e) = check_room_access(backend, caller, room_id).await {
        tracing::trace!(%topic, error = %e, "change withheld");
        return;
    }
    let params = match serde_json::to_value(&change) {
        Ok(v) => v,
        Err(e) => {
            tracing::warn!(%topic, "failed to encode change: {e}");
            return;
        }
    };
    tracing::debug!(%topic, op = change.op(), "forwarding change");
    let evt = ProtoMessage::Event(Event::new(topic, Some(params)));
    if let Ok(json) = encode_message(&evt) {
        let _ = sink.send(Message::Text(json.into())).await;
    }
}

async fn handle_text_message(
    text: &str,
    conn: &Connection,
    backend: &dyn ChatBackend,
    router: &mut MessageRouter,
    topics: &mut TopicFilter,
) -> Option<Response> {
    let req = match decode_message(text) {
        Ok(ProtoMessage::Request(req)) => req,
        Ok(other) => {
            tracing::debug!(?other, "non-request message from client (ignored)");
            return None;
        }
        Err(e) => {
            tracing::warn!("failed to decode message: {e}");
            return None;
        }
    };
    tracing::debug!(method = %req.method, id = %req.id, "request");

    let resp = match req.method.as_str() {
        "messages.subscribe" => {
            handle_room_subscribe(req.id, req.params, &conn.profile, backend, topics).await
        }
        "messages.unsubscribe" | "events.unsubscribe" => {
            handle_unsubscribe(req.id, req.params, topics)
        }
        "events.subscribe" => handle_subscribe(req.id, req.params, topics),
        _ => router.route_request(req.id, &req.method, req.params).await,
    };
    Some(resp)
}

#[derive(Debug, Deserialize)]
struct RoomSubscribeParams {
    room_id: RoomId,
}

/// Handle `messages.subscribe`: start forwarding one room's changes.
///
/// Params: `{ "room_id": "<uuid>" }`
/// Returns: `{ "subscription_id": "<uuid>", "topic": "room.<uuid>.messages" }`
async fn handle_room_subscribe(
    req_id: Uuid,
    params: Option<Value>,
    caller: &Profile,
    backend: &dyn ChatBackend,
    topics: &mut TopicFilter,
) -> Response {
    let params = match params.map(serde_json::from_value::<RoomSubscribeParams>) {
        Some(Ok(p)) => p,
        Some(Err(e)) => {
            return Response::error(
                req_id,
                error_codes::INVALID_PARAMS,
                format!("invalid params: {e}"),
            )
        }
        None => return Response::error(req_id, error_codes::INVALID_PARAMS, "missing params"),
    };
    if let Err(e) = check_room_access(backend, caller, params.room_id).await {
        return backend_error(req_id, &e);
    }
    let topic = room_topic(params.room_id);
    let sub_id = topics.subscribe(topic.clone());
    tracing::debug!(%sub_id, %topic, active = topics.len(), "room subscribed");
    Response::success(req_id, json!({ "subscription_id": sub_id, "topic": topic }))
}

/// Handle `events.subscribe`: add a raw topic pattern. Room changes are
/// still limited to rooms the caller can read.
///
/// Params: `{ "topic": "room.*" }` or `{ "topic": "*" }`
fn handle_subscribe(req_id: Uuid, params: Option<Value>, topics: &mut TopicFilter) -> Response {
    let topic = params
        .as_ref()
        .and_then(|p| p.get("topic"))
        .and_then(|v| v.as_str());

    match topic {
        Some(pattern) => {
            let sub_id = topics.subscribe(pattern);
            tracing::debug!(%sub_id, pattern, "subscribed");
            Response::success(req_id, json!({ "subscription_id": sub_id }))
        }
        None => Response::error(
            req_id,
            error_codes::INVALID_PARAMS,
            "missing 'topic' parameter",
        ),
    }
}

/// Params: `{ "subscription_id": "<uuid>" }`
fn handle_unsubscribe(req_id: Uuid, params: Option<Value>, topics: &mut TopicFilter) -> Response {
    let sub_id = params
        .as_ref()
        .and_then(|p| p.get("subscription_id"))
        .and_then(|v| v.as_str())
        .and_then(|s| s.parse::<Uuid>().ok());

    match sub_id {
        Some(id) if topics.unsubscribe(id) => {
            tracing::debug!(%id, remaining = topics.len(), "unsubscribed");
            Response::success(req_id, json!({ "ok": true }))
        }
        Some(_) => Response::error(
            req_id,
            error_codes::INVALID_PARAMS,
            "subscription not found",
        ),
        None => Response::error(
            req_id,
            error_codes::INVALID_PARAMS,
            "missing or invalid 'subscription_id'",
        ),
    }
}

async fn send_response(sink: &mut WsSink, resp: Response) {
    let msg = ProtoMessage::Response(resp);
    if let Ok(json) = encode_message(&msg) {
        let _ = sink.send(Message::Text(json.into())).await;
    }
}

async fn send_close(sink: &mut WsSink, code: u16, reason: &str) {
    let _ = sink
        .send(Message::Close(Some(CloseFrame {
            code,
            reason: reason.into(),
        })))
        .await;
}

async fn send_reject(sink: &mut WsSink, code: HelloRejectCode, reason: &str) {
    let reject = HandshakeResponse::Reject(HelloReject {
        code,
        reason: reason.into(),
    });
    if let Ok(json) = serde_json::to_string(&reject) {
        let _ = sink.send(Message::Text(json.into())).await;
    }
    send_close(sink, CLOSE_REJECTED, reason).await;
}
