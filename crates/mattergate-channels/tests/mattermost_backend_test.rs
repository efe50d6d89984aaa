//! Integration tests for `MattermostBackend` against an in-process mock
//! Mattermost server (axum), covering REST calls, status mapping and the
//! WebSocket event stream.

use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::StreamExt;
use mattergate_channels::{ChatBackend, MattermostBackend};
use mattergate_types::config::GatewayConfig;
use mattergate_types::error::BackendError;
use mattergate_types::message::{InboundEvent, OutboundMessage};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

const TOKEN: &str = "test-token";

#[derive(Clone, Default)]
struct MockServer {
    /// Bodies received on `POST /api/v4/posts`.
    posts: Arc<Mutex<Vec<Value>>>,
}

fn authorized(headers: &HeaderMap) -> bool {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .map(|v| v == format!("Bearer {TOKEN}"))
        .unwrap_or(false)
}

fn unauthorized() -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(json!({ "id": "api.context.session_expired.app_error", "message": "Invalid or expired session" })),
    )
        .into_response()
}

async fn me(headers: HeaderMap) -> Response {
    if !authorized(&headers) {
        return unauthorized();
    }
    Json(json!({ "id": "bot-1", "username": "gatebot" })).into_response()
}

async fn my_teams(headers: HeaderMap) -> Response {
    if !authorized(&headers) {
        return unauthorized();
    }
    Json(json!([{ "id": "t1", "name": "eng", "display_name": "Engineering" }])).into_response()
}

async fn create_post(
    State(server): State<MockServer>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    if !authorized(&headers) {
        return unauthorized();
    }
    server.posts.lock().unwrap().push(body.clone());

    match body["channel_id"].as_str().unwrap_or("") {
        "missing" => (
            StatusCode::NOT_FOUND,
            Json(json!({ "message": "Unable to find the channel" })),
        )
            .into_response(),
        "flaky" => (StatusCode::SERVICE_UNAVAILABLE, "upstream unavailable").into_response(),
        channel => Json(json!({
            "id": "post-1",
            "channel_id": channel,
            "user_id": "bot-1",
            "message": body["message"],
            "create_at": 1_700_000_000_000i64,
            "pending_post_id": body["pending_post_id"],
        }))
        .into_response(),
    }
}

async fn direct_channel(headers: HeaderMap, Json(ids): Json<Vec<String>>) -> Response {
    if !authorized(&headers) {
        return unauthorized();
    }
    Json(json!({ "id": format!("dm-{}-{}", ids[0], ids[1]) })).into_response()
}

async fn websocket(ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(|socket| serve_socket(socket))
}

async fn serve_socket(mut socket: WebSocket) {
    let Some(Ok(WsMessage::Text(auth))) = socket.recv().await else {
        return;
    };
    let auth: Value = serde_json::from_str(auth.as_str()).unwrap();
    let ok = auth["action"] == "authentication_challenge" && auth["data"]["token"] == TOKEN;
    let reply = json!({ "status": if ok { "OK" } else { "FAIL" }, "seq_reply": 1 });
    if socket.send(WsMessage::Text(reply.to_string().into())).await.is_err() || !ok {
        return;
    }

    let hello = json!({ "event": "hello", "data": { "server_version": "9.11" } });
    let post = json!({
        "id": "in-1",
        "user_id": "user-9",
        "channel_id": "ch-1",
        "message": "ping",
        "root_id": ""
    });
    let posted = json!({
        "event": "posted",
        "data": { "post": post.to_string(), "channel_type": "O", "sender_name": "@alice" }
    });
    let _ = socket.send(WsMessage::Text(hello.to_string().into())).await;
    let _ = socket.send(WsMessage::Text(posted.to_string().into())).await;
    let _ = socket.send(WsMessage::Close(None)).await;
}

async fn spawn_server() -> (SocketAddr, MockServer) {
    let server = MockServer::default();
    let app = Router::new()
        .route("/api/v4/users/me", get(me))
        .route("/api/v4/users/me/teams", get(my_teams))
        .route("/api/v4/posts", post(create_post))
        .route("/api/v4/channels/direct", post(direct_channel))
        .route("/api/v4/websocket", get(websocket))
        .with_state(server.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (addr, server)
}

fn backend_for(addr: SocketAddr, token: &str) -> MattermostBackend {
    let config = GatewayConfig::new(&format!("http://{addr}"), token).unwrap();
    MattermostBackend::new(&config).unwrap()
}

#[tokio::test]
async fn test_authenticate_returns_identity() {
    let (addr, _) = spawn_server().await;
    let identity = backend_for(addr, TOKEN).authenticate().await.unwrap();
    assert_eq!(identity.user_id, "bot-1");
    assert_eq!(identity.username, "gatebot");
}

#[tokio::test]
async fn test_bad_token_is_an_auth_rejection() {
    let (addr, _) = spawn_server().await;
    let err = backend_for(addr, "wrong").authenticate().await.unwrap_err();
    assert!(err.is_auth_rejection());
    assert!(!err.is_transient());
    assert!(matches!(err, BackendError::Status { ref message, .. } if message == "Invalid or expired session"));
}

#[tokio::test]
async fn test_list_teams() {
    let (addr, _) = spawn_server().await;
    let teams = backend_for(addr, TOKEN).list_teams().await.unwrap();
    assert_eq!(teams.len(), 1);
    assert_eq!(teams[0].name, "eng");
}

#[tokio::test]
async fn test_create_post_sends_idempotency_key() {
    let (addr, server) = spawn_server().await;
    let message = OutboundMessage::to_channel("ch-1", "hello").in_thread("root-1");

    let post = backend_for(addr, TOKEN)
        .create_post(&message.post_request())
        .await
        .unwrap();
    assert_eq!(post.id, "post-1");
    assert_eq!(post.channel_id, "ch-1");
    assert_eq!(post.create_at, 1_700_000_000_000);
    assert_eq!(post.pending_post_id, message.idempotency_key.as_str());

    let received = server.posts.lock().unwrap().clone();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0]["message"], "hello");
    assert_eq!(received[0]["root_id"], "root-1");
    assert_eq!(
        received[0]["pending_post_id"],
        message.idempotency_key.as_str()
    );
}

#[tokio::test]
async fn test_create_post_status_classification() {
    let (addr, _) = spawn_server().await;
    let backend = backend_for(addr, TOKEN);

    let missing = backend
        .create_post(&OutboundMessage::to_channel("missing", "x").post_request())
        .await
        .unwrap_err();
    assert!(!missing.is_transient());
    assert!(matches!(missing, BackendError::Status { status: 404, .. }));

    let flaky = backend
        .create_post(&OutboundMessage::to_channel("flaky", "x").post_request())
        .await
        .unwrap_err();
    assert!(flaky.is_transient());
}

#[tokio::test]
async fn test_create_direct_channel() {
    let (addr, _) = spawn_server().await;
    let channel = backend_for(addr, TOKEN)
        .create_direct_channel(["bot-1", "user-9"])
        .await
        .unwrap();
    assert_eq!(channel, "dm-bot-1-user-9");
}

#[tokio::test]
async fn test_unreachable_server_is_transient() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let err = backend_for(addr, TOKEN).authenticate().await.unwrap_err();
    assert!(err.is_transient(), "expected transient error, got {err:?}");
}

#[tokio::test]
async fn test_event_stream_yields_posted_events_then_ends() {
    let (addr, _) = spawn_server().await;
    let mut events = backend_for(addr, TOKEN).open_event_stream().await.unwrap();

    match events.next().await {
        Some(Ok(InboundEvent::Posted(post))) => {
            assert_eq!(post.post.id, "in-1");
            assert_eq!(post.post.message, "ping");
            assert_eq!(post.sender_name, "alice");
        }
        other => panic!("expected posted event, got {other:?}"),
    }
    // Server closes after one event
    assert!(events.next().await.is_none());
}

#[tokio::test]
async fn test_event_stream_reports_rejected_token() {
    let (addr, _) = spawn_server().await;
    let mut events = backend_for(addr, "wrong").open_event_stream().await.unwrap();

    match events.next().await {
        Some(Err(err)) => assert!(err.is_auth_rejection()),
        other => panic!("expected auth error, got {other:?}"),
    }
}
