//! Mattermost backend.
//!
//! Uses the REST API v4 for posts, identity and direct channels, and the
//! WebSocket API v4 for real-time `posted` events. No external Mattermost
//! crate — just `reqwest` + `tokio-tungstenite`.

use crate::backend::{ChatBackend, EventStream};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use mattergate_types::config::GatewayConfig;
use mattergate_types::error::BackendError;
use mattergate_types::message::{
    ChannelType, Identity, InboundEvent, InboundPost, Post, PostRequest, Team,
};
use serde::Deserialize;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

/// Buffered decoded events between the socket reader and the consumer.
const EVENT_BUFFER: usize = 256;

/// Mattermost REST + WebSocket API v4 backend.
pub struct MattermostBackend {
    /// Server base URL, no trailing slash.
    server_url: String,
    /// SECURITY: Auth token is zeroized on drop to prevent memory disclosure.
    token: Zeroizing<String>,
    client: reqwest::Client,
    /// Bound on the WebSocket handshake.
    connect_timeout: Duration,
}

#[derive(Deserialize)]
struct UserResponse {
    id: String,
    #[serde(default)]
    username: String,
}

#[derive(Deserialize)]
struct ChannelResponse {
    id: String,
}

#[derive(Deserialize)]
struct ApiErrorBody {
    #[serde(default)]
    message: String,
}

impl MattermostBackend {
    /// Build a backend from validated settings.
    pub fn new(config: &GatewayConfig) -> Result<Self, BackendError> {
        let client = reqwest::Client::builder()
            .timeout(config.delivery.request_timeout)
            .build()
            .map_err(|e| BackendError::Transport(format!("HTTP client setup failed: {e}")))?;
        Ok(Self {
            server_url: config.base_url().to_string(),
            token: config.token.clone(),
            client,
            connect_timeout: config.delivery.request_timeout,
        })
    }

    fn api_url(&self, path: &str) -> String {
        format!("{}/api/v4/{}", self.server_url, path.trim_start_matches('/'))
    }

    /// Build the WebSocket URL for the Mattermost API v4.
    fn ws_url(&self) -> String {
        let base = if self.server_url.starts_with("https://") {
            self.server_url.replacen("https://", "wss://", 1)
        } else if self.server_url.starts_with("http://") {
            self.server_url.replacen("http://", "ws://", 1)
        } else {
            format!("wss://{}", self.server_url)
        };
        format!("{base}/api/v4/websocket")
    }

    async fn send_json<T: for<'de> Deserialize<'de>>(
        &self,
        request: reqwest::RequestBuilder,
    ) -> Result<T, BackendError> {
        let resp = request
            .bearer_auth(self.token.as_str())
            .send()
            .await
            .map_err(map_reqwest_error)?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(status_error(status.as_u16(), &body));
        }

        resp.json::<T>().await.map_err(map_reqwest_error)
    }
}

/// Translate transport-level reqwest failures.
fn map_reqwest_error(err: reqwest::Error) -> BackendError {
    if err.is_timeout() {
        BackendError::Timeout
    } else if err.is_decode() {
        BackendError::Protocol(err.to_string())
    } else {
        BackendError::Transport(err.to_string())
    }
}

/// Build a status error, preferring Mattermost's `{"message": ...}` body.
fn status_error(status: u16, body: &str) -> BackendError {
    let message = serde_json::from_str::<ApiErrorBody>(body)
        .ok()
        .map(|b| b.message)
        .filter(|m| !m.is_empty())
        .unwrap_or_else(|| body.to_string());
    BackendError::Status { status, message }
}

/// Parse a Mattermost WebSocket frame into an event.
///
/// The `data.post` field of a `posted` event is a JSON string that needs a
/// second parse. Everything other than non-empty posts is ignored.
pub fn parse_posted_event(payload: &serde_json::Value) -> Option<InboundEvent> {
    if payload["event"].as_str() != Some("posted") {
        return None;
    }

    let post_str = payload["data"]["post"].as_str()?;
    let post: Post = match serde_json::from_str(post_str) {
        Ok(p) => p,
        Err(e) => {
            warn!("Mattermost: undecodable post payload: {e}");
            return None;
        }
    };
    if post.message.is_empty() {
        return None;
    }

    let channel_type = ChannelType::from_code(payload["data"]["channel_type"].as_str().unwrap_or(""));
    let sender_name = payload["data"]["sender_name"]
        .as_str()
        .map(|s| s.trim_start_matches('@'))
        .filter(|s| !s.is_empty())
        .unwrap_or(&post.user_id)
        .to_string();

    Some(InboundEvent::Posted(InboundPost {
        post,
        channel_type,
        sender_name,
    }))
}

#[async_trait]
impl ChatBackend for MattermostBackend {
    fn name(&self) -> &str {
        "mattermost"
    }

    async fn authenticate(&self) -> Result<Identity, BackendError> {
        let user: UserResponse = self
            .send_json(self.client.get(self.api_url("users/me")))
            .await?;
        debug!(user_id = %user.id, "Mattermost token validated");
        Ok(Identity {
            user_id: user.id,
            username: user.username,
        })
    }

    async fn list_teams(&self) -> Result<Vec<Team>, BackendError> {
        self.send_json(self.client.get(self.api_url("users/me/teams")))
            .await
    }

    async fn create_post(&self, request: &PostRequest) -> Result<Post, BackendError> {
        self.send_json(self.client.post(self.api_url("posts")).json(request))
            .await
    }

    async fn create_direct_channel(&self, user_ids: [&str; 2]) -> Result<String, BackendError> {
        let channel: ChannelResponse = self
            .send_json(self.client.post(self.api_url("channels/direct")).json(&user_ids))
            .await?;
        Ok(channel.id)
    }

    async fn open_event_stream(&self) -> Result<EventStream, BackendError> {
        let ws_url = self.ws_url();
        debug!("Connecting to Mattermost WebSocket at {ws_url}");

        let (ws_stream, _) =
            tokio::time::timeout(self.connect_timeout, tokio_tungstenite::connect_async(&ws_url))
                .await
                .map_err(|_| BackendError::Timeout)?
                .map_err(|e| BackendError::Transport(format!("WebSocket connect failed: {e}")))?;

        let (mut ws_tx, mut ws_rx) = ws_stream.split();

        // Authenticate over WebSocket with the token
        let auth_msg = serde_json::json!({
            "seq": 1,
            "action": "authentication_challenge",
            "data": { "token": self.token.as_str() }
        });
        ws_tx
            .send(Message::Text(auth_msg.to_string()))
            .await
            .map_err(|e| BackendError::Transport(format!("WebSocket auth send failed: {e}")))?;

        let (tx, rx) = mpsc::channel::<Result<InboundEvent, BackendError>>(EVENT_BUFFER);

        tokio::spawn(async move {
            loop {
                let msg = tokio::select! {
                    msg = ws_rx.next() => msg,
                    _ = tx.closed() => {
                        debug!("Mattermost event consumer gone, closing WebSocket");
                        let _ = ws_tx.close().await;
                        return;
                    }
                };

                let text = match msg {
                    Some(Ok(Message::Text(t))) => t,
                    Some(Ok(Message::Close(_))) | None => {
                        info!("Mattermost WebSocket closed");
                        return;
                    }
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        let _ = tx
                            .send(Err(BackendError::Transport(format!(
                                "WebSocket error: {e}"
                            ))))
                            .await;
                        return;
                    }
                };

                let payload: serde_json::Value = match serde_json::from_str(&text) {
                    Ok(v) => v,
                    Err(e) => {
                        warn!("Mattermost: failed to parse frame: {e}");
                        continue;
                    }
                };

                // Replies to our own actions carry a status instead of an event
                if let Some(status) = payload.get("status").and_then(|s| s.as_str()) {
                    if status == "OK" {
                        debug!("Mattermost WebSocket authentication successful");
                    } else {
                        warn!("Mattermost WebSocket auth response: {status}");
                        let _ = tx
                            .send(Err(BackendError::Status {
                                status: 401,
                                message: format!("WebSocket authentication {status}"),
                            }))
                            .await;
                        return;
                    }
                    continue;
                }

                if let Some(event) = parse_posted_event(&payload) {
                    if tx.send(Ok(event)).await.is_err() {
                        return;
                    }
                }
            }
        });

        Ok(Box::pin(tokio_stream::wrappers::ReceiverStream::new(rx)))
    }
}
