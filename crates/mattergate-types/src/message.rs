//! Outbound and inbound message types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Maximum Mattermost post length (characters). The server limit is 16383.
pub const MAX_POST_LEN: usize = 16383;

/// How the target of an outbound message is addressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    /// `target` is a channel ID.
    Channel,
    /// `target` is a user ID that still needs a direct channel.
    Direct,
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Channel => write!(f, "channel"),
            Self::Direct => write!(f, "direct"),
        }
    }
}

/// Opaque token sent with every attempt of the same logical message so the
/// server can deduplicate retries.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdempotencyKey(String);

impl IdempotencyKey {
    /// Generate a fresh random key.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    /// Use a caller-supplied key.
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A message waiting to be delivered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundMessage {
    /// Channel ID (or user ID for unresolved direct messages).
    pub target: String,
    /// Message text.
    pub body: String,
    pub kind: MessageKind,
    /// Number of delivery attempts made so far.
    pub attempt_count: u32,
    pub enqueued_at: DateTime<Utc>,
    pub idempotency_key: IdempotencyKey,
    /// Root post ID when replying inside a thread.
    pub root_id: Option<String>,
}

impl OutboundMessage {
    /// A message for a channel, with a generated idempotency key.
    pub fn to_channel(channel_id: impl Into<String>, body: impl Into<String>) -> Self {
        Self::new(channel_id, body, MessageKind::Channel)
    }

    /// A message for a user that has not been resolved to a channel yet.
    pub fn to_user(user_id: impl Into<String>, body: impl Into<String>) -> Self {
        Self::new(user_id, body, MessageKind::Direct)
    }

    fn new(target: impl Into<String>, body: impl Into<String>, kind: MessageKind) -> Self {
        Self {
            target: target.into(),
            body: body.into(),
            kind,
            attempt_count: 0,
            enqueued_at: Utc::now(),
            idempotency_key: IdempotencyKey::generate(),
            root_id: None,
        }
    }

    /// Replace the generated idempotency key with a caller-supplied one.
    pub fn with_idempotency_key(mut self, key: IdempotencyKey) -> Self {
        self.idempotency_key = key;
        self
    }

    /// Post the message as a reply under `root_id`.
    pub fn in_thread(mut self, root_id: impl Into<String>) -> Self {
        self.root_id = Some(root_id.into());
        self
    }

    /// Re-address a direct message to the channel it resolved to.
    pub fn into_channel(mut self, channel_id: impl Into<String>) -> Self {
        self.target = channel_id.into();
        self.kind = MessageKind::Channel;
        self
    }

    /// Build the backend request for the next attempt.
    pub fn post_request(&self) -> PostRequest {
        PostRequest {
            channel_id: self.target.clone(),
            message: self.body.clone(),
            root_id: self.root_id.clone(),
            idempotency_key: self.idempotency_key.clone(),
        }
    }
}

/// The payload of a single `create_post` call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostRequest {
    pub channel_id: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub root_id: Option<String>,
    /// Sent to Mattermost as `pending_post_id`.
    #[serde(rename = "pending_post_id")]
    pub idempotency_key: IdempotencyKey,
}

/// A post as returned by the server.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Post {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub channel_id: String,
    #[serde(default)]
    pub user_id: String,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub root_id: String,
    /// Server-assigned creation time (epoch millis).
    #[serde(default)]
    pub create_at: i64,
    #[serde(default)]
    pub pending_post_id: String,
}

/// Acknowledgment of a delivered message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ack {
    /// Server-assigned post ID.
    pub post_id: String,
    pub channel_id: String,
    /// Server-assigned creation time (epoch millis).
    pub create_at: i64,
    pub idempotency_key: IdempotencyKey,
    /// Attempts used, including the successful one.
    pub attempts: u32,
}

impl Ack {
    pub fn from_post(post: Post, message: &OutboundMessage) -> Self {
        Self {
            post_id: post.id,
            channel_id: if post.channel_id.is_empty() {
                message.target.clone()
            } else {
                post.channel_id
            },
            create_at: post.create_at,
            idempotency_key: message.idempotency_key.clone(),
            attempts: message.attempt_count,
        }
    }
}

/// The authenticated account the gateway acts as.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub user_id: String,
    pub username: String,
}

/// A Mattermost team.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Team {
    pub id: String,
    /// URL-safe team name.
    pub name: String,
    #[serde(default)]
    pub display_name: String,
}

/// Mattermost channel type code carried by `posted` events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChannelType {
    /// `O`
    Open,
    /// `P`
    Private,
    /// `D`
    Direct,
    /// `G`
    Group,
    Unknown,
}

impl ChannelType {
    pub fn from_code(code: &str) -> Self {
        match code {
            "O" => Self::Open,
            "P" => Self::Private,
            "D" => Self::Direct,
            "G" => Self::Group,
            _ => Self::Unknown,
        }
    }
}

/// A post received over the event stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboundPost {
    pub post: Post,
    pub channel_type: ChannelType,
    /// Display name of the sender (falls back to the user ID).
    pub sender_name: String,
}

impl InboundPost {
    pub fn is_direct(&self) -> bool {
        self.channel_type == ChannelType::Direct
    }

    /// Whether the post is a reply inside a thread.
    pub fn thread_root(&self) -> Option<&str> {
        if self.post.root_id.is_empty() {
            None
        } else {
            Some(&self.post.root_id)
        }
    }
}

/// Events decoded from the real-time stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum InboundEvent {
    /// A new post was created in a channel the account can see.
    Posted(InboundPost),
}
