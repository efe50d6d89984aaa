//! Scripted in-process `ChatBackend` shared by the kernel integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use mattergate_channels::backend::{ChatBackend, EventStream};
use mattergate_types::config::GatewayConfig;
use mattergate_types::error::BackendError;
use mattergate_types::message::{
    ChannelType, Identity, InboundEvent, InboundPost, Post, PostRequest, Team,
};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_stream::wrappers::ReceiverStream;

pub const BOT_ID: &str = "bot-1";

pub fn config() -> GatewayConfig {
    GatewayConfig::new("https://chat.example.com", "test-token").unwrap()
}

pub fn transient() -> BackendError {
    BackendError::Status {
        status: 503,
        message: "unavailable".to_string(),
    }
}

pub fn not_found() -> BackendError {
    BackendError::Status {
        status: 404,
        message: "channel not found".to_string(),
    }
}

#[derive(Default)]
pub struct MockBackend {
    /// Returned by `authenticate` while set.
    pub auth_error: Mutex<Option<BackendError>>,
    /// Artificial latency for `authenticate`.
    pub auth_delay: Mutex<Option<Duration>>,
    /// Errors `create_post` returns for a channel before succeeding.
    pub post_failures: Mutex<HashMap<String, VecDeque<BackendError>>>,
    /// Errors `create_post` returns for a channel on every attempt.
    pub post_always_fails: Mutex<HashMap<String, BackendError>>,
    /// Artificial latency for `create_post`.
    pub post_delay: Mutex<Option<Duration>>,
    /// Every `create_post` request, in call order.
    pub posts: Mutex<Vec<PostRequest>>,
    /// When each `create_post` call started.
    pub post_times: Mutex<Vec<Instant>>,
    /// Errors `create_direct_channel` returns before succeeding.
    pub dm_failures: Mutex<VecDeque<BackendError>>,
    pub dm_calls: AtomicU32,
    pub auth_calls: AtomicU32,
    pub streams_opened: AtomicU32,
    /// `create_post` calls currently running and the most seen at once.
    pub active_posts: AtomicU32,
    pub peak_posts: AtomicU32,
    pub teams: Mutex<Vec<Team>>,
    streams: Mutex<Vec<mpsc::Sender<Result<InboundEvent, BackendError>>>>,
}

impl MockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_auth(&self, err: Option<BackendError>) {
        *self.auth_error.lock().unwrap() = err;
    }

    pub fn fail_posts(&self, channel: &str, errors: Vec<BackendError>) {
        self.post_failures
            .lock()
            .unwrap()
            .insert(channel.to_string(), errors.into());
    }

    pub fn always_fail_posts(&self, channel: &str, err: BackendError) {
        self.post_always_fails
            .lock()
            .unwrap()
            .insert(channel.to_string(), err);
    }

    pub fn set_auth_delay(&self, delay: Duration) {
        *self.auth_delay.lock().unwrap() = Some(delay);
    }

    pub fn post_times(&self) -> Vec<Instant> {
        self.post_times.lock().unwrap().clone()
    }

    pub fn set_post_delay(&self, delay: Duration) {
        *self.post_delay.lock().unwrap() = Some(delay);
    }

    pub fn posts(&self) -> Vec<PostRequest> {
        self.posts.lock().unwrap().clone()
    }

    pub fn posts_to(&self, channel: &str) -> Vec<PostRequest> {
        self.posts()
            .into_iter()
            .filter(|p| p.channel_id == channel)
            .collect()
    }

    /// Drop every open event stream, as if the server went away.
    pub fn drop_connection(&self) {
        self.streams.lock().unwrap().clear();
    }

    /// Push a `posted` event onto every open stream.
    pub async fn push_post(&self, user_id: &str, channel_id: &str, message: &str) {
        let event = InboundEvent::Posted(InboundPost {
            post: Post {
                id: format!("in-{message}"),
                channel_id: channel_id.to_string(),
                user_id: user_id.to_string(),
                message: message.to_string(),
                ..Post::default()
            },
            channel_type: ChannelType::Open,
            sender_name: user_id.to_string(),
        });
        let senders = self.streams.lock().unwrap().clone();
        for tx in senders {
            let _ = tx.send(Ok(event.clone())).await;
        }
    }
}

#[async_trait]
impl ChatBackend for MockBackend {
    fn name(&self) -> &str {
        "mock"
    }

    async fn authenticate(&self) -> Result<Identity, BackendError> {
        self.auth_calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.auth_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(err) = self.auth_error.lock().unwrap().clone() {
            return Err(err);
        }
        Ok(Identity {
            user_id: BOT_ID.to_string(),
            username: "gatebot".to_string(),
        })
    }

    async fn list_teams(&self) -> Result<Vec<Team>, BackendError> {
        Ok(self.teams.lock().unwrap().clone())
    }

    async fn create_post(&self, request: &PostRequest) -> Result<Post, BackendError> {
        self.posts.lock().unwrap().push(request.clone());
        self.post_times.lock().unwrap().push(Instant::now());
        let active = self.active_posts.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_posts.fetch_max(active, Ordering::SeqCst);
        let delay = *self.post_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.active_posts.fetch_sub(1, Ordering::SeqCst);

        if let Some(err) = self
            .post_always_fails
            .lock()
            .unwrap()
            .get(&request.channel_id)
            .cloned()
        {
            return Err(err);
        }
        let scripted = self
            .post_failures
            .lock()
            .unwrap()
            .get_mut(&request.channel_id)
            .and_then(|errors| errors.pop_front());
        if let Some(err) = scripted {
            return Err(err);
        }

        let n = self.posts.lock().unwrap().len();
        Ok(Post {
            id: format!("post-{n}"),
            channel_id: request.channel_id.clone(),
            user_id: BOT_ID.to_string(),
            message: request.message.clone(),
            root_id: request.root_id.clone().unwrap_or_default(),
            create_at: 1_700_000_000_000 + n as i64,
            pending_post_id: request.idempotency_key.as_str().to_string(),
        })
    }

    async fn create_direct_channel(&self, user_ids: [&str; 2]) -> Result<String, BackendError> {
        self.dm_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.dm_failures.lock().unwrap().pop_front() {
            return Err(err);
        }
        Ok(format!("dm-{}-{}", user_ids[0], user_ids[1]))
    }

    async fn open_event_stream(&self) -> Result<EventStream, BackendError> {
        self.streams_opened.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::channel(16);
        self.streams.lock().unwrap().push(tx);
        Ok(Box::pin(ReceiverStream::new(rx)))
    }
}
