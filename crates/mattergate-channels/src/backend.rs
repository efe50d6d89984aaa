//! The chat backend seam.
//!
//! The kernel talks to the server only through `ChatBackend`, so tests can
//! substitute an in-process backend and the Mattermost implementation stays
//! a leaf.

use async_trait::async_trait;
use futures::Stream;
use mattergate_types::error::{BackendError, ConnectError};
use mattergate_types::message::{Identity, InboundEvent, Post, PostRequest, Team};
use std::pin::Pin;

/// Decoded real-time events. The stream ending (or yielding an error) means
/// the event connection is gone.
pub type EventStream = Pin<Box<dyn Stream<Item = Result<InboundEvent, BackendError>> + Send>>;

/// REST + event-stream operations the gateway needs from a chat server.
#[async_trait]
pub trait ChatBackend: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &str;

    /// Validate the credentials and return the account they belong to.
    async fn authenticate(&self) -> Result<Identity, BackendError>;

    /// Teams the authenticated account belongs to.
    async fn list_teams(&self) -> Result<Vec<Team>, BackendError> {
        Ok(Vec::new())
    }

    /// Resolve the team to operate in; see [`select_team`].
    async fn resolve_team(&self, wanted: Option<&str>) -> Result<Option<Team>, ConnectError> {
        let teams = self.list_teams().await?;
        select_team(teams, wanted)
    }

    /// Create a post. The request's idempotency key must be forwarded so a
    /// deduplicating server drops repeated attempts.
    async fn create_post(&self, request: &PostRequest) -> Result<Post, BackendError>;

    /// Get or create the direct channel between two users; returns its ID.
    async fn create_direct_channel(&self, user_ids: [&str; 2]) -> Result<String, BackendError>;

    /// Open the real-time event connection.
    async fn open_event_stream(&self) -> Result<EventStream, BackendError>;
}

/// Pick the team to operate in.
///
/// A configured name must match a team's `name` (case-insensitive) or its
/// display name. Without a configured name the first team wins; an account
/// in no team yields `None`.
pub fn select_team(teams: Vec<Team>, wanted: Option<&str>) -> Result<Option<Team>, ConnectError> {
    match wanted {
        None => Ok(teams.into_iter().next()),
        Some(name) => teams
            .into_iter()
            .find(|t| t.name.eq_ignore_ascii_case(name) || t.display_name == name)
            .map(Some)
            .ok_or_else(|| ConnectError::TeamNotFound(name.to_string())),
    }
}
