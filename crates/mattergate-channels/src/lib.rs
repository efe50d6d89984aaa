//! Chat backends for the Mattergate delivery gateway.
//!
//! `ChatBackend` is the seam the kernel drives; `MattermostBackend` speaks the
//! Mattermost REST and WebSocket APIs v4.

pub mod backend;
pub mod mattermost;

pub use backend::{ChatBackend, EventStream};
pub use mattermost::MattermostBackend;
