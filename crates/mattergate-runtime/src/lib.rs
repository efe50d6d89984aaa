//! Runtime primitives for the Mattergate delivery gateway.
//!
//! Backoff and retry, the delivery concurrency lane, and the graceful
//! shutdown coordinator. No network code lives here.

pub mod delivery_lane;
pub mod graceful_shutdown;
pub mod retry;
