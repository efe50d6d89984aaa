//! Mattergate kernel: keeps the Mattermost connection alive and delivers
//! outbound messages at least once, in order per target.
//!
//! - [`supervisor::ConnectionSupervisor`] owns the REST + event-stream pair
//!   and reconnects with backoff.
//! - [`queue::OutboundQueue`] serializes delivery per target and retries
//!   transient failures under one idempotency key.
//! - [`gateway::DeliveryGateway`] is the facade hosts call.
//! - [`service::MattermostClient`] wires the gateway into a host runtime.

pub mod config;
pub mod error;
pub mod gateway;
pub mod queue;
pub mod service;
pub mod supervisor;

pub use error::{GatewayError, GatewayResult};
pub use gateway::{DeliveryGateway, HealthStatus};
pub use queue::{DeliveryTicket, OutboundQueue};
pub use service::{ClientInterface, HostRuntime, MattermostClient, ServiceHandle};
pub use supervisor::{ConnectionHandle, ConnectionState, ConnectionStatus, ConnectionSupervisor};
