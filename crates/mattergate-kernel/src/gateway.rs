//! Delivery gateway: the facade hosts use to send messages and check health.

use crate::queue::{DeliveryTicket, OutboundQueue, QueueStats};
use crate::supervisor::{ConnectionStatus, ConnectionSupervisor, InboundEvents};
use dashmap::DashMap;
use mattergate_channels::backend::ChatBackend;
use mattergate_runtime::graceful_shutdown::{
    ShutdownConfig, ShutdownCoordinator, ShutdownPhase, ShutdownStatus,
};
use mattergate_runtime::retry::{retry_async, RetryConfig, RetryOutcome};
use mattergate_types::config::GatewayConfig;
use mattergate_types::error::{BackendError, DeliveryError, DeliveryResult};
use mattergate_types::message::{Ack, IdempotencyKey, OutboundMessage};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Point-in-time health report.
#[derive(Debug, Clone, Serialize)]
pub struct HealthStatus {
    /// Connected and accepting messages.
    pub ready: bool,
    pub shutting_down: bool,
    pub connection: ConnectionStatus,
    /// Messages accepted but not yet resolved.
    pub queue_depth: usize,
    pub in_flight: usize,
    pub active_targets: usize,
    pub stats: QueueStats,
}

/// Sends messages to Mattermost channels and users with at-least-once
/// delivery, per-target ordering and bounded retry.
pub struct DeliveryGateway {
    config: GatewayConfig,
    backend: Arc<dyn ChatBackend>,
    supervisor: ConnectionSupervisor,
    queue: OutboundQueue,
    /// (own user id, peer user id) -> direct channel id. Cleared on disconnect.
    dm_channels: Arc<DashMap<(String, String), String>>,
    shutdown: ShutdownCoordinator,
}

impl DeliveryGateway {
    pub fn new(config: GatewayConfig, backend: Arc<dyn ChatBackend>) -> Self {
        let supervisor = ConnectionSupervisor::new(&config, backend.clone());
        let queue = OutboundQueue::new(&config.delivery, backend.clone(), supervisor.clone());

        let dm_channels: Arc<DashMap<(String, String), String>> = Arc::new(DashMap::new());
        let cache = dm_channels.clone();
        supervisor.on_disconnect(move |_| {
            if !cache.is_empty() {
                debug!(entries = cache.len(), "Clearing direct channel cache");
                cache.clear();
            }
        });

        let shutdown = ShutdownCoordinator::new(ShutdownConfig {
            grace_period: config.delivery.shutdown_grace,
            ..ShutdownConfig::default()
        });

        Self {
            config,
            backend,
            supervisor,
            queue,
            dm_channels,
            shutdown,
        }
    }

    /// Begin connecting in the background. Sends also start the connection
    /// on demand.
    pub fn start(&self) {
        info!(server = self.config.base_url(), "Starting delivery gateway");
        self.supervisor.start();
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn supervisor(&self) -> &ConnectionSupervisor {
        &self.supervisor
    }

    pub fn queue(&self) -> &OutboundQueue {
        &self.queue
    }

    /// Enqueue a channel message and return its ticket without waiting.
    pub fn enqueue_to_channel(&self, channel_id: &str, text: &str) -> DeliveryTicket {
        self.queue
            .enqueue(OutboundMessage::to_channel(channel_id, text))
    }

    /// Deliver `text` to a channel; resolves once acknowledged or failed.
    pub async fn send_to_channel(&self, channel_id: &str, text: &str) -> DeliveryResult<Ack> {
        self.enqueue_to_channel(channel_id, text).await
    }

    /// Like [`send_to_channel`](Self::send_to_channel) with a caller-chosen
    /// idempotency key, so a host retrying its own call is deduplicated too.
    pub async fn send_to_channel_with_key(
        &self,
        channel_id: &str,
        text: &str,
        key: IdempotencyKey,
    ) -> DeliveryResult<Ack> {
        let message = OutboundMessage::to_channel(channel_id, text).with_idempotency_key(key);
        self.queue.enqueue(message).await
    }

    /// Reply inside the thread rooted at `root_id`.
    pub async fn send_in_thread(
        &self,
        channel_id: &str,
        root_id: &str,
        text: &str,
    ) -> DeliveryResult<Ack> {
        let message = OutboundMessage::to_channel(channel_id, text).in_thread(root_id);
        self.queue.enqueue(message).await
    }

    /// Deliver `text` to a user through their direct channel with the bot.
    pub async fn send_direct(&self, user_id: &str, text: &str) -> DeliveryResult<Ack> {
        let message = OutboundMessage::to_user(user_id, text);
        if self.queue.is_closing() {
            return Err(DeliveryError::Cancelled);
        }
        let channel_id = self.resolve_direct_channel(user_id).await?;
        self.queue.enqueue(message.into_channel(channel_id)).await
    }

    /// Look up (or create) the direct channel between the bot and `user_id`.
    /// Gives up with `Cancelled` once shutdown begins.
    async fn resolve_direct_channel(&self, user_id: &str) -> DeliveryResult<String> {
        tokio::select! {
            resolved = self.lookup_direct_channel(user_id) => resolved,
            _ = self.queue.closed() => Err(DeliveryError::Cancelled),
        }
    }

    async fn lookup_direct_channel(&self, user_id: &str) -> DeliveryResult<String> {
        let handle = self
            .supervisor
            .ensure_connected()
            .await
            .map_err(|_| DeliveryError::Cancelled)?;
        let key = (handle.identity.user_id, user_id.to_string());
        if let Some(channel) = self.dm_channels.get(&key) {
            return Ok(channel.clone());
        }

        let retry = RetryConfig::delivery(&self.config.delivery);
        let outcome = retry_async(
            &retry,
            || self.backend.create_direct_channel([key.0.as_str(), key.1.as_str()]),
            BackendError::is_transient,
        )
        .await;

        match outcome {
            RetryOutcome::Success { result, .. } => {
                debug!(user_id, channel_id = %result, "Resolved direct channel");
                self.dm_channels.insert(key, result.clone());
                Ok(result)
            }
            RetryOutcome::Exhausted {
                last_error,
                attempts,
            } => {
                warn!(user_id, attempts, error = %last_error, "Direct channel lookup failed");
                if last_error.is_transient() {
                    Err(DeliveryError::Exhausted {
                        attempts,
                        last_error: last_error.to_string(),
                    })
                } else {
                    Err(DeliveryError::rejected(last_error.to_string()))
                }
            }
        }
    }

    /// Inbound events from the live connection.
    pub fn events(&self) -> InboundEvents {
        self.supervisor.events()
    }

    pub fn health_check(&self) -> HealthStatus {
        let connection = self.supervisor.status();
        let shutting_down = self.shutdown.is_shutting_down();
        HealthStatus {
            ready: connection.handle().is_some() && !shutting_down,
            shutting_down,
            connection,
            queue_depth: self.queue.depth(),
            in_flight: self.queue.in_flight(),
            active_targets: self.queue.active_targets(),
            stats: self.queue.stats(),
        }
    }

    /// Stop accepting messages, cancel queued ones, give in-flight attempts
    /// the grace period, then disconnect. Idempotent.
    pub async fn shutdown(&self) -> ShutdownStatus {
        if !self.shutdown.initiate() {
            return self.shutdown.status();
        }
        let grace = self.shutdown.grace_period();

        self.queue.stop_accepting();
        self.shutdown
            .advance_phase(ShutdownPhase::Draining, true, None);

        self.shutdown
            .advance_phase(ShutdownPhase::CancellingQueued, true, None);
        let cancelled = self.queue.cancel_queued();

        self.shutdown.advance_phase(
            ShutdownPhase::WaitingForInFlight,
            true,
            Some(format!("{cancelled} queued message(s) cancelled")),
        );
        // The grace period counts from initiation, not from this phase.
        let report = self.queue.drain(self.shutdown.grace_remaining()).await;

        self.shutdown.advance_phase(
            ShutdownPhase::AbortingStragglers,
            report.completed,
            (!report.completed).then(|| format!("grace period of {}s elapsed", grace.as_secs())),
        );

        self.shutdown.advance_phase(
            ShutdownPhase::Disconnecting,
            true,
            Some(format!("{} attempt(s) aborted", report.aborted)),
        );
        self.supervisor.shutdown().await;

        self.shutdown
            .advance_phase(ShutdownPhase::Complete, true, None);
        info!(stats = ?self.queue.stats(), "Delivery gateway stopped");
        self.shutdown.status()
    }
}
