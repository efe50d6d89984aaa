//! Host integration: start the gateway from host settings and route
//! inbound posts back to the host.

use crate::config::{EnvSettings, LayeredSettings};
use crate::error::GatewayResult;
use crate::gateway::DeliveryGateway;
use crate::supervisor::InboundEvents;
use async_trait::async_trait;
use mattergate_channels::backend::ChatBackend;
use mattergate_channels::mattermost::MattermostBackend;
use mattergate_types::config::{is_configured, GatewayConfig, SettingsSource};
use mattergate_types::error::BackendError;
use mattergate_types::message::{InboundEvent, InboundPost};
use std::fmt;
use std::ops::Deref;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_stream::StreamExt;
use tracing::{debug, error, info, warn};

/// The runtime embedding the gateway.
#[async_trait]
pub trait HostRuntime: Send + Sync {
    /// Host-provided setting; takes precedence over the environment.
    fn get_setting(&self, key: &str) -> Option<String>;

    /// Called for each post other users make in channels the bot can see.
    async fn on_inbound_post(&self, _post: InboundPost) {}
}

/// Lifecycle contract between a host and a chat client.
#[async_trait]
pub trait ClientInterface: Send + Sync {
    /// Start the client. `Ok(None)` means the client is not configured and
    /// was skipped; invalid configuration is an error.
    async fn start(&self, host: Arc<dyn HostRuntime>) -> GatewayResult<Option<ServiceHandle>>;

    /// Shut the client down. A no-op when not running.
    async fn stop(&self);
}

/// Builds the backend for a validated configuration.
pub type BackendFactory =
    Arc<dyn Fn(&GatewayConfig) -> Result<Arc<dyn ChatBackend>, BackendError> + Send + Sync>;

/// A started gateway, shared with the host.
#[derive(Clone)]
pub struct ServiceHandle {
    gateway: Arc<DeliveryGateway>,
}

impl ServiceHandle {
    pub fn gateway(&self) -> &Arc<DeliveryGateway> {
        &self.gateway
    }
}

impl fmt::Debug for ServiceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceHandle")
            .field("endpoint", &self.gateway.config().base_url())
            .field("state", &self.gateway.supervisor().status().state)
            .finish_non_exhaustive()
    }
}

impl Deref for ServiceHandle {
    type Target = DeliveryGateway;

    fn deref(&self) -> &DeliveryGateway {
        &self.gateway
    }
}

struct Running {
    handle: ServiceHandle,
    forwarder: JoinHandle<()>,
}

/// Mattermost client for a host runtime.
pub struct MattermostClient {
    factory: BackendFactory,
    env_fallback: bool,
    running: Mutex<Option<Running>>,
}

impl Default for MattermostClient {
    fn default() -> Self {
        Self::new()
    }
}

impl MattermostClient {
    /// Client talking to a real Mattermost server.
    pub fn new() -> Self {
        Self::with_backend_factory(Arc::new(|config: &GatewayConfig| {
            let backend = MattermostBackend::new(config)?;
            Ok(Arc::new(backend) as Arc<dyn ChatBackend>)
        }))
    }

    /// Client using a custom backend.
    pub fn with_backend_factory(factory: BackendFactory) -> Self {
        Self {
            factory,
            env_fallback: true,
            running: Mutex::new(None),
        }
    }

    /// Only consult host settings, never the process environment.
    pub fn without_env_fallback(mut self) -> Self {
        self.env_fallback = false;
        self
    }

    /// The running gateway, if started.
    pub async fn handle(&self) -> Option<ServiceHandle> {
        self.running.lock().await.as_ref().map(|r| r.handle.clone())
    }

    fn settings(&self, host: Arc<dyn HostRuntime>) -> LayeredSettings {
        let settings = LayeredSettings::new().with(HostSettings(host));
        if self.env_fallback {
            settings.with(EnvSettings)
        } else {
            settings
        }
    }
}

#[async_trait]
impl ClientInterface for MattermostClient {
    async fn start(&self, host: Arc<dyn HostRuntime>) -> GatewayResult<Option<ServiceHandle>> {
        debug!("Attempting to initialize Mattermost client");
        let settings = self.settings(host.clone());
        if !is_configured(&settings) {
            debug!("Mattermost URL or token not set, skipping initialization");
            return Ok(None);
        }

        let config = GatewayConfig::from_settings(&settings).map_err(|e| {
            error!(error = %e, "Mattermost configuration validation failed");
            e
        })?;

        let mut running = self.running.lock().await;
        if let Some(existing) = running.as_ref() {
            warn!("Mattermost client already started");
            return Ok(Some(existing.handle.clone()));
        }

        info!(server = config.base_url(), "Initializing Mattermost client");
        let backend = (self.factory)(&config)?;
        let gateway = Arc::new(DeliveryGateway::new(config, backend));
        // Subscribe before connecting so early posts are not missed.
        let events = gateway.events();
        let forwarder = tokio::spawn(forward_inbound(events, gateway.clone(), host));
        gateway.start();

        let handle = ServiceHandle { gateway };
        *running = Some(Running {
            handle: handle.clone(),
            forwarder,
        });
        info!("Mattermost client started");
        Ok(Some(handle))
    }

    async fn stop(&self) {
        let Some(running) = self.running.lock().await.take() else {
            return;
        };
        warn!("Mattermost client stopping");
        running.handle.gateway.shutdown().await;
        running.forwarder.abort();
    }
}

/// Host settings as a [`SettingsSource`] layer.
struct HostSettings(Arc<dyn HostRuntime>);

impl SettingsSource for HostSettings {
    fn get_setting(&self, key: &str) -> Option<String> {
        self.0.get_setting(key)
    }
}

/// Hand inbound posts to the host, skipping the bot's own.
async fn forward_inbound(
    mut events: InboundEvents,
    gateway: Arc<DeliveryGateway>,
    host: Arc<dyn HostRuntime>,
) {
    while let Some(event) = events.next().await {
        let InboundEvent::Posted(post) = event;
        let own_id = gateway.supervisor().status().identity.map(|i| i.user_id);
        if own_id.as_deref() == Some(post.post.user_id.as_str()) {
            continue;
        }
        debug!(
            channel_id = %post.post.channel_id,
            sender = %post.sender_name,
            direct = post.is_direct(),
            "Inbound post"
        );
        host.on_inbound_post(post).await;
    }
}
