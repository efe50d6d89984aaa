//! Kernel-level error type.

use mattergate_types::error::{BackendError, ConfigError, ConnectError, DeliveryError};
use thiserror::Error;

/// Gateway error wrapping the per-concern errors from `mattergate-types`.
#[derive(Error, Debug)]
pub enum GatewayError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Connect(#[from] ConnectError),

    #[error(transparent)]
    Delivery(#[from] DeliveryError),

    /// The backend could not be constructed or a one-off call failed.
    #[error(transparent)]
    Backend(#[from] BackendError),
}

/// Alias for gateway results.
pub type GatewayResult<T> = Result<T, GatewayError>;
