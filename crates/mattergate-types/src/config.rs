//! Gateway configuration, validated once from a settings source.
//!
//! Every component receives a `GatewayConfig`; nothing below this layer reads
//! the environment.

use crate::error::{ConfigError, ConfigIssue};
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;
use url::Url;
use zeroize::Zeroizing;

/// Setting keys recognized by the gateway.
pub mod keys {
    pub const URL: &str = "MATTERMOST_URL";
    pub const TOKEN: &str = "MATTERMOST_TOKEN";
    pub const TEAM: &str = "MATTERMOST_TEAM";
    pub const PORT: &str = "MATTERMOST_PORT";
    pub const MAX_ATTEMPTS: &str = "MATTERMOST_MAX_ATTEMPTS";
    pub const MAX_CONCURRENCY: &str = "MATTERMOST_MAX_CONCURRENCY";
    pub const SHUTDOWN_GRACE_SECS: &str = "MATTERMOST_SHUTDOWN_GRACE_SECS";
    pub const REQUEST_TIMEOUT_SECS: &str = "MATTERMOST_REQUEST_TIMEOUT_SECS";

    /// Every key, in documentation order.
    pub const ALL: &[&str] = &[
        URL,
        TOKEN,
        TEAM,
        PORT,
        MAX_ATTEMPTS,
        MAX_CONCURRENCY,
        SHUTDOWN_GRACE_SECS,
        REQUEST_TIMEOUT_SECS,
    ];
}

/// Default inbound webhook port.
pub const DEFAULT_PORT: u16 = 3070;

/// Upper bound for `max_concurrency`.
pub const MAX_CONCURRENCY_LIMIT: usize = 16;

/// Anything that can answer "what is the value of setting `key`?".
pub trait SettingsSource: Send + Sync {
    fn get_setting(&self, key: &str) -> Option<String>;
}

impl SettingsSource for HashMap<String, String> {
    fn get_setting(&self, key: &str) -> Option<String> {
        self.get(key).cloned()
    }
}

impl<S: SettingsSource + ?Sized> SettingsSource for &S {
    fn get_setting(&self, key: &str) -> Option<String> {
        (**self).get_setting(key)
    }
}

/// Read a setting, treating blank values as absent.
pub fn non_blank(source: &dyn SettingsSource, key: &str) -> Option<String> {
    source
        .get_setting(key)
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Whether both required settings are present. An unconfigured gateway is
/// skipped rather than treated as an error.
pub fn is_configured(source: &dyn SettingsSource) -> bool {
    non_blank(source, keys::URL).is_some() && non_blank(source, keys::TOKEN).is_some()
}

/// Delivery tuning shared by the queue and the supervisor.
#[derive(Debug, Clone, PartialEq)]
pub struct DeliveryConfig {
    /// Attempts per message, including the first.
    pub max_attempts: u32,
    /// First backoff delay in milliseconds.
    pub backoff_base_ms: u64,
    /// Backoff cap in milliseconds.
    pub backoff_max_ms: u64,
    /// Jitter factor in `[0, 1]`.
    pub backoff_jitter: f64,
    /// Concurrent attempts across all targets.
    pub max_concurrency: usize,
    /// Bound on a single `create_post` call.
    pub request_timeout: Duration,
    /// How long shutdown waits for in-flight attempts.
    pub shutdown_grace: Duration,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff_base_ms: 500,
            backoff_max_ms: 30_000,
            backoff_jitter: 0.2,
            max_concurrency: MAX_CONCURRENCY_LIMIT,
            request_timeout: Duration::from_secs(10),
            shutdown_grace: Duration::from_secs(10),
        }
    }
}

/// Validated gateway configuration.
#[derive(Clone)]
pub struct GatewayConfig {
    /// Server base URL, without trailing slash.
    pub server_url: Url,
    /// SECURITY: token is zeroized on drop and never printed.
    pub token: Zeroizing<String>,
    /// Team name; auto-detected when `None`.
    pub team: Option<String>,
    /// Local port for an inbound webhook surface.
    pub port: u16,
    pub delivery: DeliveryConfig,
}

impl fmt::Debug for GatewayConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GatewayConfig")
            .field("server_url", &self.server_url.as_str())
            .field("token", &"<redacted>")
            .field("team", &self.team)
            .field("port", &self.port)
            .field("delivery", &self.delivery)
            .finish()
    }
}

impl GatewayConfig {
    /// Build a config from explicit values with default delivery tuning.
    pub fn new(server_url: &str, token: &str) -> Result<Self, ConfigError> {
        let mut settings = HashMap::new();
        settings.insert(keys::URL.to_string(), server_url.to_string());
        settings.insert(keys::TOKEN.to_string(), token.to_string());
        Self::from_settings(&settings)
    }

    /// Validate every setting and report all problems at once.
    pub fn from_settings(source: &dyn SettingsSource) -> Result<Self, ConfigError> {
        let mut issues = Vec::new();

        let server_url = match source.get_setting(keys::URL) {
            None => {
                issues.push(ConfigIssue::new(keys::URL, "Mattermost URL is required"));
                None
            }
            Some(raw) => match parse_server_url(&raw) {
                Ok(url) => Some(url),
                Err(msg) => {
                    issues.push(ConfigIssue::new(keys::URL, msg));
                    None
                }
            },
        };

        let token = match source.get_setting(keys::TOKEN) {
            Some(t) if !t.trim().is_empty() => Some(Zeroizing::new(t.trim().to_string())),
            _ => {
                issues.push(ConfigIssue::new(
                    keys::TOKEN,
                    "Mattermost bot token is required",
                ));
                None
            }
        };

        let team = non_blank(source, keys::TEAM);
        let port = parse_number(source, keys::PORT, DEFAULT_PORT, &mut issues);

        let defaults = DeliveryConfig::default();
        let max_attempts = parse_number(
            source,
            keys::MAX_ATTEMPTS,
            defaults.max_attempts,
            &mut issues,
        );
        if max_attempts == 0 {
            issues.push(ConfigIssue::new(keys::MAX_ATTEMPTS, "must be at least 1"));
        }
        let max_concurrency = parse_number(
            source,
            keys::MAX_CONCURRENCY,
            defaults.max_concurrency,
            &mut issues,
        );
        if max_concurrency == 0 || max_concurrency > MAX_CONCURRENCY_LIMIT {
            issues.push(ConfigIssue::new(
                keys::MAX_CONCURRENCY,
                format!("must be between 1 and {MAX_CONCURRENCY_LIMIT}"),
            ));
        }
        let grace_secs = parse_number(
            source,
            keys::SHUTDOWN_GRACE_SECS,
            defaults.shutdown_grace.as_secs(),
            &mut issues,
        );
        let timeout_secs = parse_number(
            source,
            keys::REQUEST_TIMEOUT_SECS,
            defaults.request_timeout.as_secs(),
            &mut issues,
        );
        if timeout_secs == 0 {
            issues.push(ConfigIssue::new(
                keys::REQUEST_TIMEOUT_SECS,
                "must be at least 1",
            ));
        }

        match (server_url, token) {
            (Some(server_url), Some(token)) if issues.is_empty() => Ok(Self {
                server_url,
                token,
                team,
                port,
                delivery: DeliveryConfig {
                    max_attempts,
                    max_concurrency,
                    shutdown_grace: Duration::from_secs(grace_secs),
                    request_timeout: Duration::from_secs(timeout_secs),
                    ..defaults
                },
            }),
            _ => Err(ConfigError::Invalid(issues)),
        }
    }

    /// Base URL as a string without trailing slash.
    pub fn base_url(&self) -> &str {
        self.server_url.as_str().trim_end_matches('/')
    }
}

fn parse_server_url(raw: &str) -> Result<Url, String> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err("Mattermost URL is required".to_string());
    }
    let url = Url::parse(raw).map_err(|e| format!("Mattermost URL must be a valid URL ({e})"))?;
    match url.scheme() {
        "http" | "https" => {}
        other => {
            return Err(format!(
                "Mattermost URL must use http or https, got '{other}'"
            ))
        }
    }
    if url.host_str().map_or(true, str::is_empty) {
        return Err("Mattermost URL must include a host".to_string());
    }
    Ok(url)
}

fn parse_number<T>(
    source: &dyn SettingsSource,
    key: &'static str,
    default: T,
    issues: &mut Vec<ConfigIssue>,
) -> T
where
    T: std::str::FromStr,
{
    match non_blank(source, key) {
        None => default,
        Some(raw) => match raw.parse::<T>() {
            Ok(v) => v,
            Err(_) => {
                issues.push(ConfigIssue::new(
                    key,
                    format!("expected a non-negative integer, got '{raw}'"),
                ));
                default
            }
        },
    }
}
