//! Settings sources: process environment, TOML files and layering.
//!
//! Lookup order is decided by the caller. The host service layers host
//! settings over the environment; the CLI layers the environment over an
//! optional `--config` file.

use mattergate_types::config::{keys, SettingsSource};
use mattergate_types::error::ConfigError;
use std::collections::HashMap;
use std::path::Path;
use tracing::{debug, info};

/// Reads settings from the process environment.
#[derive(Debug, Clone, Copy, Default)]
pub struct EnvSettings;

impl SettingsSource for EnvSettings {
    fn get_setting(&self, key: &str) -> Option<String> {
        std::env::var(key).ok()
    }
}

/// Settings loaded from a TOML file with a `[mattermost]` table:
///
/// ```toml
/// [mattermost]
/// url = "https://chat.example.com"
/// token = "..."
/// team = "engineering"
/// max_attempts = 5
/// ```
///
/// Table keys are the setting names without the `MATTERMOST_` prefix, lowercased.
#[derive(Debug, Clone, Default)]
pub struct FileSettings {
    values: HashMap<String, String>,
}

impl FileSettings {
    /// Load and parse a settings file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::File(format!("{}: {e}", path.display())))?;
        let settings = Self::parse(&contents)
            .map_err(|e| ConfigError::File(format!("{}: {e}", path.display())))?;
        info!(path = %path.display(), keys = settings.values.len(), "Loaded settings file");
        Ok(settings)
    }

    /// Parse settings from TOML text.
    pub fn parse(contents: &str) -> Result<Self, String> {
        let root: toml::Value = toml::from_str(contents).map_err(|e| e.to_string())?;
        let Some(table) = root.get("mattermost").and_then(|v| v.as_table()) else {
            return Err("missing [mattermost] table".to_string());
        };

        let mut values = HashMap::new();
        for (name, value) in table {
            let key = format!("MATTERMOST_{}", name.to_ascii_uppercase());
            if !keys::ALL.contains(&key.as_str()) {
                debug!(key = %name, "Ignoring unknown setting in [mattermost]");
                continue;
            }
            let text = match value {
                toml::Value::String(s) => s.clone(),
                toml::Value::Integer(i) => i.to_string(),
                other => return Err(format!("mattermost.{name}: unsupported value {other}")),
            };
            values.insert(key, text);
        }
        Ok(Self { values })
    }
}

impl SettingsSource for FileSettings {
    fn get_setting(&self, key: &str) -> Option<String> {
        self.values.get(key).cloned()
    }
}

/// Consults each source in order; the first non-blank value wins.
#[derive(Default)]
pub struct LayeredSettings {
    layers: Vec<Box<dyn SettingsSource>>,
}

impl LayeredSettings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a lower-priority layer.
    pub fn with(mut self, source: impl SettingsSource + 'static) -> Self {
        self.layers.push(Box::new(source));
        self
    }
}

impl SettingsSource for LayeredSettings {
    fn get_setting(&self, key: &str) -> Option<String> {
        self.layers
            .iter()
            .filter_map(|layer| layer.get_setting(key))
            .find(|v| !v.trim().is_empty())
    }
}
