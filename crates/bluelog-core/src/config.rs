//! Application configuration management.
//!
//! Configuration is layered with the `config` crate:
//! 1. Built-in defaults ([`BluelogConfig::default`])
//! 2. An optional TOML file
//! 3. `BLUELOG_*` environment variables
//!
//! The resulting value is passed explicitly into the tracker and scheduler;
//! nothing in the core reads the environment on its own.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

/// Environment variable prefix for every configuration key.
pub const ENV_PREFIX: &str = "BLUELOG";

/// Errors that can occur while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// An explicitly requested configuration file does not exist.
    #[error("Configuration file not found: {}", .0.display())]
    NotFound(PathBuf),

    /// The configuration sources could not be merged or deserialized.
    #[error("Failed to parse configuration: {0}")]
    ParseError(#[from] ::config::ConfigError),

    /// A single field holds an invalid value.
    #[error("Invalid value for '{field}': {message}")]
    ValidationError {
        /// Name of the offending field.
        field: String,
        /// What is wrong with it.
        message: String,
    },

    /// Several fields hold invalid values.
    #[error("{} configuration errors", .0.len())]
    MultipleValidationErrors(Vec<ConfigError>),
}

/// Result type for configuration operations.
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

/// Main application configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BluelogConfig {
    /// Where the registry document is persisted.
    pub registry_path: PathBuf,

    /// Minimum seconds between two flushes of a dirty registry.
    pub flush_interval_secs: u64,

    /// Seconds without a sighting before a present device is marked as left.
    pub leave_timeout_secs: u64,

    /// Endpoint receiving enter notifications. `None` disables notifications.
    pub webhook_url: Option<String>,

    /// Upper bound for a single webhook request.
    pub webhook_timeout_secs: u64,

    /// Device names that never trigger a notification (case-insensitive).
    pub suppress_notify_names: Vec<String>,

    /// Bluetooth adapter to scan with, recorded in the registry metadata.
    pub adapter: String,

    /// How many recent sightings are kept per device.
    pub max_recent_events: usize,
}

impl Default for BluelogConfig {
    fn default() -> Self {
        Self {
            registry_path: default_registry_path(),
            flush_interval_secs: 10,
            leave_timeout_secs: 120,
            webhook_url: None,
            webhook_timeout_secs: 3,
            suppress_notify_names: Vec::new(),
            adapter: "hci0".to_string(),
            max_recent_events: 25,
        }
    }
}

impl BluelogConfig {
    /// Load configuration from defaults, an optional file and the environment.
    ///
    /// With `path = None` the default location is read if it exists. An
    /// explicit path that does not exist is an error.
    ///
    /// # Errors
    ///
    /// Returns an error if a source cannot be parsed or validation fails.
    pub fn load(path: Option<&Path>) -> ConfigResult<Self> {
        let file = match path {
            Some(path) if !path.exists() => return Err(ConfigError::NotFound(path.to_path_buf())),
            Some(path) => ::config::File::from(path).required(true),
            None => ::config::File::from(default_config_path()).required(false),
        };

        let environment = ::config::Environment::with_prefix(ENV_PREFIX)
            .try_parsing(true)
            .list_separator(",")
            .with_list_parse_key("suppress_notify_names");

        let config: Self = ::config::Config::builder()
            .add_source(file)
            .add_source(environment)
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    /// Check every field and report all problems at once.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::ValidationError`] for a single problem or
    /// [`ConfigError::MultipleValidationErrors`] when there are several.
    pub fn validate(&self) -> ConfigResult<()> {
        let mut errors = Vec::new();
        let mut invalid = |field: &str, message: &str| {
            errors.push(ConfigError::ValidationError {
                field: field.to_string(),
                message: message.to_string(),
            });
        };

        if self.flush_interval_secs == 0 {
            invalid("flush_interval_secs", "must be greater than zero");
        }
        if self.leave_timeout_secs == 0 {
            invalid("leave_timeout_secs", "must be greater than zero");
        }
        if self.webhook_timeout_secs == 0 {
            invalid("webhook_timeout_secs", "must be greater than zero");
        }
        if self.max_recent_events == 0 {
            invalid("max_recent_events", "must keep at least one event");
        }
        if self.adapter.trim().is_empty() {
            invalid("adapter", "must not be empty");
        }
        if self.registry_path.as_os_str().is_empty() {
            invalid("registry_path", "must not be empty");
        }
        if let Some(url) = &self.webhook_url {
            match Url::parse(url) {
                Ok(parsed) if matches!(parsed.scheme(), "http" | "https") => {}
                Ok(_) => invalid("webhook_url", "scheme must be http or https"),
                Err(e) => invalid("webhook_url", &e.to_string()),
            }
        }

        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(ConfigError::MultipleValidationErrors(errors)),
        }
    }

    /// Suppressed names, trimmed and lowercased for comparison.
    #[must_use]
    pub fn suppressed_names(&self) -> HashSet<String> {
        self.suppress_notify_names
            .iter()
            .map(|name| normalize_name(name))
            .filter(|name| !name.is_empty())
            .collect()
    }

    /// Flush cadence as a [`Duration`].
    #[must_use]
    pub const fn flush_interval(&self) -> Duration {
        Duration::from_secs(self.flush_interval_secs)
    }

    /// Leave timeout as a [`Duration`].
    #[must_use]
    pub const fn leave_timeout(&self) -> Duration {
        Duration::from_secs(self.leave_timeout_secs)
    }

    /// Webhook request timeout as a [`Duration`].
    #[must_use]
    pub const fn webhook_timeout(&self) -> Duration {
        Duration::from_secs(self.webhook_timeout_secs)
    }
}

/// Normalize a device name for suppression matching.
#[must_use]
pub fn normalize_name(name: &str) -> String {
    name.trim().to_lowercase()
}

/// Get the default configuration file path.
///
/// On Linux: `/etc/bluelog/config.toml`
/// Elsewhere: the platform config directory, e.g. `~/.config/bluelog/config.toml`
#[must_use]
pub fn default_config_path() -> PathBuf {
    #[cfg(target_os = "linux")]
    {
        PathBuf::from("/etc/bluelog/config.toml")
    }
    #[cfg(not(target_os = "linux"))]
    {
        directories::ProjectDirs::from("", "", "bluelog").map_or_else(
            || PathBuf::from("bluelog.toml"),
            |dirs| dirs.config_dir().join("config.toml"),
        )
    }
}

/// Get the default registry location.
///
/// On Linux: `/var/lib/bluelog/registry.json`
/// Elsewhere: the platform data directory, e.g. `~/.local/share/bluelog/registry.json`
#[must_use]
pub fn default_registry_path() -> PathBuf {
    #[cfg(target_os = "linux")]
    {
        PathBuf::from("/var/lib/bluelog/registry.json")
    }
    #[cfg(not(target_os = "linux"))]
    {
        directories::ProjectDirs::from("", "", "bluelog").map_or_else(
            || PathBuf::from("registry.json"),
            |dirs| dirs.data_dir().join("registry.json"),
        )
    }
}
