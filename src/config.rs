//! Configuration management module.

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Configuration load result.
#[derive(Debug)]
pub enum ConfigLoadResult {
    /// Config loaded successfully.
    Loaded(AppConfig),
    /// Config file missing (first run).
    Missing,
    /// Config file exists but invalid.
    Invalid(ConfigError),
}

/// Configuration errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Read(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Validation failed: {0}")]
    Validation(String),
}

/// Main configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    pub device: DeviceConfig,
    #[serde(default)]
    pub location: LocationConfig,
    #[serde(default)]
    pub monitor: MonitorConfig,
    #[serde(default)]
    pub fonbook: FonbookConfig,
    #[serde(default)]
    pub retry: RetryConfig,
}

/// Fritz!Box connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub host: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    /// Web interface port (default: 80).
    #[serde(default = "default_ui_port")]
    pub ui_port: u16,
    /// Call monitor port (default: 1012).
    #[serde(default = "default_listener_port")]
    pub listener_port: u16,
    /// UPnP/SOAP port (default: 49000).
    #[serde(default = "default_upnp_port")]
    pub upnp_port: u16,
    /// HTTP and TCP operation timeout in seconds (default: 30).
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Log phone numbers, names and session ids in clear text.
    #[serde(default)]
    pub log_personal_info: bool,
}

fn default_ui_port() -> u16 {
    80
}

fn default_listener_port() -> u16 {
    1012
}

fn default_upnp_port() -> u16 {
    49000
}

fn default_timeout_secs() -> u64 {
    30
}

/// Country and area code used when the device does not report them.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LocationConfig {
    #[serde(default)]
    pub country_code: String,
    #[serde(default)]
    pub region_code: String,
}

/// Call monitor settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// Only report calls on these local numbers. Empty means all.
    #[serde(default)]
    pub msn_filter: Vec<String>,
}

/// Phonebook settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FonbookConfig {
    /// Tech ids of the enabled phonebooks, in lookup order.
    pub enabled: Vec<String>,
    /// Tech id of the phonebook shown first.
    #[serde(default)]
    pub active: String,
    /// Directory holding the local phonebook.
    #[serde(default = "default_config_dir")]
    pub config_dir: PathBuf,
    #[serde(default = "default_true")]
    pub save_on_shutdown: bool,
}

fn default_config_dir() -> PathBuf {
    ProjectDirs::from("de", "fritzlink", "fritzlink")
        .map(|dirs| dirs.config_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from("."))
}

fn default_true() -> bool {
    true
}

/// Backoff for requests that fail with transient errors.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_initial_delay_secs")]
    pub initial_delay_secs: u64,
    #[serde(default = "default_max_delay_secs")]
    pub max_delay_secs: u64,
    /// Give up after this many attempts. `None` retries forever.
    #[serde(default)]
    pub max_attempts: Option<u32>,
}

fn default_initial_delay_secs() -> u64 {
    60
}

fn default_max_delay_secs() -> u64 {
    3600
}

impl AppConfig {
    /// Get config file path (same directory as executable).
    pub fn default_path() -> PathBuf {
        std::env::current_exe()
            .ok()
            .and_then(|p| p.parent().map(|p| p.to_path_buf()))
            .unwrap_or_else(|| PathBuf::from("."))
            .join("fritzlink.toml")
    }

    /// Attempt to load config with detailed result.
    pub fn try_load(path: &Path) -> ConfigLoadResult {
        if !path.exists() {
            return ConfigLoadResult::Missing;
        }

        match std::fs::read_to_string(path) {
            Ok(content) => match toml::from_str::<AppConfig>(&content) {
                Ok(config) => match config.validate() {
                    Ok(()) => ConfigLoadResult::Loaded(config),
                    Err(e) => ConfigLoadResult::Invalid(e),
                },
                Err(e) => ConfigLoadResult::Invalid(ConfigError::Parse(e)),
            },
            Err(e) => ConfigLoadResult::Invalid(ConfigError::Read(e)),
        }
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.device.host.trim().is_empty() {
            return Err(ConfigError::Validation("Device host cannot be empty".to_string()));
        }
        if self.device.host.contains("://") {
            return Err(ConfigError::Validation(
                "Device host must be a hostname, not a URL".to_string(),
            ));
        }
        if self.device.ui_port == 0 || self.device.listener_port == 0 || self.device.upnp_port == 0 {
            return Err(ConfigError::Validation("Ports must be greater than 0".to_string()));
        }
        if self.device.timeout_secs < 1 {
            return Err(ConfigError::Validation(
                "Timeout must be at least 1 second".to_string(),
            ));
        }
        if self.retry.initial_delay_secs > self.retry.max_delay_secs {
            return Err(ConfigError::Validation(
                "Initial retry delay cannot exceed the maximum delay".to_string(),
            ));
        }
        if self.retry.max_attempts == Some(0) {
            return Err(ConfigError::Validation("Max attempts must be at least 1".to_string()));
        }
        if let Some(msn) = self
            .monitor
            .msn_filter
            .iter()
            .find(|msn| msn.is_empty() || !msn.chars().all(|c| c.is_ascii_digit()))
        {
            return Err(ConfigError::Validation(format!("Invalid MSN in filter: '{msn}'")));
        }
        if !self.fonbook.active.is_empty() && !self.fonbook.enabled.contains(&self.fonbook.active) {
            return Err(ConfigError::Validation(format!(
                "Active phonebook '{}' is not enabled",
                self.fonbook.active
            )));
        }
        Ok(())
    }

    /// Save configuration to file.
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }
}

impl DeviceConfig {
    /// Request timeout as a `Duration`.
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl RetryConfig {
    pub fn initial_delay(&self) -> Duration {
        Duration::from_secs(self.initial_delay_secs)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_secs(self.max_delay_secs)
    }
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            host: "fritz.box".to_string(),
            username: String::new(),
            password: String::new(),
            ui_port: default_ui_port(),
            listener_port: default_listener_port(),
            upnp_port: default_upnp_port(),
            timeout_secs: default_timeout_secs(),
            log_personal_info: false,
        }
    }
}

impl Default for FonbookConfig {
    fn default() -> Self {
        Self {
            enabled: vec!["FRITZ".to_string()],
            active: String::new(),
            config_dir: default_config_dir(),
            save_on_shutdown: true,
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_delay_secs: default_initial_delay_secs(),
            max_delay_secs: default_max_delay_secs(),
            max_attempts: None,
        }
    }
}
