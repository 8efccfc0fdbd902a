use anyhow::{Context, Result};
use dirs::home_dir;
use log::debug;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::session::SessionOptions;

fn default_clock_skew_margin_secs() -> u64 {
    20
}

fn default_request_timeout_secs() -> u64 {
    10
}

fn default_poll() -> bool {
    true
}

fn default_poll_interval_secs() -> u64 {
    30
}

fn default_refresh_interval_secs() -> u64 {
    60
}

/// Configuration data stored in ~/.opendoors.yml
///
/// The upper-case aliases accept the keys of older `secrets.yaml` files.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(alias = "AUTH_API_TOKEN_URL")]
    pub token_endpoint_url: String,
    #[serde(alias = "API_BASE_URL")]
    pub api_base_url: String,
    #[serde(alias = "CLIENT_ID")]
    pub client_id: String,
    #[serde(alias = "CLIENT_SECRET")]
    pub client_secret: String,
    #[serde(alias = "USERNAME")]
    pub username: String,
    #[serde(alias = "PASSWORD", default)]
    pub password: String,
    #[serde(default = "default_clock_skew_margin_secs")]
    pub clock_skew_margin_secs: u64,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// Run the background poll loop after `connect()`
    #[serde(default = "default_poll")]
    pub poll: bool,
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_refresh_interval_secs")]
    pub refresh_interval_secs: u64,
}

/// Upper bound for `clock_skew_margin_secs` (one day)
pub const MAX_CLOCK_SKEW_MARGIN_SECS: u64 = 24 * 60 * 60;

impl Config {
    /// Build a config with the required fields and default tuning values
    pub fn new(
        token_endpoint_url: impl Into<String>,
        api_base_url: impl Into<String>,
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            token_endpoint_url: token_endpoint_url.into(),
            api_base_url: api_base_url.into(),
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            username: username.into(),
            password: password.into(),
            clock_skew_margin_secs: default_clock_skew_margin_secs(),
            request_timeout_secs: default_request_timeout_secs(),
            poll: default_poll(),
            poll_interval_secs: default_poll_interval_secs(),
            refresh_interval_secs: default_refresh_interval_secs(),
        }
    }

    pub fn validate(&self) -> crate::Result<()> {
        let required = [
            ("token_endpoint_url", &self.token_endpoint_url),
            ("api_base_url", &self.api_base_url),
            ("client_id", &self.client_id),
            ("client_secret", &self.client_secret),
            ("username", &self.username),
            ("password", &self.password),
        ];
        for (name, value) in required {
            if value.trim().is_empty() {
                return Err(crate::Error::Config(format!("{} must not be empty", name)));
            }
        }
        if self.poll_interval_secs == 0 || self.refresh_interval_secs == 0 {
            return Err(crate::Error::Config(
                "poll and refresh intervals must be at least one second".to_string(),
            ));
        }
        if self.request_timeout_secs == 0 {
            return Err(crate::Error::Config(
                "request_timeout_secs must be at least one second".to_string(),
            ));
        }
        if self.clock_skew_margin_secs > MAX_CLOCK_SKEW_MARGIN_SECS {
            return Err(crate::Error::Config(format!(
                "clock_skew_margin_secs must not exceed {}",
                MAX_CLOCK_SKEW_MARGIN_SECS
            )));
        }
        Ok(())
    }

    pub fn clock_skew_margin(&self) -> Duration {
        Duration::from_secs(self.clock_skew_margin_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn session_options(&self) -> SessionOptions {
        SessionOptions {
            poll: self.poll,
            poll_interval: Duration::from_secs(self.poll_interval_secs),
            refresh_interval: Duration::from_secs(self.refresh_interval_secs),
        }
    }
}

/// Get the path to the configuration file (~/.opendoors.yml)
pub fn get_config_path() -> Result<PathBuf> {
    let home = home_dir().context("Failed to determine home directory")?;
    Ok(home.join(".opendoors.yml"))
}

/// Load configuration from ~/.opendoors.yml
pub fn load_config() -> Result<Config> {
    let config_path = get_config_path()?;
    load_config_from(&config_path)
}

/// Load configuration from an explicit path.
///
/// The password may be left out of the file and supplied later, so it is not
/// validated here.
pub fn load_config_from(config_path: &Path) -> Result<Config> {
    if !config_path.exists() {
        return Err(anyhow::anyhow!(
            "Configuration file not found: {}",
            config_path.display()
        ));
    }

    let content = fs::read_to_string(config_path)
        .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

    let config: Config = serde_yaml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", config_path.display()))?;

    debug!("Loaded configuration for user: {}", config.username);
    Ok(config)
}
