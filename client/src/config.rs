use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use tracing::info;

use crate::client::ClientOptions;
use crate::error::ConfigError;
use crate::gateway::connection::{
    DEFAULT_CONNECT_TIMEOUT, DEFAULT_HEARTBEAT_INTERVAL, DEFAULT_PONG_TIMEOUT,
};

pub const DEFAULT_API_URL: &str = "https://api.revolt.chat";
pub const DEFAULT_WS_URL: &str = "wss://ws.revolt.chat";
pub const DEFAULT_CDN_URL: &str = "https://autumn.revolt.chat";

/// Default config file name.
pub const DEFAULT_CONFIG_PATH: &str = "hearth.toml";

/// Top-level client configuration, loaded from hearth.toml.
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct ClientConfig {
    pub api: ApiSection,
    pub gateway: GatewaySection,
    pub cache: CacheSection,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ApiSection {
    pub base_url: String,
    pub cdn_url: String,
}

impl Default for ApiSection {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_API_URL.into(),
            cdn_url: DEFAULT_CDN_URL.into(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct GatewaySection {
    /// Realtime endpoint. Falls back to the public one when unset.
    pub ws_url: Option<String>,
    pub heartbeat_secs: u64,
    pub pong_timeout_secs: u64,
    pub connect_timeout_secs: u64,
    pub auto_reconnect: bool,
}

impl Default for GatewaySection {
    fn default() -> Self {
        Self {
            ws_url: None,
            heartbeat_secs: DEFAULT_HEARTBEAT_INTERVAL.as_secs(),
            pong_timeout_secs: DEFAULT_PONG_TIMEOUT.as_secs(),
            connect_timeout_secs: DEFAULT_CONNECT_TIMEOUT.as_secs(),
            auto_reconnect: true,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct CacheSection {
    pub eager_fetching: bool,
    pub partials: bool,
    pub sync_unreads: bool,
}

impl Default for CacheSection {
    fn default() -> Self {
        Self {
            eager_fetching: true,
            partials: true,
            sync_unreads: false,
        }
    }
}

impl ClientConfig {
    /// Load config from a TOML file. Falls back to defaults if the file doesn't exist.
    /// Environment variables override TOML values.
    pub fn load(path: &str) -> Result<Self, ConfigError> {
        let mut config = if Path::new(path).exists() {
            let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
                path: path.to_string(),
                source,
            })?;
            Self::from_toml(path, &contents)?
        } else {
            info!("No config file found at {}, using defaults", path);
            Self::default()
        };

        config.apply_env_overrides();
        Ok(config)
    }

    fn from_toml(path: &str, contents: &str) -> Result<Self, ConfigError> {
        toml::from_str(contents).map_err(|source| ConfigError::Parse {
            path: path.to_string(),
            source,
        })
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("HEARTH_API_URL") {
            self.api.base_url = v;
        }
        if let Ok(v) = std::env::var("HEARTH_CDN_URL") {
            self.api.cdn_url = v;
        }
        if let Ok(v) = std::env::var("HEARTH_WS_URL") {
            self.gateway.ws_url = Some(v);
        }
        if let Ok(v) = std::env::var("HEARTH_HEARTBEAT_SECS")
            && let Ok(secs) = v.parse()
        {
            self.gateway.heartbeat_secs = secs;
        }
        if let Ok(v) = std::env::var("HEARTH_PONG_TIMEOUT_SECS")
            && let Ok(secs) = v.parse()
        {
            self.gateway.pong_timeout_secs = secs;
        }
        if let Ok(v) = std::env::var("HEARTH_CONNECT_TIMEOUT_SECS")
            && let Ok(secs) = v.parse()
        {
            self.gateway.connect_timeout_secs = secs;
        }
        if let Some(flag) = env_flag("HEARTH_AUTO_RECONNECT") {
            self.gateway.auto_reconnect = flag;
        }
        if let Some(flag) = env_flag("HEARTH_EAGER_FETCH") {
            self.cache.eager_fetching = flag;
        }
        if let Some(flag) = env_flag("HEARTH_PARTIALS") {
            self.cache.partials = flag;
        }
        if let Some(flag) = env_flag("HEARTH_SYNC_UNREADS") {
            self.cache.sync_unreads = flag;
        }
    }

    pub fn websocket_url(&self) -> &str {
        self.gateway.ws_url.as_deref().unwrap_or(DEFAULT_WS_URL)
    }

    /// Convert into options for [`crate::Client`].
    pub fn to_options(&self) -> ClientOptions {
        ClientOptions {
            api_url: self.api.base_url.clone(),
            cdn_url: self.api.cdn_url.clone(),
            ws_url: self.websocket_url().to_string(),
            heartbeat_interval: Duration::from_secs(self.gateway.heartbeat_secs),
            pong_timeout: Duration::from_secs(self.gateway.pong_timeout_secs),
            connect_timeout: Duration::from_secs(self.gateway.connect_timeout_secs),
            auto_reconnect: self.gateway.auto_reconnect,
            eager_fetching: self.cache.eager_fetching,
            partials: self.cache.partials,
            sync_unreads: self.cache.sync_unreads,
            ..ClientOptions::default()
        }
    }
}

/// `1/true/yes/on` and `0/false/no/off`, case-insensitive. Anything else is ignored.
fn env_flag(name: &str) -> Option<bool> {
    let value = std::env::var(name).ok()?;
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
