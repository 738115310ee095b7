//! Configuration for shelly-rpc

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::{Result, RpcError};

/// Fixed RPC path on every device.
pub const RPC_PATH: &str = "/rpc";

/// User name Gen2 devices accept for digest auth.
pub const DEFAULT_USERNAME: &str = "admin";

fn default_username() -> String {
    DEFAULT_USERNAME.to_string()
}

fn default_send_timeout_ms() -> u64 {
    10_000
}

fn default_retry_wait_ms() -> u64 {
    3_000
}

fn default_send_trys() -> u32 {
    3
}

/// Connection settings for one device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Device hostname or `host:port`, without scheme
    #[serde(default)]
    pub hostname: String,

    /// User for digest authentication
    #[serde(default = "default_username")]
    pub username: String,

    /// Password for digest authentication (only needed if the device has auth enabled)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,

    /// How long one attempt waits for a response
    #[serde(default = "default_send_timeout_ms")]
    pub send_timeout_ms: u64,

    /// Delay between reconnection attempts
    #[serde(default = "default_retry_wait_ms")]
    pub retry_wait_ms: u64,

    /// Attempts per request before giving up
    #[serde(default = "default_send_trys")]
    pub send_trys: u32,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            hostname: String::new(),
            username: default_username(),
            password: None,
            send_timeout_ms: default_send_timeout_ms(),
            retry_wait_ms: default_retry_wait_ms(),
            send_trys: default_send_trys(),
        }
    }
}

impl ClientConfig {
    /// Config for `hostname` with every other field defaulted.
    pub fn new(hostname: impl Into<String>) -> Self {
        Self {
            hostname: hostname.into(),
            ..Default::default()
        }
    }

    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    /// Load config from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| RpcError::Config(format!("{}: {}", path.display(), e)))?;
        toml::from_str(&content).map_err(|e| RpcError::Config(format!("{}: {}", path.display(), e)))
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }

    pub fn retry_wait(&self) -> Duration {
        Duration::from_millis(self.retry_wait_ms)
    }

    /// WebSocket URL of the device RPC endpoint.
    pub fn endpoint_url(&self) -> String {
        format!("ws://{}{}", self.hostname, RPC_PATH)
    }

    /// Copy with scheme stripped from the hostname and zero values replaced by defaults.
    pub fn normalized(&self) -> Self {
        let mut config = self.clone();
        config.hostname = strip_scheme(config.hostname.trim()).to_string();
        if config.username.is_empty() {
            config.username = default_username();
        }
        if config.password.as_deref() == Some("") {
            config.password = None;
        }
        if config.send_timeout_ms == 0 {
            config.send_timeout_ms = default_send_timeout_ms();
        }
        if config.retry_wait_ms == 0 {
            config.retry_wait_ms = default_retry_wait_ms();
        }
        if config.send_trys == 0 {
            config.send_trys = default_send_trys();
        }
        config
    }

    pub fn validate(&self) -> Result<()> {
        if self.hostname.is_empty() {
            return Err(RpcError::Config("hostname is required".into()));
        }
        if self.hostname.contains("://") {
            return Err(RpcError::Config(format!(
                "hostname '{}' must not carry a scheme",
                self.hostname
            )));
        }
        Ok(())
    }
}

/// Strip a leading `scheme://` and any trailing path from a hostname.
pub fn strip_scheme(hostname: &str) -> &str {
    let host = hostname
        .split_once("://")
        .map(|(_, rest)| rest)
        .unwrap_or(hostname);
    host.split('/').next().unwrap_or(host)
}
