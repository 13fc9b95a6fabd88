use std::env;
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::broadcast::DEFAULT_OUTBOUND_CAPACITY;
use crate::gateway::{GatewaySettings, DEFAULT_MAX_MESSAGE_LEN};
use crate::store::DEFAULT_HISTORY_CAPACITY;

pub const DEFAULT_CONFIG_PATH: &str = "config/chat.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TlsConfig {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_addr: SocketAddr,
    /// Directory served as static files next to the API.
    pub static_dir: PathBuf,
    pub max_message_len: usize,
    /// Events buffered per connection before it is treated as stalled.
    pub outbound_capacity: usize,
    /// Messages kept in memory and returned by `GET /messages`.
    pub history_capacity: usize,
    /// JSON-lines file for durable history. In-memory only when unset.
    pub history_path: Option<PathBuf>,
    pub announce_leave: bool,
    pub tls: Option<TlsConfig>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 2052)),
            static_dir: PathBuf::from("public"),
            max_message_len: DEFAULT_MAX_MESSAGE_LEN,
            outbound_capacity: DEFAULT_OUTBOUND_CAPACITY,
            history_capacity: DEFAULT_HISTORY_CAPACITY,
            history_path: None,
            announce_leave: true,
            tls: None,
        }
    }
}

impl ServerConfig {
    pub fn gateway_settings(&self) -> GatewaySettings {
        GatewaySettings {
            max_message_len: self.max_message_len,
            announce_leave: self.announce_leave,
        }
    }

    /// Applies `PORT` and `CHAT_HISTORY_PATH` from the environment.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| env::var(key).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(port) = lookup("PORT") {
            match port.parse::<u16>() {
                Ok(port) => self.bind_addr.set_port(port),
                Err(e) => warn!("Ignoring invalid PORT {:?}: {}", port, e),
            }
        }
        if let Some(path) = lookup("CHAT_HISTORY_PATH") {
            if !path.is_empty() {
                self.history_path = Some(PathBuf::from(path));
            }
        }
    }
}

/// Reads the config file, falling back to defaults when it is missing or malformed.
pub fn load_config(path: impl AsRef<Path>) -> ServerConfig {
    let path = path.as_ref();
    match fs::read_to_string(path) {
        Ok(content) => match serde_json::from_str::<ServerConfig>(&content) {
            Ok(config) => config,
            Err(err) => {
                warn!("Failed to parse config file {}: {err}", path.display());
                ServerConfig::default()
            }
        },
        Err(err) => {
            info!(
                "Config file {} not found ({err}); using defaults",
                path.display()
            );
            ServerConfig::default()
        }
    }
}

/// Config for the binary: file named by `CHAT_CONFIG` (or the default path)
/// plus environment overrides.
pub fn from_env() -> ServerConfig {
    let path = env::var("CHAT_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
    let mut config = load_config(path);
    config.apply_env_overrides();
    config
}
