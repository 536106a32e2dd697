use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid config {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemConfig {
    #[serde(default)]
    pub remote_store: RemoteStoreConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub lobby: LobbyConfig,
    #[serde(default)]
    pub chat: ChatConfig,
    #[serde(default)]
    pub trip: TripConfig,
    #[serde(default)]
    pub tools: ToolConfig,
    #[serde(default = "SystemConfig::default_call_timeout_ms")]
    pub call_timeout_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http_addr: Option<SocketAddr>,
}

impl Default for SystemConfig {
    fn default() -> Self {
        SystemConfig {
            remote_store: RemoteStoreConfig::default(),
            storage: StorageConfig::default(),
            lobby: LobbyConfig::default(),
            chat: ChatConfig::default(),
            trip: TripConfig::default(),
            tools: ToolConfig::default(),
            call_timeout_ms: Self::default_call_timeout_ms(),
            http_addr: None,
        }
    }
}

impl SystemConfig {
    fn default_call_timeout_ms() -> u64 {
        5000
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum RemoteStoreConfig {
    #[default]
    #[serde(rename = "in_memory")]
    InMemory,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum StorageConfig {
    #[default]
    #[serde(rename = "memory")]
    Memory,
    #[serde(rename = "file")]
    File { path: PathBuf },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LobbyConfig {
    #[serde(default = "LobbyConfig::default_name")]
    pub default_name: String,
    #[serde(default = "LobbyConfig::default_invite_attempts")]
    pub invite_code_attempts: u32,
}

impl Default for LobbyConfig {
    fn default() -> Self {
        LobbyConfig {
            default_name: Self::default_name(),
            invite_code_attempts: Self::default_invite_attempts(),
        }
    }
}

impl LobbyConfig {
    fn default_name() -> String {
        "My Trip Planning".into()
    }
    fn default_invite_attempts() -> u32 {
        3
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatConfig {
    #[serde(default = "ChatConfig::default_window")]
    pub window: usize,
}

impl Default for ChatConfig {
    fn default() -> Self {
        ChatConfig {
            window: Self::default_window(),
        }
    }
}

impl ChatConfig {
    fn default_window() -> usize {
        100
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TripConfig {
    #[serde(default = "TripConfig::default_currency")]
    pub default_currency: String,
}

impl Default for TripConfig {
    fn default() -> Self {
        TripConfig {
            default_currency: Self::default_currency(),
        }
    }
}

impl TripConfig {
    fn default_currency() -> String {
        "USD".into()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolConfig {
    /// How many idempotency keys the registry remembers.
    #[serde(default = "ToolConfig::default_idempotency_window")]
    pub idempotency_window: usize,
}

impl Default for ToolConfig {
    fn default() -> Self {
        ToolConfig {
            idempotency_window: Self::default_idempotency_window(),
        }
    }
}

impl ToolConfig {
    fn default_idempotency_window() -> usize {
        256
    }
}
