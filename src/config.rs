use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

pub const APP_NAME: &str = "creditchat";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub listen_addr: String,
    pub database_path: Option<PathBuf>,
    pub log_filter: String,
    pub chat: ChatConfig,
    pub cache: CacheConfig,
    pub providers: Vec<ProviderConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChatConfig {
    pub default_title: String,
    pub title_chars: usize,
    pub default_context_length: i64,
    pub default_temperature: f32,
    /// A `streaming` row untouched for this long is considered orphaned.
    pub stale_stream_secs: u64,
    pub checkpoint_interval_ms: u64,
    pub stopped_marker: String,
    pub request_timeout_secs: u64,
    pub stream_idle_timeout_secs: u64,
    pub client_buffer: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub model_ttl_secs: u64,
    pub message_ttl_secs: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    #[serde(rename = "openai_compatible")]
    OpenAiCompatible,
    Claude,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub id: String,
    pub kind: ProviderKind,
    pub base_url: String,
    /// Name of the environment variable holding the API key.
    #[serde(default)]
    pub api_key_env: Option<String>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:8080".to_string(),
            database_path: None,
            log_filter: "creditchat=info,tower_http=info".to_string(),
            chat: ChatConfig::default(),
            cache: CacheConfig::default(),
            providers: Vec::new(),
        }
    }
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            default_title: "New Chat".to_string(),
            title_chars: 30,
            default_context_length: 20,
            default_temperature: 0.7,
            stale_stream_secs: 300,
            checkpoint_interval_ms: 1500,
            stopped_marker: "\n\n[Generation stopped]".to_string(),
            request_timeout_secs: 120,
            stream_idle_timeout_secs: 60,
            client_buffer: 64,
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            model_ttl_secs: 60,
            message_ttl_secs: 30,
        }
    }
}

impl ChatConfig {
    pub fn stale_after(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.stale_stream_secs as i64)
    }

    pub fn checkpoint_interval(&self) -> Duration {
        Duration::from_millis(self.checkpoint_interval_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn stream_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.stream_idle_timeout_secs)
    }
}

impl AppConfig {
    /// Load from `CREDITCHAT_CONFIG` (default `creditchat.toml`), then apply
    /// environment overrides. A missing file yields the defaults.
    pub fn load() -> Result<Self> {
        let path = std::env::var("CREDITCHAT_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("creditchat.toml"));

        let mut config = if path.exists() {
            Self::from_file(&path)?
        } else {
            tracing::info!("No config file at {}, using defaults", path.display());
            Self::default()
        };

        if let Ok(addr) = std::env::var("CREDITCHAT_LISTEN") {
            config.listen_addr = addr;
        }
        if let Ok(db) = std::env::var("CREDITCHAT_DB") {
            config.database_path = Some(PathBuf::from(db));
        }

        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::from_toml(&raw).with_context(|| format!("Invalid config file: {}", path.display()))
    }

    pub fn from_toml(raw: &str) -> Result<Self> {
        Ok(toml::from_str(raw)?)
    }

    pub fn database_path(&self) -> Result<PathBuf> {
        if let Some(path) = &self.database_path {
            return Ok(path.clone());
        }
        let data_dir = match std::env::var("XDG_DATA_HOME") {
            Ok(dir) => PathBuf::from(dir),
            Err(_) => {
                let home = std::env::var("HOME").context("Neither XDG_DATA_HOME nor HOME is set")?;
                PathBuf::from(home).join(".local/share")
            }
        };
        Ok(data_dir.join(APP_NAME).join(format!("{}.db", APP_NAME)))
    }
}
