// Client configuration: JSON file under the config dir, then environment overrides

use anyhow::{anyhow, Result};
use log::{debug, info};
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

pub const ENV_API_URL: &str = "PARLEY_API_URL";
pub const ENV_USER_ID: &str = "PARLEY_USER_ID";
pub const ENV_TOKEN: &str = "PARLEY_TOKEN";

static CONFIG_DIR_OVERRIDE: OnceCell<PathBuf> = OnceCell::new();

/// Point config and data files at a custom directory. First call wins.
pub fn set_config_dir_override(path: PathBuf) {
    let _ = CONFIG_DIR_OVERRIDE.set(path);
}

/// Directory holding config.json, session.json, the log file and the local database
pub fn get_config_dir() -> Result<PathBuf> {
    if let Some(dir) = CONFIG_DIR_OVERRIDE.get() {
        fs::create_dir_all(dir)?;
        return Ok(dir.clone());
    }
    let config_dir = dirs::config_dir()
        .ok_or_else(|| anyhow!("Could not determine config directory"))?
        .join("parley");

    if !config_dir.exists() {
        fs::create_dir_all(&config_dir)?;
    }

    Ok(config_dir)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SseConfig {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub max_jitter_ms: u64,
    pub max_reconnect_attempts: u32,
    pub heartbeat_interval_ms: u64,
    pub stale_after_ms: u64,
    pub background_grace_ms: u64,
    pub event_buffer: usize,
}

impl Default for SseConfig {
    fn default() -> Self {
        SseConfig {
            base_delay_ms: 1_000,
            max_delay_ms: 30_000,
            max_jitter_ms: 1_000,
            max_reconnect_attempts: 10,
            heartbeat_interval_ms: 15_000,
            stale_after_ms: 45_000,
            background_grace_ms: 10_000,
            event_buffer: 100,
        }
    }
}

impl SseConfig {
    /// Never zero; a zero period would panic the heartbeat timer
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms.max(1))
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_millis(self.stale_after_ms)
    }

    pub fn background_grace(&self) -> Duration {
        Duration::from_millis(self.background_grace_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct QueueConfig {
    pub max_size: usize,
    pub max_retries: u32,
    pub retry_delay_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        QueueConfig {
            max_size: 100,
            max_retries: 3,
            retry_delay_ms: 1_000,
        }
    }
}

impl QueueConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    /// Linear back-off after the `retry_count`-th failure
    pub fn backoff_after(&self, retry_count: u32) -> Duration {
        self.retry_delay().saturating_mul(retry_count)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct StoreConfig {
    /// SQLite file name inside the config dir
    pub database_file: String,
    pub write_debounce_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig {
            database_file: "parley.db".to_string(),
            write_debounce_ms: 500,
        }
    }
}

impl StoreConfig {
    pub fn write_debounce(&self) -> Duration {
        Duration::from_millis(self.write_debounce_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ConversationConfig {
    pub page_size: usize,
    pub max_message_length: usize,
    pub match_tolerance_ms: i64,
    pub request_timeout_ms: u64,
}

impl Default for ConversationConfig {
    fn default() -> Self {
        ConversationConfig {
            page_size: 20,
            max_message_length: 5_000,
            match_tolerance_ms: 5_000,
            request_timeout_ms: 10_000,
        }
    }
}

impl ConversationConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ClientConfig {
    pub api_url: String,
    pub user_id: Option<String>,
    pub token: Option<String>,
    pub sse: SseConfig,
    pub queue: QueueConfig,
    pub store: StoreConfig,
    pub conversation: ConversationConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            api_url: "http://localhost:3000".to_string(),
            user_id: None,
            token: None,
            sse: SseConfig::default(),
            queue: QueueConfig::default(),
            store: StoreConfig::default(),
            conversation: ConversationConfig::default(),
        }
    }
}

impl ClientConfig {
    /// Load config.json from the config dir (if present) and apply env overrides
    pub fn load() -> Result<Self> {
        let path = get_config_dir()?.join("config.json");
        let mut config = if path.exists() {
            let contents = fs::read_to_string(&path)?;
            let config: ClientConfig = serde_json::from_str(&contents)
                .map_err(|e| anyhow!("Invalid config file {}: {}", path.display(), e))?;
            info!("Loaded configuration from {}", path.display());
            config
        } else {
            debug!("No config file at {}, using defaults", path.display());
            ClientConfig::default()
        };
        config.apply_env();
        Ok(config)
    }

    /// Environment variables win over the file
    pub fn apply_env(&mut self) {
        if let Ok(url) = env::var(ENV_API_URL) {
            self.api_url = url;
        }
        if let Ok(user_id) = env::var(ENV_USER_ID) {
            self.user_id = Some(user_id);
        }
        if let Ok(token) = env::var(ENV_TOKEN) {
            self.token = Some(token);
        }
    }

    pub fn database_path(&self) -> Result<PathBuf> {
        Ok(get_config_dir()?.join(&self.store.database_file))
    }
}
