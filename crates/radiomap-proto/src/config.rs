use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use super::platform;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub directory: DirectoryConfig,
    #[serde(default)]
    pub playback: PlaybackConfig,
    #[serde(default)]
    pub favorites: FavoritesConfig,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub mpv: MpvConfig,
}

/// Remote station directory (radio-browser compatible JSON API).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirectoryConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    /// Max stations fetched per country / tag query.
    #[serde(default = "default_station_limit")]
    pub station_limit: usize,
    /// Max tag names offered to the genre selector.
    #[serde(default = "default_tag_limit")]
    pub tag_limit: usize,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlaybackConfig {
    /// Initial volume, 0..=100.
    #[serde(default = "default_volume")]
    pub default_volume: u8,
    /// Minimum spacing between audible volume changes.
    #[serde(default = "default_volume_interval_ms")]
    pub volume_interval_ms: u64,
    /// A play attempt still loading after this many seconds is marked failed.
    /// 0 disables the deadline.
    #[serde(default = "default_start_timeout_secs")]
    pub start_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FavoritesConfig {
    #[serde(default = "default_favorites_file")]
    pub file: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "default_http_enabled")]
    pub enabled: bool,
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct MpvConfig {
    /// Explicit mpv binary.  When unset, beside-exe then PATH are searched.
    #[serde(default)]
    pub binary: Option<PathBuf>,
}

impl Default for DirectoryConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            user_agent: default_user_agent(),
            station_limit: default_station_limit(),
            tag_limit: default_tag_limit(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            default_volume: default_volume(),
            volume_interval_ms: default_volume_interval_ms(),
            start_timeout_secs: default_start_timeout_secs(),
        }
    }
}

impl Default for FavoritesConfig {
    fn default() -> Self {
        Self {
            file: default_favorites_file(),
        }
    }
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            enabled: default_http_enabled(),
            bind_address: default_bind_address(),
            port: default_port(),
        }
    }
}

fn default_base_url() -> String {
    "https://de1.api.radio-browser.info/json".to_string()
}

fn default_user_agent() -> String {
    format!("radiomap/{}", env!("CARGO_PKG_VERSION"))
}

fn default_station_limit() -> usize {
    100
}

fn default_tag_limit() -> usize {
    100
}

fn default_request_timeout_secs() -> u64 {
    15
}

fn default_volume() -> u8 {
    100
}

fn default_volume_interval_ms() -> u64 {
    100
}

fn default_start_timeout_secs() -> u64 {
    15
}

fn default_favorites_file() -> PathBuf {
    platform::data_dir().join("favorites.json")
}

fn default_http_enabled() -> bool {
    true
}

fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8990
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        let config_path = Self::config_path();

        if !config_path.exists() {
            let config = Self::default();
            config.save()?;
            return Ok(config);
        }

        let content = std::fs::read_to_string(&config_path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        let config: Self = toml::from_str(content)?;
        Ok(config)
    }

    pub fn save(&self) -> anyhow::Result<()> {
        let config_path = Self::config_path();
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(&config_path, content)?;
        Ok(())
    }

    pub fn config_path() -> PathBuf {
        platform::config_dir().join("config.toml")
    }
}
