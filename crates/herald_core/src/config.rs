//! Configuration loading for Herald.
//!
//! Settings come from a TOML file with one table per concern (`[server]`,
//! `[websocket]`, `[logging]`, `[state]`) and one table per upstream source
//! (`[weibo]`, `[bili_dyn]`, `[bili_live]`). Every field has a default, so
//! an empty file is a valid configuration with all sources disabled.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::data_source::{CadenceClass, PollerConfig};
use crate::error::{ConfigError, CoreError, Result};
use crate::id::{COMMENT_SUBTYPE, SourceType};
use crate::utils::parse_cookie;

/// Cookie keys the bilibili endpoints need for feed reads and follows.
const BILI_COOKIE_KEYS: [&str; 4] = ["bili_jct", "buvid3", "SESSDATA", "DedeUserID"];

const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct HeraldConfig {
    pub server: ServerConfig,
    pub websocket: WebsocketConfig,
    pub logging: LoggingConfig,
    pub state: StateConfig,
    pub weibo: SourceConfig,
    pub bili_dyn: SourceConfig,
    pub bili_live: SourceConfig,
}

/// HTTP control API listener
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 27773,
        }
    }
}

/// Persistent-channel listener
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct WebsocketConfig {
    pub enable: bool,
    pub host: String,
    pub port: u16,
}

impl Default for WebsocketConfig {
    fn default() -> Self {
        Self {
            enable: true,
            host: "127.0.0.1".to_string(),
            port: 27774,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    pub debug: bool,
    pub directory: PathBuf,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            debug: false,
            directory: PathBuf::from("logs"),
        }
    }
}

/// Where watch state and subscriptions are persisted
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StateConfig {
    pub directory: PathBuf,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("state"),
        }
    }
}

/// Per-source polling settings. Intervals are in seconds.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SourceConfig {
    pub enable: bool,
    /// Base feed polling interval
    pub interval: u64,
    /// Upper bound of the random delay added to every sleep
    pub jitter: u64,
    pub fetch_timeout: u64,
    /// Fraction of the interval to wait after a failed cycle
    pub error_backoff_ratio: f64,
    pub cookie: String,
    pub ua: String,
    /// Diff profile attributes (name, avatar, description)
    pub detail_enable: bool,
    /// Pause between detail sub-batches
    pub detail_interval: u64,
    pub comment_enable: bool,
    /// Pause between comment scans of consecutive entities
    pub comment_interval: u64,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            enable: false,
            interval: 30,
            jitter: 15,
            fetch_timeout: 20,
            error_backoff_ratio: 0.5,
            cookie: String::new(),
            ua: DEFAULT_USER_AGENT.to_string(),
            detail_enable: false,
            detail_interval: 5,
            comment_enable: false,
            comment_interval: 30,
        }
    }
}

impl SourceConfig {
    /// Subtypes a control client may subscribe to for this source.
    pub fn subtypes(&self) -> BTreeSet<String> {
        let mut subtypes = BTreeSet::new();
        if self.comment_enable {
            subtypes.insert(COMMENT_SUBTYPE.to_string());
        }
        subtypes
    }

    /// Scheduling parameters for one cadence class of this source.
    pub fn poller_config(&self, class: CadenceClass) -> PollerConfig {
        let base = PollerConfig {
            interval: Duration::from_secs(self.interval),
            jitter: Duration::from_secs(self.jitter),
            fetch_timeout: Duration::from_secs(self.fetch_timeout),
            error_backoff_ratio: self.error_backoff_ratio,
            diff_feed_attributes: self.detail_enable,
            ..PollerConfig::default()
        };
        match class {
            CadenceClass::Feed => base,
            CadenceClass::Detail => PollerConfig {
                interval: Duration::from_secs(10),
                sub_batch_pause: Duration::from_secs(self.detail_interval),
                ..base
            },
            CadenceClass::Comment => PollerConfig {
                interval: Duration::from_secs(self.comment_interval),
                sub_batch_pause: Duration::from_secs(self.comment_interval),
                ..base
            },
        }
    }

    fn validate(&self, source_type: SourceType) -> std::result::Result<(), ConfigError> {
        if !self.enable {
            return Ok(());
        }
        if !(self.error_backoff_ratio > 0.0 && self.error_backoff_ratio <= 10.0) {
            return Err(ConfigError::InvalidValue {
                field: format!("{}.error_backoff_ratio", source_type),
                reason: "must be above 0 and at most 10".to_string(),
            });
        }
        for (name, seconds) in [("interval", self.interval), ("comment_interval", self.comment_interval)] {
            if seconds == 0 {
                return Err(ConfigError::InvalidValue {
                    field: format!("{}.{}", source_type, name),
                    reason: "must be at least one second".to_string(),
                });
            }
        }
        match source_type {
            SourceType::BiliDyn => {
                let cookie = parse_cookie(&self.cookie);
                for key in BILI_COOKIE_KEYS {
                    if !cookie.contains_key(key) {
                        return Err(ConfigError::MissingField(format!("bili_dyn.cookie: {}", key)));
                    }
                }
                Ok(())
            }
            SourceType::Weibo if self.cookie.trim().is_empty() => {
                Err(ConfigError::MissingField("weibo.cookie".to_string()))
            }
            _ => Ok(()),
        }
    }
}

impl HeraldConfig {
    pub fn source(&self, source_type: SourceType) -> &SourceConfig {
        match source_type {
            SourceType::Weibo => &self.weibo,
            SourceType::BiliDyn => &self.bili_dyn,
            SourceType::BiliLive => &self.bili_live,
        }
    }

    pub fn enabled_sources(&self) -> impl Iterator<Item = SourceType> + '_ {
        SourceType::ALL
            .into_iter()
            .filter(|source| self.source(*source).enable)
    }

    /// Checks cross-field constraints serde cannot express.
    pub fn validate(&self, config_path: &str) -> Result<()> {
        for source_type in SourceType::ALL {
            self.source(source_type)
                .validate(source_type)
                .map_err(|cause| {
                    CoreError::config(
                        config_path,
                        source_type.as_str(),
                        "enabled sources need credentials and a positive interval",
                        cause,
                    )
                })?;
        }
        Ok(())
    }

    /// Load configuration from standard locations
    pub async fn load() -> Result<Self> {
        load_config_from_standard_locations().await
    }

    /// Load configuration from a specific file
    pub async fn load_from(path: &Path) -> Result<Self> {
        load_config(path).await
    }

    /// Save configuration to a specific file
    pub async fn save_to(&self, path: &Path) -> Result<()> {
        save_config(self, path).await
    }
}

/// Load configuration from a TOML file
pub async fn load_config(path: &Path) -> Result<HeraldConfig> {
    let content = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| CoreError::ConfigurationError {
            config_path: path.display().to_string(),
            field: "file".to_string(),
            expected: "readable TOML file".to_string(),
            cause: ConfigError::Io(e.to_string()),
        })?;

    let config: HeraldConfig =
        toml::from_str(&content).map_err(|e| CoreError::ConfigurationError {
            config_path: path.display().to_string(),
            field: "content".to_string(),
            expected: "valid TOML configuration".to_string(),
            cause: ConfigError::TomlParse(e.to_string()),
        })?;

    config.validate(&path.display().to_string())?;
    Ok(config)
}

/// Save configuration to a TOML file
pub async fn save_config(config: &HeraldConfig, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| CoreError::ConfigurationError {
                config_path: parent.display().to_string(),
                field: "directory".to_string(),
                expected: "writable directory".to_string(),
                cause: ConfigError::Io(e.to_string()),
            })?;
    }

    let content = toml::to_string_pretty(config).map_err(|e| CoreError::ConfigurationError {
        config_path: path.display().to_string(),
        field: "serialization".to_string(),
        expected: "serializable config structure".to_string(),
        cause: ConfigError::TomlSerialize(e.to_string()),
    })?;

    tokio::fs::write(path, content)
        .await
        .map_err(|e| CoreError::ConfigurationError {
            config_path: path.display().to_string(),
            field: "file".to_string(),
            expected: "writable file location".to_string(),
            cause: ConfigError::Io(e.to_string()),
        })?;

    Ok(())
}

/// Candidate config file locations, most specific first
pub fn config_paths() -> Vec<PathBuf> {
    let mut paths = vec![PathBuf::from("herald.toml")];

    if let Some(config_dir) = dirs::config_dir() {
        paths.push(config_dir.join("herald").join("config.toml"));
    }

    if let Some(home_dir) = dirs::home_dir() {
        paths.push(home_dir.join(".herald").join("config.toml"));
    }

    paths
}

/// Load configuration from standard locations
pub async fn load_config_from_standard_locations() -> Result<HeraldConfig> {
    for path in config_paths() {
        if path.exists() {
            return load_config(&path).await;
        }
    }

    Ok(HeraldConfig::default())
}
