//! Configuration management for Sprig.
//!
//! Settings live in `<config-dir>/config.toml`, where `<config-dir>` is
//! `$SPRIG_CONFIG_DIR` or the platform config directory joined with `sprig`.
//! A missing file means defaults.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Environment variable overriding the config directory.
pub const CONFIG_DIR_ENV: &str = "SPRIG_CONFIG_DIR";

const CONFIG_FILE: &str = "config.toml";
const LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Keys accepted by [`Config::set`].
pub const SETTABLE_KEYS: &[&str] = &[
    "logging.level",
    "logging.format",
    "plugins.directory",
    "plugins.handshake_timeout_secs",
    "plugins.run_timeout_secs",
];

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Could not determine config directory")]
    NoConfigDir,

    #[error("Failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("Failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Unknown config key '{0}'")]
    UnknownKey(String),

    #[error("Invalid value '{value}' for {key}: {reason}")]
    InvalidValue { key: String, value: String, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for configuration operations.
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Application configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Logging settings
    pub logging: LoggingConfig,

    /// Plugin loading settings
    pub plugins: PluginsConfig,

    /// GitHub access for `plugins install`
    pub github: GitHubConfig,
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl std::str::FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "text" => Ok(Self::Text),
            "json" => Ok(Self::Json),
            _ => Err("expected 'text' or 'json'".to_string()),
        }
    }
}

/// Logging settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Minimum level (`trace`, `debug`, `info`, `warn`, `error`)
    pub level: String,

    /// Output format
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: "warn".to_string(), format: LogFormat::Text }
    }
}

/// Plugin loading settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PluginsConfig {
    /// Plugin directory (defaults to `<config-dir>/plugins`)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub directory: Option<String>,

    /// Seconds a plugin has to print its handshake line
    pub handshake_timeout_secs: u64,

    /// Seconds a single plugin call may take (unset waits forever)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_timeout_secs: Option<u64>,
}

impl Default for PluginsConfig {
    fn default() -> Self {
        Self { directory: None, handshake_timeout_secs: 60, run_timeout_secs: None }
    }
}

/// GitHub access tokens, keyed by a user-chosen name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GitHubConfig {
    pub tokens: BTreeMap<String, String>,
}

impl Config {
    /// Directory holding the config file and, by default, the plugins.
    pub fn config_dir() -> ConfigResult<PathBuf> {
        if let Some(dir) = std::env::var_os(CONFIG_DIR_ENV).filter(|d| !d.is_empty()) {
            return Ok(PathBuf::from(dir));
        }
        dirs::config_dir().map(|d| d.join(crate::APP_NAME)).ok_or(ConfigError::NoConfigDir)
    }

    /// Path of the config file inside `dir`.
    pub fn file_in(dir: &Path) -> PathBuf {
        dir.join(CONFIG_FILE)
    }

    /// Load from `dir`, falling back to defaults when no file exists.
    pub fn load_from_dir(dir: &Path) -> ConfigResult<Self> {
        let path = Self::file_in(dir);
        if !path.exists() {
            return Ok(Self::default());
        }
        Self::load_from_file(&path)
    }

    /// Load configuration from a specific file.
    pub fn load_from_file(path: &Path) -> ConfigResult<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|source| ConfigError::Read { path: path.to_path_buf(), source })?;
        toml::from_str(&content)
            .map_err(|source| ConfigError::Parse { path: path.to_path_buf(), source })
    }

    /// Save to the config directory.
    pub fn save_to_dir(&self, dir: &Path) -> ConfigResult<PathBuf> {
        std::fs::create_dir_all(dir)?;
        let path = Self::file_in(dir);
        std::fs::write(&path, toml::to_string_pretty(self)?)?;
        Ok(path)
    }

    /// Plugin directory, relative to `config_dir` unless configured.
    pub fn plugins_dir(&self, config_dir: &Path) -> PathBuf {
        match &self.plugins.directory {
            Some(dir) => PathBuf::from(shellexpand::tilde(dir).into_owned()),
            None => config_dir.join("plugins"),
        }
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.plugins.handshake_timeout_secs)
    }

    pub fn run_timeout(&self) -> Option<Duration> {
        self.plugins.run_timeout_secs.map(Duration::from_secs)
    }

    /// Set one of [`SETTABLE_KEYS`] from its string form.
    pub fn set(&mut self, key: &str, value: &str) -> ConfigResult<()> {
        let invalid = |reason: &str| ConfigError::InvalidValue {
            key: key.to_string(),
            value: value.to_string(),
            reason: reason.to_string(),
        };

        match key {
            "logging.level" => {
                let level = value.to_lowercase();
                if !LOG_LEVELS.contains(&level.as_str()) {
                    return Err(invalid(&format!("expected one of {}", LOG_LEVELS.join(", "))));
                }
                self.logging.level = level;
            }
            "logging.format" => {
                self.logging.format = value.parse().map_err(|e: String| invalid(&e))?;
            }
            "plugins.directory" => {
                self.plugins.directory = (!value.is_empty()).then(|| value.to_string());
            }
            "plugins.handshake_timeout_secs" => {
                let secs: u64 = value.parse().map_err(|_| invalid("expected whole seconds"))?;
                if secs == 0 {
                    return Err(invalid("must be greater than zero"));
                }
                self.plugins.handshake_timeout_secs = secs;
            }
            "plugins.run_timeout_secs" => {
                self.plugins.run_timeout_secs = match value {
                    "" | "none" => None,
                    v => Some(v.parse().map_err(|_| invalid("expected whole seconds or 'none'"))?),
                };
            }
            _ => return Err(ConfigError::UnknownKey(key.to_string())),
        }
        Ok(())
    }

    /// Copy with token values hidden, for display.
    pub fn masked(&self) -> Self {
        let mut copy = self.clone();
        for value in copy.github.tokens.values_mut() {
            *value = mask(value);
        }
        copy
    }
}

fn mask(token: &str) -> String {
    let chars: Vec<char> = token.chars().collect();
    if chars.len() <= 8 {
        return "*".repeat(chars.len());
    }
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("{}{}", "*".repeat(chars.len() - 4), tail)
}
