//! Host configuration.

mod config;

pub use config::{
    Config, ConfigError, ConfigResult, GitHubConfig, LogFormat, LoggingConfig, PluginsConfig,
    CONFIG_DIR_ENV, SETTABLE_KEYS,
};
