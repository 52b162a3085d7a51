//! Runtime configuration.
//!
//! Settings come from a TOML file (path in `CROSSPOST_CONFIG`, default
//! `config/crosspost.toml`) with a handful of `CROSSPOST_*` environment
//! overrides for deployment-specific values and secrets. Everything is
//! validated before any subsystem starts; a bad configuration is the only
//! fatal startup error.
//!
//! The `[rate_limit]` section is additionally watched at runtime and
//! republished to the admission gate by [`ConfigReloader`].

pub mod reload;
pub mod settings;

use std::path::{Path, PathBuf};

use thiserror::Error;

pub use reload::ConfigReloader;
pub use settings::{
    AlertSettings, FetcherSettings, ForwardSettings, HubSettings, PipelineSettings,
    PublisherSettings, RateLimitSettings, Settings, TunnelSettings, YouTubeSettings,
};

/// Environment variable naming the config file.
pub const CONFIG_PATH_VAR: &str = "CROSSPOST_CONFIG";

/// Config file used when `CROSSPOST_CONFIG` is unset.
pub const DEFAULT_CONFIG_PATH: &str = "config/crosspost.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("missing required setting `{0}`")]
    Missing(&'static str),

    #[error("invalid value for `{field}`: {reason}")]
    Invalid { field: String, reason: String },

    #[error("invalid value in environment variable {var}: {reason}")]
    Env { var: &'static str, reason: String },
}

impl ConfigError {
    pub(crate) fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        ConfigError::Invalid {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

/// Resolves the config file path from the environment.
pub fn config_path_from_env() -> PathBuf {
    std::env::var_os(CONFIG_PATH_VAR)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH))
}

/// Loads, overrides from the process environment, and validates.
pub fn load(path: &Path) -> Result<Settings, ConfigError> {
    let mut settings = Settings::from_file(path)?;
    settings.apply_env(|name| std::env::var(name).ok())?;
    settings.validate()?;
    Ok(settings)
}
