//! CLI configuration loader.
//!
//! Reads `config.toml` from an explicit path or from
//! `<config_dir>/aslrun/config.toml` and deserializes it into
//! [`AslrunConfig`]. Falls back to defaults when the file is missing or
//! malformed.

use std::path::{Path, PathBuf};

use aslrun_types::config::AslrunConfig;

/// `<config_dir>/aslrun/config.toml`, if the platform has a config directory.
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("aslrun").join("config.toml"))
}

/// Load configuration from `path`, or from [`default_config_path`] when
/// `path` is `None`.
///
/// - A missing file yields [`AslrunConfig::default()`].
/// - An unreadable or unparsable file logs a warning and yields the default.
pub async fn load_config(path: Option<&Path>) -> AslrunConfig {
    let config_path = match path {
        Some(path) => path.to_path_buf(),
        None => match default_config_path() {
            Some(path) => path,
            None => {
                tracing::debug!("No platform config directory, using defaults");
                return AslrunConfig::default();
            }
        },
    };

    let content = match tokio::fs::read_to_string(&config_path).await {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!("No config found at {}, using defaults", config_path.display());
            return AslrunConfig::default();
        }
        Err(err) => {
            tracing::warn!("Failed to read {}: {err}, using defaults", config_path.display());
            return AslrunConfig::default();
        }
    };

    match toml::from_str::<AslrunConfig>(&content) {
        Ok(config) => config,
        Err(err) => {
            tracing::warn!(
                "Failed to parse {}: {err}, using defaults",
                config_path.display()
            );
            AslrunConfig::default()
        }
    }
}
