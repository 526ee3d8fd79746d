use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::task::DEFAULT_MAX_ATTEMPTS;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },
    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),
    #[error("failed to write config file {path}: {source}")]
    Write {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Process-wide configuration. Every field has a default so a missing file,
/// or a file missing some keys, still yields a fully usable configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub store: StoreConfig,
    pub timing: TimingConfig,
    pub defaults: DefaultsConfig,
    pub server: ServerConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            store: StoreConfig::default(),
            timing: TimingConfig::default(),
            defaults: DefaultsConfig::default(),
            server: ServerConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Empty = embedded in-memory SQLite (non-persistent; a warning is
    /// logged on startup in that case).
    pub dsn: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self { dsn: String::new() }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    pub reconciler_interval_secs: u64,
    pub poll_deadline_secs: u64,
    pub heartbeat_stale_secs: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            reconciler_interval_secs: 30,
            poll_deadline_secs: 30,
            heartbeat_stale_secs: 120,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DefaultsConfig {
    pub default_model: String,
    pub max_attempts_default: u32,
}

impl Default for DefaultsConfig {
    fn default() -> Self {
        Self {
            default_model: "claude-default".to_string(),
            max_attempts_default: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_addr: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8080".to_string(),
        }
    }
}

pub fn parse_config(raw: &str) -> Result<Config, toml::de::Error> {
    toml::from_str(raw)
}

pub fn load_config(path: impl AsRef<Path>) -> Result<Config, ConfigError> {
    let path_ref = path.as_ref();
    let display = path_ref.display().to_string();
    let raw = fs::read_to_string(path_ref).map_err(|source| ConfigError::Read {
        path: display.clone(),
        source,
    })?;
    parse_config(&raw).map_err(|source| ConfigError::Parse {
        path: display,
        source,
    })
}

pub fn save_config(path: impl AsRef<Path>, config: &Config) -> Result<(), ConfigError> {
    let path_ref = path.as_ref();
    let display = path_ref.display().to_string();
    let raw = toml::to_string_pretty(config)?;
    fs::write(path_ref, raw).map_err(|source| ConfigError::Write {
        path: display,
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_matches_documented_defaults() {
        let config = Config::default();
        assert_eq!(config.timing.reconciler_interval_secs, 30);
        assert_eq!(config.timing.poll_deadline_secs, 30);
        assert_eq!(config.timing.heartbeat_stale_secs, 120);
        assert_eq!(config.defaults.max_attempts_default, 5);
        assert_eq!(config.store.dsn, "");
    }

    #[test]
    fn parse_empty_document_yields_defaults() {
        let config = parse_config("").expect("empty toml parses");
        assert_eq!(config, Config::default());
    }

    #[test]
    fn parse_partial_document_fills_remaining_defaults() {
        let raw = r#"
            [timing]
            reconciler_interval_secs = 5
        "#;
        let config = parse_config(raw).expect("partial toml parses");
        assert_eq!(config.timing.reconciler_interval_secs, 5);
        assert_eq!(config.timing.poll_deadline_secs, 30);
        assert_eq!(config.defaults.max_attempts_default, 5);
    }

    #[test]
    fn save_then_load_roundtrips() {
        let dir = tempdir();
        let path = dir.join("verve.toml");
        let mut config = Config::default();
        config.defaults.default_model = "gpt-5-codex".to_string();
        save_config(&path, &config).expect("save succeeds");
        let loaded = load_config(&path).expect("load succeeds");
        assert_eq!(loaded, config);
        let _ = fs::remove_dir_all(&dir);
    }

    fn tempdir() -> std::path::PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "verve-core-config-test-{}",
            std::process::id()
        ));
        fs::create_dir_all(&dir).expect("create tempdir");
        dir
    }
}
