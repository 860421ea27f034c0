//! Layered TOML configuration for Parlor.
//!
//! Reads configuration from multiple sources with precedence:
//! CLI flags > env vars > config file > defaults

use parlor_session::{CompactionSettings, DEFAULT_MAX_HISTORY};
use parlor_types::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Environment variable overriding the history cap.
pub const ENV_MAX_HISTORY: &str = "PARLOR_MAX_HISTORY";

/// Environment variable overriding the data directory.
pub const ENV_DATA_DIR: &str = "PARLOR_DATA_DIR";

/// Environment variable overriding the config directory.
pub const ENV_CONFIG_DIR: &str = "PARLOR_CONFIG_DIR";

/// Resolved configuration for the session store and compactor.
#[derive(Debug, Clone)]
pub struct ParlorConfig {
    /// Root of persisted state. Sessions live in `<data_dir>/sessions`.
    pub data_dir: PathBuf,
    pub max_history: usize,
    pub compaction: CompactionSettings,
    pub config_dir: PathBuf,
}

/// Settings that can be read from a TOML config file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SettingsFile {
    #[serde(default)]
    pub session: SessionSettings,
    #[serde(default)]
    pub compaction: CompactionFileSettings,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionSettings {
    pub max_history: Option<usize>,
    pub data_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CompactionFileSettings {
    pub max_tokens: Option<usize>,
    pub keep_recent_tokens: Option<usize>,
}

/// CLI overrides that take highest precedence.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub data_dir: Option<PathBuf>,
    pub max_history: Option<usize>,
}

impl ParlorConfig {
    /// Load configuration from all sources, applying precedence rules.
    ///
    /// Precedence (highest to lowest):
    /// 1. CLI flags
    /// 2. Environment variables
    /// 3. Config file (~/.parlor/config.toml)
    /// 4. Defaults
    pub fn load(overrides: CliOverrides) -> Result<Self, ConfigError> {
        let config_dir = config_dir();
        let settings = load_settings_file(&config_dir.join("config.toml"));
        Self::resolve(overrides, settings, config_dir, |name| {
            std::env::var(name).ok()
        })
    }

    /// Apply precedence rules over already-read sources. `env` looks up an
    /// environment variable by name.
    pub fn resolve(
        overrides: CliOverrides,
        settings: SettingsFile,
        config_dir: PathBuf,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let env_max_history = match env(ENV_MAX_HISTORY) {
            Some(raw) => Some(raw.trim().parse::<usize>().map_err(|e| {
                ConfigError::InvalidValue {
                    key: ENV_MAX_HISTORY.into(),
                    message: format!("{raw:?} is not a count: {e}"),
                }
            })?),
            None => None,
        };

        let max_history = overrides
            .max_history
            .or(env_max_history)
            .or(settings.session.max_history)
            .unwrap_or(DEFAULT_MAX_HISTORY);
        if max_history == 0 {
            return Err(ConfigError::InvalidValue {
                key: "max_history".into(),
                message: "must be at least 1".into(),
            });
        }

        let data_dir = overrides
            .data_dir
            .or_else(|| env(ENV_DATA_DIR).filter(|d| !d.is_empty()).map(PathBuf::from))
            .or(settings.session.data_dir)
            .unwrap_or_else(|| config_dir.clone());

        let defaults = CompactionSettings::default();
        let compaction = CompactionSettings {
            max_tokens: settings
                .compaction
                .max_tokens
                .unwrap_or(defaults.max_tokens),
            keep_recent_tokens: settings
                .compaction
                .keep_recent_tokens
                .unwrap_or(defaults.keep_recent_tokens),
        };
        if compaction.max_tokens == 0 {
            return Err(ConfigError::InvalidValue {
                key: "compaction.max_tokens".into(),
                message: "must be at least 1".into(),
            });
        }

        Ok(ParlorConfig {
            data_dir,
            max_history,
            compaction,
            config_dir,
        })
    }
}

/// Get the Parlor config directory path (~/.parlor/).
pub fn config_dir() -> PathBuf {
    if let Ok(dir) = std::env::var(ENV_CONFIG_DIR) {
        return PathBuf::from(dir);
    }
    dirs_next::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".parlor")
}

/// Load and parse a TOML settings file, returning defaults on any error.
pub fn load_settings_file(path: &Path) -> SettingsFile {
    match std::fs::read_to_string(path) {
        Ok(content) => toml::from_str(&content).unwrap_or_else(|e| {
            tracing::warn!("Failed to parse {}: {}", path.display(), e);
            SettingsFile::default()
        }),
        Err(_) => SettingsFile::default(),
    }
}
