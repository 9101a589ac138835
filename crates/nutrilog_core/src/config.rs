//! Core configuration loading.
//!
//! # Responsibility
//! - Deserialize `CoreConfig` from an optional TOML file.
//! - Layer `NUTRILOG_*` environment overrides on top of file values.
//!
//! # Invariants
//! - Precedence is `env > file > defaults`.
//! - A missing file yields defaults; an unreadable or malformed one is an error.
//! - Returned configs always pass `CoreConfig::validate`.

use log::LevelFilter;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::hash::BuildHasher;
use std::path::{Path, PathBuf};

pub const ENV_DB_PATH: &str = "NUTRILOG_DB_PATH";
pub const ENV_LOG_LEVEL: &str = "NUTRILOG_LOG_LEVEL";
pub const ENV_LOG_DIR: &str = "NUTRILOG_LOG_DIR";
pub const ENV_TAXONOMY: &str = "NUTRILOG_TAXONOMY";

const DEFAULT_DB_FILE: &str = "nutrilog.db";
const SUPPORTED_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

pub type ConfigResult<T> = Result<T, ConfigError>;

#[derive(Debug)]
pub enum ConfigError {
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    Invalid {
        field: &'static str,
        reason: String,
    },
}

impl Display for ConfigError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io { path, source } => {
                write!(f, "failed to read config `{}`: {source}", path.display())
            }
            Self::Parse { path, source } => {
                write!(f, "failed to parse config `{}`: {source}", path.display())
            }
            Self::Invalid { field, reason } => write!(f, "invalid config `{field}`: {reason}"),
        }
    }
}

impl Error for ConfigError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Io { source, .. } => Some(source),
            Self::Parse { source, .. } => Some(source),
            Self::Invalid { .. } => None,
        }
    }
}

/// Runtime settings shared by the core and its front ends.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CoreConfig {
    /// SQLite database file.
    pub db_path: PathBuf,
    /// One of `trace|debug|info|warn|error`.
    pub log_level: String,
    /// Absolute directory for rolling log files.
    pub log_dir: PathBuf,
    /// Optional taxonomy JSON; the built-in definition is used when unset.
    pub taxonomy_path: Option<PathBuf>,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from(DEFAULT_DB_FILE),
            log_level: default_log_level().to_string(),
            log_dir: std::env::temp_dir().join("nutrilog").join("logs"),
            taxonomy_path: None,
        }
    }
}

impl CoreConfig {
    /// Loads `path` (when given) and applies overrides from the process
    /// environment.
    pub fn load(path: Option<&Path>) -> ConfigResult<Self> {
        let env: HashMap<String, String> = std::env::vars_os()
            .filter_map(|(key, value)| Some((key.into_string().ok()?, value.into_string().ok()?)))
            .collect();
        Self::load_from_sources(path, &env)
    }

    /// Same as [`CoreConfig::load`] with an explicit environment map.
    pub fn load_from_sources<S: BuildHasher>(
        path: Option<&Path>,
        env: &HashMap<String, String, S>,
    ) -> ConfigResult<Self> {
        let mut config = match path {
            Some(path) => Self::read_file(path)?,
            None => Self::default(),
        };
        config.apply_env_overrides(env);
        config.validate()?;
        Ok(config)
    }

    /// Parses a TOML document without touching the environment.
    pub fn from_toml_str(contents: &str) -> ConfigResult<Self> {
        Self::parse(Path::new("<inline>"), contents)
    }

    /// Level for the log backend. Fails for the same inputs as `validate`.
    pub fn level_filter(&self) -> ConfigResult<LevelFilter> {
        let level = self.log_level.trim().to_ascii_lowercase();
        if !SUPPORTED_LEVELS.contains(&level.as_str()) {
            return Err(ConfigError::Invalid {
                field: "log_level",
                reason: format!(
                    "`{}` is not one of {}",
                    self.log_level,
                    SUPPORTED_LEVELS.join("|")
                ),
            });
        }
        level.parse().map_err(|_| ConfigError::Invalid {
            field: "log_level",
            reason: format!("`{}` is not a log level", self.log_level),
        })
    }

    /// Checks level and path fields.
    pub fn validate(&self) -> ConfigResult<()> {
        self.level_filter()?;
        if self.db_path.as_os_str().is_empty() {
            return Err(invalid_path("db_path"));
        }
        if self.log_dir.as_os_str().is_empty() {
            return Err(invalid_path("log_dir"));
        }
        if !self.log_dir.is_absolute() {
            return Err(ConfigError::Invalid {
                field: "log_dir",
                reason: format!("`{}` is not absolute", self.log_dir.display()),
            });
        }
        if self
            .taxonomy_path
            .as_ref()
            .is_some_and(|path| path.as_os_str().is_empty())
        {
            return Err(invalid_path("taxonomy_path"));
        }
        Ok(())
    }

    fn read_file(path: &Path) -> ConfigResult<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(path, &contents)
    }

    fn parse(path: &Path, contents: &str) -> ConfigResult<Self> {
        toml::from_str(contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    fn apply_env_overrides<S: BuildHasher>(&mut self, env: &HashMap<String, String, S>) {
        if let Some(value) = non_empty(env, ENV_DB_PATH) {
            self.db_path = PathBuf::from(value);
        }
        if let Some(value) = non_empty(env, ENV_LOG_LEVEL) {
            self.log_level = value.to_ascii_lowercase();
        }
        if let Some(value) = non_empty(env, ENV_LOG_DIR) {
            self.log_dir = PathBuf::from(value);
        }
        if let Some(value) = non_empty(env, ENV_TAXONOMY) {
            self.taxonomy_path = Some(PathBuf::from(value));
        }
    }
}

fn non_empty<'a, S: BuildHasher>(
    env: &'a HashMap<String, String, S>,
    key: &str,
) -> Option<&'a str> {
    env.get(key)
        .map(|value| value.trim())
        .filter(|value| !value.is_empty())
}

/// `debug` in debug builds, `info` in release builds.
fn default_log_level() -> &'static str {
    if cfg!(debug_assertions) {
        "debug"
    } else {
        "info"
    }
}

fn invalid_path(field: &'static str) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: "path must not be empty".to_string(),
    }
}
