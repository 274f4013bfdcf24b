// Server settings
// Loaded from ~/.config/cosheet/server.toml

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// What an authenticated user may do with a document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    #[default]
    Editor,
    /// May join, leave and snapshot; edits and resizes are rejected
    Viewer,
}

impl Role {
    pub fn can_write(&self) -> bool {
        matches!(self, Role::Editor)
    }
}

/// How connections prove who they are.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthMode {
    /// Token must appear in `auth.tokens`
    Token,
    /// Token is taken as the user id, every user is an editor (local development)
    #[default]
    Trust,
}

/// A user and role a token maps to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenGrant {
    pub user: String,
    #[serde(default)]
    pub role: Role,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthSettings {
    pub mode: AuthMode,
    pub tokens: BTreeMap<String, TokenGrant>,
}

/// Collaboration server settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    /// TCP listen address
    pub bind: String,

    // Document dimensions
    pub default_rows: usize,
    pub default_cols: usize,
    pub max_rows: usize,
    pub max_cols: usize,

    // Lifecycle
    /// How long a document with no sessions stays resident before persist-and-unload
    pub idle_grace_ms: u64,
    /// Bound on loading a document from the store on first join
    pub load_timeout_ms: u64,

    // Connections
    /// Outbound events buffered per connection before dropping
    pub event_queue_depth: usize,
    pub max_connections: usize,
    /// Consecutive malformed lines tolerated before closing a connection
    pub max_parse_failures: u32,

    /// SQLite database path. None keeps documents in memory only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub database: Option<PathBuf>,

    pub auth: AuthSettings,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:5000".to_string(),
            default_rows: 50,
            default_cols: 20,
            max_rows: 1000,
            max_cols: 100,
            idle_grace_ms: 30_000,
            load_timeout_ms: 5_000,
            event_queue_depth: 256,
            max_connections: 64,
            max_parse_failures: 3,
            database: None,
            auth: AuthSettings::default(),
        }
    }
}

impl ServerSettings {
    /// Default settings file path
    pub fn config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("cosheet")
            .join("server.toml")
    }

    /// Load from the default path. A missing file yields defaults.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(&Self::config_path())
    }

    /// Load from `path`. A missing file yields defaults; a malformed one is an error.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            log::debug!("no settings file at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        let contents = fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        let settings = Self::from_toml_str(&contents).map_err(|e| match e {
            ConfigError::Parse { message, .. } => ConfigError::Parse {
                path: Some(path.to_path_buf()),
                message,
            },
            other => other,
        })?;
        log::info!("loaded settings from {}", path.display());
        Ok(settings)
    }

    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        let settings: Self = toml::from_str(contents).map_err(|e| ConfigError::Parse {
            path: None,
            message: e.to_string(),
        })?;
        settings.validate()?;
        Ok(settings)
    }

    /// Render as TOML (for `--print-config`).
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::Invalid(e.to_string()))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.default_rows == 0 || self.default_cols == 0 {
            return Err(ConfigError::Invalid(
                "default_rows and default_cols must be at least 1".into(),
            ));
        }
        if self.default_rows > self.max_rows || self.default_cols > self.max_cols {
            return Err(ConfigError::Invalid(format!(
                "default extent {}x{} exceeds maximum {}x{}",
                self.default_rows, self.default_cols, self.max_rows, self.max_cols
            )));
        }
        if self.event_queue_depth == 0 {
            return Err(ConfigError::Invalid("event_queue_depth must be at least 1".into()));
        }
        if self.auth.mode == AuthMode::Token && self.auth.tokens.is_empty() {
            return Err(ConfigError::Invalid(
                "auth.mode = \"token\" requires at least one entry in auth.tokens".into(),
            ));
        }
        Ok(())
    }

    pub fn idle_grace(&self) -> Duration {
        Duration::from_millis(self.idle_grace_ms)
    }

    pub fn load_timeout(&self) -> Duration {
        Duration::from_millis(self.load_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ConfigError {
    Io { path: PathBuf, message: String },
    Parse { path: Option<PathBuf>, message: String },
    Invalid(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Io { path, message } => {
                write!(f, "cannot read {}: {}", path.display(), message)
            }
            ConfigError::Parse { path: Some(path), message } => {
                write!(f, "invalid settings in {}: {}", path.display(), message)
            }
            ConfigError::Parse { path: None, message } => write!(f, "invalid settings: {}", message),
            ConfigError::Invalid(message) => write!(f, "invalid settings: {}", message),
        }
    }
}

impl std::error::Error for ConfigError {}
