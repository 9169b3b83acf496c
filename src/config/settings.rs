//! TOML-based configuration for repobridge.
//!
//! Supports a config file (repobridge.toml) with environment variable expansion.
//!
//! Example configuration:
//! ```toml
//! [engine]
//! path = "${XDG_DATA_HOME}/repobridge/app.db"
//! busy_timeout_ms = 5000
//!
//! [client]
//! request_timeout_ms = 30000
//! channel_capacity = 64
//!
//! [bootstrap]
//! auto_start = true
//! on_failure = "fail_closed"  # or "degrade"
//!
//! [logging]
//! level = "info"
//! ```

use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Error type for settings.
#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("Config file not found: {0}")]
    FileNotFound(PathBuf),

    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse config file: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Missing environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Root configuration structure.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Settings {
    pub engine: EngineSettings,
    pub client: ClientSettings,
    pub bootstrap: BootstrapSettings,
    pub logging: LoggingSettings,
}

/// Embedded database settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct EngineSettings {
    /// Database file (supports ${ENV_VAR} expansion). In-memory when unset.
    pub path: Option<String>,

    /// How long SQLite waits on a locked database.
    pub busy_timeout_ms: u64,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            path: None,
            busy_timeout_ms: 5_000,
        }
    }
}

impl EngineSettings {
    /// Get the database path with environment variables expanded.
    pub fn resolved_path(&self) -> Result<Option<PathBuf>, SettingsError> {
        match &self.path {
            Some(path) if path == ":memory:" => Ok(None),
            Some(path) => Ok(Some(PathBuf::from(expand_env_vars(path)?))),
            None => Ok(None),
        }
    }

    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }
}

/// Caller-side settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ClientSettings {
    /// Per-call deadline. Zero disables it.
    pub request_timeout_ms: u64,

    /// Buffer size of the in-memory request and response channels.
    pub channel_capacity: usize,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            request_timeout_ms: 30_000,
            channel_capacity: 64,
        }
    }
}

impl ClientSettings {
    pub fn request_timeout(&self) -> Option<Duration> {
        (self.request_timeout_ms > 0).then(|| Duration::from_millis(self.request_timeout_ms))
    }
}

/// What the readiness gate does when a startup step fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Keep the gate closed; requests fail with `EngineNotInitialized`.
    #[default]
    FailClosed,
    /// Log migration failures and open the gate anyway.
    Degrade,
}

/// Engine startup settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct BootstrapSettings {
    /// Start bootstrap as soon as the dispatcher starts.
    pub auto_start: bool,

    pub on_failure: FailurePolicy,
}

impl Default for BootstrapSettings {
    fn default() -> Self {
        Self {
            auto_start: true,
            on_failure: FailurePolicy::FailClosed,
        }
    }
}

/// Logging settings. `RUST_LOG` takes precedence when set.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingSettings {
    pub level: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl Settings {
    /// Load settings from a TOML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, SettingsError> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(SettingsError::FileNotFound(path.to_path_buf()));
        }

        let content = fs::read_to_string(path)?;
        let settings: Settings = toml::from_str(&content)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Load settings from the default config file locations.
    ///
    /// Searches in order:
    /// 1. Environment variable `REPOBRIDGE_CONFIG`
    /// 2. `./repobridge.toml`
    /// 3. `~/.config/repobridge/config.toml`
    pub fn load() -> Result<Self, SettingsError> {
        if let Ok(path) = env::var("REPOBRIDGE_CONFIG") {
            return Self::from_file(&path);
        }

        let local_config = PathBuf::from("repobridge.toml");
        if local_config.exists() {
            return Self::from_file(&local_config);
        }

        if let Some(config_dir) = dirs::config_dir() {
            let user_config = config_dir.join("repobridge").join("config.toml");
            if user_config.exists() {
                return Self::from_file(&user_config);
            }
        }

        Ok(Settings::default())
    }

    fn validate(&self) -> Result<(), SettingsError> {
        if self.client.channel_capacity == 0 {
            return Err(SettingsError::InvalidConfig(
                "client.channel_capacity must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Expand environment variables in a string.
///
/// Supports `${VAR}` and `$VAR` syntax.
pub fn expand_env_vars(s: &str) -> Result<String, SettingsError> {
    let mut result = String::with_capacity(s.len());
    let mut chars = s.chars().peekable();

    while let Some(c) = chars.next() {
        if c != '$' {
            result.push(c);
            continue;
        }

        let mut var_name = String::new();
        if chars.peek() == Some(&'{') {
            chars.next(); // consume '{'
            for ch in chars.by_ref() {
                if ch == '}' {
                    break;
                }
                var_name.push(ch);
            }
        } else {
            // $VAR ends at the first non-alphanumeric, non-underscore char
            while let Some(&ch) = chars.peek() {
                if !(ch.is_alphanumeric() || ch == '_') {
                    break;
                }
                var_name.push(ch);
                chars.next();
            }
            if var_name.is_empty() {
                // Just a lone $, keep it
                result.push('$');
                continue;
            }
        }

        let value =
            env::var(&var_name).map_err(|_| SettingsError::MissingEnvVar(var_name.clone()))?;
        result.push_str(&value);
    }

    Ok(result)
}
