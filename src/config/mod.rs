//! Configuration module for the bridge.
//!
//! Handles the settings file, environment variables, and defaults.

mod settings;

pub use settings::{
    expand_env_vars, BootstrapSettings, ClientSettings, EngineSettings, FailurePolicy,
    LoggingSettings, Settings, SettingsError,
};
