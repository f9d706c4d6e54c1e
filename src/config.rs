use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub calls: CallsConfig,

    #[serde(default)]
    pub objects: ObjectsConfig,

    #[serde(default)]
    pub closures: ClosuresConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallsConfig {
    /// Log every call at debug level instead of trace
    #[serde(default = "default_false")]
    pub trace_calls: bool,

    #[serde(default = "default_true")]
    pub warn_missing_arguments: bool,

    #[serde(default = "default_true")]
    pub warn_extra_arguments: bool,

    /// Idle frames kept by the call pool
    #[serde(default = "default_pool_limit")]
    pub pool_limit: usize,

    /// Prepared call interfaces kept by the LRU cache
    #[serde(default = "default_interface_cache_size")]
    pub interface_cache_size: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectsConfig {
    /// Keep pointers into the native stack out of the registry
    #[serde(default = "default_true")]
    pub detect_stack_pointers: bool,

    /// Distance in bytes from the current frame still considered "on the stack"
    #[serde(default = "default_stack_window")]
    pub stack_window: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClosuresConfig {
    /// Re-raise callback errors from the enclosing foreign call
    #[serde(default = "default_true")]
    pub propagate_errors: bool,

    /// Finalized trampolines kept alive to catch stray native calls
    #[serde(default = "default_retired_limit")]
    pub retired_limit: usize,
}

/// Subscriber settings; see [`crate::logging::LogConfig`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default)]
    pub file: Option<PathBuf>,

    #[serde(default = "default_false")]
    pub json: bool,

    #[serde(default = "default_false")]
    pub span_events: bool,
}

impl Default for CallsConfig {
    fn default() -> Self {
        Self {
            trace_calls: false,
            warn_missing_arguments: true,
            warn_extra_arguments: true,
            pool_limit: default_pool_limit(),
            interface_cache_size: default_interface_cache_size(),
        }
    }
}

impl Default for ObjectsConfig {
    fn default() -> Self {
        Self {
            detect_stack_pointers: true,
            stack_window: default_stack_window(),
        }
    }
}

impl Default for ClosuresConfig {
    fn default() -> Self {
        Self {
            propagate_errors: true,
            retired_limit: default_retired_limit(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: None,
            json: false,
            span_events: false,
        }
    }
}

fn default_true() -> bool { true }
fn default_false() -> bool { false }
fn default_pool_limit() -> usize { 16 }
fn default_interface_cache_size() -> usize { 256 }
fn default_stack_window() -> usize { 64 * 1024 }
fn default_retired_limit() -> usize { 64 }
fn default_log_level() -> String { "info".to_string() }

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
}

impl EngineConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Parse configuration from TOML string
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    /// Apply `CALLGATE_*` environment overrides
    pub fn with_env_overrides(mut self) -> Self {
        if let Some(flag) = env_flag("CALLGATE_TRACE_CALLS") {
            self.calls.trace_calls = flag;
        }
        if let Some(flag) = env_flag("CALLGATE_DETECT_STACK") {
            self.objects.detect_stack_pointers = flag;
        }
        if let Some(limit) = std::env::var("CALLGATE_POOL_LIMIT")
            .ok()
            .and_then(|v| v.trim().parse().ok())
        {
            self.calls.pool_limit = limit;
        }
        if let Ok(level) = std::env::var("CALLGATE_LOG_LEVEL") {
            self.logging.level = level;
        }
        self
    }
}

fn env_flag(name: &str) -> Option<bool> {
    let value = std::env::var(name).ok()?;
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
