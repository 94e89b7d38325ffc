//! Switchyard configuration
//!
//! Loads the engine configuration from TOML with three tables:
//! - `[tracer]`: backlog tracer switches, capacity and filters
//! - `[debugger]`: backlog debugger switches and initial breakpoints
//! - `[routes]`: route-level defaults (stream caching, history, delay)
//!
//! Environment overrides are applied on top of the file, then the result is
//! validated so that a bad backlog size fails at startup.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Hard ceiling for the backlog tracer capacity
pub const MAX_BACKLOG_SIZE: usize = 10_000;

/// Default working capacity of the backlog
pub const DEFAULT_BACKLOG_SIZE: usize = 1_000;

/// Default number of body characters kept in a traced snapshot
pub const DEFAULT_BODY_MAX_CHARS: usize = 128 * 1024;

// ============================================================================
// Tracer
// ============================================================================

/// When the backlog snapshot is taken relative to the step
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TracePoint {
    #[default]
    Before,
    After,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TracerConfig {
    pub enabled: bool,
    pub backlog_size: usize,
    pub remove_on_dump: bool,
    pub body_max_chars: usize,
    pub body_include_streams: bool,
    pub include_exception: bool,
    /// Comma separated glob patterns matched against node and route ids
    pub trace_pattern: Option<String>,
    /// Predicate filter, optionally prefixed with `language:`
    pub trace_filter: Option<String>,
    pub trace_point: TracePoint,
    /// Record an extra event without a target node when an exchange enters a route
    pub trace_route_entry: bool,
}

impl Default for TracerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            backlog_size: DEFAULT_BACKLOG_SIZE,
            remove_on_dump: true,
            body_max_chars: DEFAULT_BODY_MAX_CHARS,
            body_include_streams: false,
            include_exception: true,
            trace_pattern: None,
            trace_filter: None,
            trace_point: TracePoint::Before,
            trace_route_entry: false,
        }
    }
}

// ============================================================================
// Debugger
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DebuggerConfig {
    pub enabled: bool,
    /// Comma separated node ids registered as breakpoints on start
    pub initial_breakpoints: Option<String>,
    /// Bounded wait for a parked exchange; absent means wait until released
    pub fallback_timeout_secs: Option<u64>,
    pub body_max_chars: usize,
    pub body_include_streams: bool,
}

impl Default for DebuggerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            initial_breakpoints: None,
            fallback_timeout_secs: None,
            body_max_chars: DEFAULT_BODY_MAX_CHARS,
            body_include_streams: false,
        }
    }
}

impl DebuggerConfig {
    pub fn fallback_timeout(&self) -> Option<Duration> {
        self.fallback_timeout_secs.map(Duration::from_secs)
    }

    /// Initial breakpoints split and trimmed, empty entries dropped
    pub fn initial_breakpoint_ids(&self) -> Vec<String> {
        split_csv(self.initial_breakpoints.as_deref())
    }
}

// ============================================================================
// Route Defaults
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RouteDefaults {
    pub stream_caching: bool,
    pub message_history: bool,
    pub delay_ms: u64,
    /// Context-level switch for tracing-kind intercept strategies
    pub tracing: bool,
    pub instrumentation: bool,
}

impl Default for RouteDefaults {
    fn default() -> Self {
        Self {
            stream_caching: false,
            message_history: false,
            delay_ms: 0,
            tracing: true,
            instrumentation: false,
        }
    }
}

impl RouteDefaults {
    pub fn delay(&self) -> Option<Duration> {
        (self.delay_ms > 0).then(|| Duration::from_millis(self.delay_ms))
    }
}

// ============================================================================
// Engine Config
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub tracer: TracerConfig,
    pub debugger: DebuggerConfig,
    pub routes: RouteDefaults,
}

impl EngineConfig {
    /// Parse and validate a TOML document
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: EngineConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a TOML file, apply environment overrides, then validate
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let mut config: EngineConfig = toml::from_str(&content)?;
        config.apply_env_overrides()?;
        config.validate()?;
        info!(path = %path.display(), "Loaded engine configuration");
        Ok(config)
    }

    pub fn apply_env_overrides(&mut self) -> Result<()> {
        self.apply_overrides_from(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary lookup (environment in production)
    pub fn apply_overrides_from<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("SWITCHYARD_TRACER_ENABLED") {
            self.tracer.enabled = parse_bool("SWITCHYARD_TRACER_ENABLED", &v)?;
            debug!(enabled = self.tracer.enabled, "Tracer enabled overridden from environment");
        }
        if let Some(v) = lookup("SWITCHYARD_TRACER_BACKLOG_SIZE") {
            self.tracer.backlog_size = v.trim().parse().map_err(|_| ConfigError::InvalidValue {
                key: "SWITCHYARD_TRACER_BACKLOG_SIZE".to_string(),
                value: v.clone(),
            })?;
        }
        if let Some(v) = lookup("SWITCHYARD_DEBUGGER_ENABLED") {
            self.debugger.enabled = parse_bool("SWITCHYARD_DEBUGGER_ENABLED", &v)?;
        }
        if let Some(v) = lookup("SWITCHYARD_DEBUGGER_BREAKPOINTS") {
            self.debugger.initial_breakpoints = Some(v);
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        let size = self.tracer.backlog_size;
        if size == 0 || size > MAX_BACKLOG_SIZE {
            return Err(ConfigError::Validation(format!(
                "tracer.backlog_size must be between 1 and {}, was {}",
                MAX_BACKLOG_SIZE, size
            )));
        }
        if self.tracer.body_max_chars == 0 {
            return Err(ConfigError::Validation(
                "tracer.body_max_chars must be greater than 0".to_string(),
            ));
        }
        if self.debugger.fallback_timeout_secs == Some(0) {
            return Err(ConfigError::Validation(
                "debugger.fallback_timeout_secs must be greater than 0 when set".to_string(),
            ));
        }
        Ok(())
    }
}

/// Split a comma separated list, trimming entries and dropping empty ones
pub fn split_csv(value: Option<&str>) -> Vec<String> {
    value
        .map(|v| {
            v.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect()
        })
        .unwrap_or_default()
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" => Ok(true),
        "false" | "0" | "no" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            value: value.to_string(),
        }),
    }
}

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid value for {key}: {value}")]
    InvalidValue { key: String, value: String },

    #[error("Invalid configuration: {0}")]
    Validation(String),
}

pub type Result<T> = std::result::Result<T, ConfigError>;
