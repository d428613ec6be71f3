//! Logging bootstrap.
//!
//! The engine logs through `tracing`: migration progress at `info`, connection
//! resolution and job lifecycle at `debug`, retries and failures at `warn`.
//! Applications that already install a subscriber need nothing from this
//! module. Others can call [`init`], which reads:
//!
//! - `TENANTI_DEBUG=true|1|yes` - enable debug logging
//! - `TENANTI_LOG_LEVEL=trace|debug|info|warn|error` - set the level
//! - `TENANTI_LOG_FORMAT=json|pretty|compact` - output format (default: json)
//!
//! Installing the subscriber requires the `tracing-subscriber` feature.

use std::env;
use std::fmt;
use std::sync::Once;

static INIT: Once = Once::new();

const DEBUG_VAR: &str = "TENANTI_DEBUG";
const LEVEL_VAR: &str = "TENANTI_LOG_LEVEL";
const FORMAT_VAR: &str = "TENANTI_LOG_FORMAT";

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// One JSON object per line.
    #[default]
    Json,
    /// Multi-line human readable output.
    Pretty,
    /// Single-line human readable output.
    Compact,
}

impl LogFormat {
    /// Parse a format name, falling back to JSON.
    pub fn parse(value: &str) -> Self {
        match value.to_lowercase().as_str() {
            "pretty" => Self::Pretty,
            "compact" => Self::Compact,
            _ => Self::Json,
        }
    }
}

impl fmt::Display for LogFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Json => "json",
            Self::Pretty => "pretty",
            Self::Compact => "compact",
        };
        f.write_str(name)
    }
}

/// Resolved logging settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogSettings {
    /// Whether any logging was requested.
    pub enabled: bool,
    /// Level directive.
    pub level: &'static str,
    /// Output format.
    pub format: LogFormat,
}

impl LogSettings {
    /// Read settings from the environment.
    pub fn from_env() -> Self {
        Self::resolve(
            env::var(DEBUG_VAR).ok().as_deref(),
            env::var(LEVEL_VAR).ok().as_deref(),
            env::var(FORMAT_VAR).ok().as_deref(),
        )
    }

    /// Resolve settings from raw variable values.
    pub fn resolve(debug: Option<&str>, level: Option<&str>, format: Option<&str>) -> Self {
        let debug = debug.is_some_and(is_truthy);
        let fallback = if debug { "debug" } else { "warn" };
        let requested = level.is_some();

        let level = match level.map(str::to_lowercase).as_deref() {
            Some("trace") => "trace",
            Some("debug") => "debug",
            Some("info") => "info",
            Some("warn") => "warn",
            Some("error") => "error",
            _ => fallback,
        };

        Self {
            enabled: debug || requested,
            level,
            format: format.map(LogFormat::parse).unwrap_or_default(),
        }
    }

    /// Filter directive covering the tenanti crates.
    pub fn filter(&self) -> String {
        format!("tenanti={0},tenanti_migrate={0}", self.level)
    }
}

fn is_truthy(value: &str) -> bool {
    matches!(value.to_lowercase().as_str(), "true" | "1" | "yes")
}

/// Check if debug logging is enabled via `TENANTI_DEBUG`.
#[inline]
pub fn is_debug_enabled() -> bool {
    env::var(DEBUG_VAR).is_ok_and(|v| is_truthy(&v))
}

/// Initialize logging from the environment. Subsequent calls are no-ops.
pub fn init() {
    init_with(LogSettings::from_env());
}

/// Initialize logging with explicit settings. Subsequent calls are no-ops.
pub fn init_with(settings: LogSettings) {
    INIT.call_once(|| {
        if !settings.enabled {
            return;
        }

        #[cfg(feature = "tracing-subscriber")]
        {
            use tracing_subscriber::{EnvFilter, fmt, prelude::*};

            let filter = EnvFilter::try_new(settings.filter()).unwrap_or_else(|_| EnvFilter::new("warn"));
            let registry = tracing_subscriber::registry().with(filter);

            // try_init: the host application may own the global subscriber.
            let installed = match settings.format {
                LogFormat::Json => registry.with(fmt::layer().json()).try_init(),
                LogFormat::Compact => registry.with(fmt::layer().compact()).try_init(),
                LogFormat::Pretty => registry.with(fmt::layer().pretty()).try_init(),
            };

            if installed.is_ok() {
                tracing::info!(
                    level = settings.level,
                    format = %settings.format,
                    "Tenanti logging initialized"
                );
            }
        }
    });
}
