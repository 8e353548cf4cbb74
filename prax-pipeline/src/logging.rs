//! Logging bootstrap for the pipeline.
//!
//! Middleware emit `tracing` events under the `prax::query` and
//! `prax::pipeline` targets. Applications that already install a subscriber
//! need nothing from this module; others can call [`init`] once at startup.
//!
//! # Environment Variables
//!
//! - `PRAX_DEBUG=true|1|yes` - Enable debug logging
//! - `PRAX_LOG_LEVEL=trace|debug|info|warn|error` - Set a specific level
//! - `PRAX_LOG_FORMAT=json|pretty|compact` - Output format (default: json)
//!
//! ```rust,no_run
//! prax_pipeline::logging::init();
//! ```

use std::env;
use std::sync::Once;

static INIT: Once = Once::new();

/// Environment variable enabling debug logging.
pub const ENV_DEBUG: &str = "PRAX_DEBUG";
/// Environment variable selecting the log level.
pub const ENV_LOG_LEVEL: &str = "PRAX_LOG_LEVEL";
/// Environment variable selecting the output format.
pub const ENV_LOG_FORMAT: &str = "PRAX_LOG_FORMAT";

/// Subscriber output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// One JSON object per event.
    Json,
    /// Multi-line human readable output.
    Pretty,
    /// Single-line human readable output.
    Compact,
}

/// Logging settings resolved from the environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogSettings {
    /// Whether anything asked for logging at all.
    pub enabled: bool,
    /// Level directive, e.g. `"debug"`.
    pub level: &'static str,
    /// Output format.
    pub format: LogFormat,
}

impl LogSettings {
    /// Read settings from the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Read settings using `lookup` to fetch variables.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let debug = lookup(ENV_DEBUG)
            .map(|v| matches!(v.to_lowercase().as_str(), "true" | "1" | "yes"))
            .unwrap_or(false);
        let requested = lookup(ENV_LOG_LEVEL);

        let fallback = if debug { "debug" } else { "warn" };
        let level = match requested.as_deref().map(str::to_lowercase).as_deref() {
            Some("trace") => "trace",
            Some("debug") => "debug",
            Some("info") => "info",
            Some("warn") => "warn",
            Some("error") => "error",
            _ => fallback,
        };

        let format = match lookup(ENV_LOG_FORMAT).map(|f| f.to_lowercase()).as_deref() {
            Some("pretty") => LogFormat::Pretty,
            Some("compact") => LogFormat::Compact,
            _ => LogFormat::Json,
        };

        Self {
            enabled: debug || requested.is_some(),
            level,
            format,
        }
    }

    /// Filter directive covering the pipeline's targets.
    pub fn directive(&self) -> String {
        format!("prax={},prax_pipeline={}", self.level, self.level)
    }
}

/// Check whether `PRAX_DEBUG` enables debug logging.
#[inline]
pub fn is_debug_enabled() -> bool {
    env::var(ENV_DEBUG)
        .map(|v| matches!(v.to_lowercase().as_str(), "true" | "1" | "yes"))
        .unwrap_or(false)
}

/// Install a global subscriber according to the environment.
///
/// Does nothing unless `PRAX_DEBUG` or `PRAX_LOG_LEVEL` is set, or when the
/// `tracing-subscriber` feature is off. Subsequent calls are no-ops, as is a
/// call made after another subscriber was installed.
pub fn init() {
    INIT.call_once(|| {
        let settings = LogSettings::from_env();
        if !settings.enabled {
            return;
        }

        #[cfg(feature = "tracing-subscriber")]
        {
            use tracing_subscriber::{EnvFilter, fmt, prelude::*};

            let filter = EnvFilter::try_new(settings.directive())
                .unwrap_or_else(|_| EnvFilter::new("warn"));
            let registry = tracing_subscriber::registry().with(filter);

            let installed = match settings.format {
                LogFormat::Json => registry.with(fmt::layer().json()).try_init(),
                LogFormat::Compact => registry.with(fmt::layer().compact()).try_init(),
                LogFormat::Pretty => registry.with(fmt::layer().pretty()).try_init(),
            };

            if installed.is_ok() {
                tracing::info!(
                    target: "prax::pipeline",
                    level = settings.level,
                    format = ?settings.format,
                    "Prax logging initialized"
                );
            }
        }
    });
}
