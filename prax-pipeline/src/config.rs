//! Declarative pipeline configuration.
//!
//! A [`PipelineConfig`] describes which middleware to install, usually loaded
//! from a TOML file:
//!
//! ```toml
//! metrics = true
//!
//! [logging]
//! level = "debug"
//! log_params = false
//!
//! [validation]
//! injection = true
//! dangerous_keywords = ["DROP", "TRUNCATE"]
//!
//! [retry]
//! max_attempts = 3
//! retry_on = "transient"
//! backoff = { kind = "linear", interval_ms = 50 }
//!
//! [circuit_breaker]
//! failure_threshold = 5
//! open_timeout_ms = 30000
//!
//! [timeout]
//! timeout_ms = 5000
//! ```
//!
//! Durations are plain integers in milliseconds and `${VAR}` references are
//! replaced from the environment before parsing.

use crate::error::{QueryError, QueryResult};
use crate::middleware::{
    AdaptiveTimeoutConfig, ChainBuilder, CircuitBreakerConfig, LoggingConfig, MetricsMiddleware,
    RetryConfig, SlowQueryConfig, TimeoutConfig, ValidationConfig,
};
use regex_lite::Regex;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// Environment variable overriding the fixed timeout.
pub const ENV_QUERY_TIMEOUT_MS: &str = "PRAX_QUERY_TIMEOUT_MS";
/// Environment variable overriding the retry attempt count.
pub const ENV_RETRY_MAX_ATTEMPTS: &str = "PRAX_RETRY_MAX_ATTEMPTS";
/// Environment variable overriding the slow-query threshold.
pub const ENV_SLOW_QUERY_MS: &str = "PRAX_SLOW_QUERY_MS";
/// Environment variable overriding the breaker failure threshold.
pub const ENV_CIRCUIT_FAILURE_THRESHOLD: &str = "PRAX_CIRCUIT_FAILURE_THRESHOLD";

/// Which middleware to install and how to configure them.
///
/// Every section is optional; an absent section installs nothing.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PipelineConfig {
    /// Statement logging.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub logging: Option<LoggingConfig>,

    /// Slow-statement logging.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub slow_query: Option<SlowQueryConfig>,

    /// Install a metrics middleware.
    pub metrics: bool,

    /// Pre-execution validation.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub validation: Option<ValidationConfig>,

    /// Retry policy. Wrapped in the circuit breaker when one is configured.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryConfig>,

    /// Circuit breaker.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub circuit_breaker: Option<CircuitBreakerConfig>,

    /// Fixed timeout.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout: Option<TimeoutConfig>,

    /// Adaptive timeout.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub adaptive_timeout: Option<AdaptiveTimeoutConfig>,
}

impl PipelineConfig {
    /// Load configuration from a file path.
    pub fn from_file(path: impl AsRef<Path>) -> QueryResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            QueryError::configuration(format!("cannot read {}", path.display())).with_source(e)
        })?;

        Self::from_toml_str(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml_str(content: &str) -> QueryResult<Self> {
        let expanded = expand_env_vars(content, |name| std::env::var(name).ok());
        toml::from_str(&expanded).map_err(|e| {
            QueryError::configuration(format!("invalid TOML: {}", e.message())).with_source(e)
        })
    }

    /// Apply `PRAX_*` overrides from the process environment.
    pub fn apply_env(&mut self) -> QueryResult<()> {
        self.apply_env_with(|name| std::env::var(name).ok())
    }

    /// Apply `PRAX_*` overrides using `lookup` to read variables.
    pub fn apply_env_with<F>(&mut self, lookup: F) -> QueryResult<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(ms) = parse_var::<u64, _>(&lookup, ENV_QUERY_TIMEOUT_MS)? {
            self.timeout = Some(TimeoutConfig {
                timeout: Duration::from_millis(ms),
            });
        }
        if let Some(attempts) = parse_var::<u32, _>(&lookup, ENV_RETRY_MAX_ATTEMPTS)? {
            self.retry.get_or_insert_with(RetryConfig::default).max_attempts = attempts;
        }
        if let Some(ms) = parse_var::<u64, _>(&lookup, ENV_SLOW_QUERY_MS)? {
            self.slow_query = Some(SlowQueryConfig {
                threshold: Duration::from_millis(ms),
            });
        }
        if let Some(threshold) = parse_var::<u32, _>(&lookup, ENV_CIRCUIT_FAILURE_THRESHOLD)? {
            self.circuit_breaker
                .get_or_insert_with(CircuitBreakerConfig::default)
                .failure_threshold = threshold;
        }
        Ok(())
    }

    /// Assemble a chain builder. See [`ChainBuilder::from_config`].
    pub fn builder(&self) -> QueryResult<(ChainBuilder, Option<Arc<MetricsMiddleware>>)> {
        ChainBuilder::from_config(self)
    }
}

fn parse_var<T, F>(lookup: &F, name: &str) -> QueryResult<Option<T>>
where
    T: std::str::FromStr,
    F: Fn(&str) -> Option<String>,
{
    let Some(raw) = lookup(name) else {
        return Ok(None);
    };
    raw.trim().parse().map(Some).map_err(|_| {
        QueryError::configuration(format!("{} must be a non-negative integer, got `{}`", name, raw))
    })
}

/// Expand environment variables in the format `${VAR_NAME}`.
///
/// Unknown variables are left as written.
fn expand_env_vars<F>(content: &str, lookup: F) -> String
where
    F: Fn(&str) -> Option<String>,
{
    let Ok(re) = Regex::new(r"\$\{([^}]+)\}") else {
        return content.to_string();
    };
    re.replace_all(content, |caps: &regex_lite::Captures<'_>| {
        lookup(&caps[1]).unwrap_or_else(|| caps[0].to_string())
    })
    .into_owned()
}

/// Serde helpers for `Duration` fields written as integer milliseconds.
pub mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    /// Serialize as milliseconds.
    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    /// Deserialize from milliseconds.
    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

/// Serde helpers for `Option<Duration>` fields written as integer milliseconds.
pub mod option_duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    /// Serialize as optional milliseconds.
    pub fn serialize<S: Serializer>(
        value: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => serializer.serialize_some(&(d.as_millis() as u64)),
            None => serializer.serialize_none(),
        }
    }

    /// Deserialize from optional milliseconds.
    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        Option::<u64>::deserialize(deserializer).map(|ms| ms.map(Duration::from_millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use crate::middleware::{CircuitState, HalfOpenPolicy, LogLevel, RetryPredicate};
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;
    use std::io::Write;

    const FULL: &str = r#"
        metrics = true

        [logging]
        level = "warn"
        log_params = false
        max_sql_length = 120

        [slow_query]
        threshold_ms = 250

        [validation]
        injection = true
        dangerous_keywords = ["DROP"]

        [retry]
        max_attempts = 4
        retry_on = "except_validation"
        backoff = { kind = "exponential", initial_delay_ms = 20, max_delay_ms = 500 }

        [circuit_breaker]
        failure_threshold = 3
        open_timeout_ms = 1500
        half_open_policy = "accumulate_failures"

        [timeout]
        timeout_ms = 2000
    "#;

    fn vars(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn test_default_config_is_empty() {
        let config = PipelineConfig::default();
        assert!(config.logging.is_none());
        assert!(!config.metrics);
        assert!(config.retry.is_none());
    }

    #[test]
    fn test_parse_full_config() {
        let config = PipelineConfig::from_toml_str(FULL).unwrap();

        let logging = config.logging.as_ref().unwrap();
        assert_eq!(logging.level, LogLevel::Warn);
        assert!(!logging.log_params);
        assert_eq!(logging.max_sql_length, 120);
        assert_eq!(logging.prefix, "prax");

        assert_eq!(
            config.slow_query.as_ref().map(|s| s.threshold),
            Some(Duration::from_millis(250))
        );
        assert!(config.metrics);

        let retry = config.retry.as_ref().unwrap();
        assert_eq!(retry.max_attempts, 4);
        assert_eq!(retry.retry_on, RetryPredicate::ExceptValidation);
        assert_eq!(retry.to_policy().backoff_for(2), Duration::from_millis(40));

        let breaker = config.circuit_breaker.as_ref().unwrap();
        assert_eq!(breaker.failure_threshold, 3);
        assert_eq!(breaker.success_threshold, 2);
        assert_eq!(breaker.open_timeout, Duration::from_millis(1500));
        assert_eq!(breaker.half_open_policy, HalfOpenPolicy::AccumulateFailures);

        assert_eq!(
            config.timeout.as_ref().map(|t| t.timeout),
            Some(Duration::from_secs(2))
        );
    }

    #[test]
    fn test_builder_from_config() {
        let config = PipelineConfig::from_toml_str(FULL).unwrap();
        let (builder, metrics) = config.builder().unwrap();
        let chain = builder.build();

        assert!(metrics.is_some());
        assert_eq!(
            chain.list(),
            vec![
                "LoggingMiddleware",
                "SlowQueryMiddleware",
                "MetricsMiddleware",
                "ValidationMiddleware",
                "CircuitBreakerRetryMiddleware",
                "TimeoutMiddleware",
            ]
        );
    }

    #[test]
    fn test_unknown_section_is_rejected() {
        let err = PipelineConfig::from_toml_str("[cache]\nttl_ms = 10").unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidConfiguration);
    }

    #[test]
    fn test_env_overrides() {
        let mut config = PipelineConfig::default();
        config
            .apply_env_with(vars(&[
                (ENV_QUERY_TIMEOUT_MS, "750"),
                (ENV_RETRY_MAX_ATTEMPTS, "5"),
                (ENV_SLOW_QUERY_MS, " 100 "),
                (ENV_CIRCUIT_FAILURE_THRESHOLD, "9"),
            ]))
            .unwrap();

        assert_eq!(
            config.timeout.map(|t| t.timeout),
            Some(Duration::from_millis(750))
        );
        assert_eq!(config.retry.map(|r| r.max_attempts), Some(5));
        assert_eq!(
            config.slow_query.map(|s| s.threshold),
            Some(Duration::from_millis(100))
        );
        assert_eq!(config.circuit_breaker.map(|c| c.failure_threshold), Some(9));
    }

    #[test]
    fn test_env_override_keeps_other_fields() {
        let mut config = PipelineConfig::from_toml_str(FULL).unwrap();
        config
            .apply_env_with(vars(&[(ENV_CIRCUIT_FAILURE_THRESHOLD, "10")]))
            .unwrap();

        let breaker = config.circuit_breaker.unwrap();
        assert_eq!(breaker.failure_threshold, 10);
        assert_eq!(breaker.open_timeout, Duration::from_millis(1500));
    }

    #[test]
    fn test_bad_env_value() {
        let mut config = PipelineConfig::default();
        let err = config
            .apply_env_with(vars(&[(ENV_RETRY_MAX_ATTEMPTS, "lots")]))
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidConfiguration);
        assert!(err.message.contains(ENV_RETRY_MAX_ATTEMPTS));
    }

    #[test]
    fn test_env_var_expansion() {
        let expanded = expand_env_vars(
            "timeout_ms = ${TIMEOUT}\nlevel = \"${MISSING}\"",
            vars(&[("TIMEOUT", "900")]),
        );
        assert_eq!(expanded, "timeout_ms = 900\nlevel = \"${MISSING}\"");
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "metrics = true\n[timeout]\ntimeout_ms = 100").unwrap();

        let config = PipelineConfig::from_file(file.path()).unwrap();
        assert!(config.metrics);
        assert_eq!(
            config.timeout.map(|t| t.timeout),
            Some(Duration::from_millis(100))
        );

        let missing = PipelineConfig::from_file("/nonexistent/prax-pipeline.toml").unwrap_err();
        assert_eq!(missing.code, ErrorCode::InvalidConfiguration);
    }

    #[test]
    fn test_circuit_state_serializes_snake_case() {
        let json = serde_json::to_string(&CircuitState::HalfOpen).unwrap();
        assert_eq!(json, "\"half_open\"");
    }
}
