//! Logging middleware for statement tracing.

use super::call::CallContext;
use super::context::{ExecutionContext, QueryType};
use super::types::{BoxFuture, Middleware, MiddlewareResult, Next, QueryResponse};
use crate::error::{QueryError, truncate};
use crate::value::Value;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;

/// Severity used when writing a log entry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Debug level.
    Debug,
    /// Info level.
    #[default]
    Info,
    /// Warn level.
    Warn,
    /// Error level.
    Error,
}

/// One record handed to a [`QueryLogger`].
#[derive(Debug)]
pub struct QueryLogEntry<'a> {
    /// Human-readable message.
    pub message: &'a str,
    /// Sequence number assigned by the middleware.
    pub query_id: u64,
    /// Detected statement type.
    pub query_type: QueryType,
    /// Statement text, possibly truncated.
    pub sql: &'a str,
    /// Parameters, when enabled and non-empty.
    pub params: Option<&'a [Value]>,
    /// Wall-clock time spent in the rest of the chain.
    pub duration: Duration,
    /// The error returned by the rest of the chain.
    pub error: Option<&'a QueryError>,
    /// Slow-query threshold that was crossed.
    pub threshold: Option<Duration>,
}

/// Sink for statement log entries.
pub trait QueryLogger: Send + Sync {
    /// Write an entry at the given level.
    fn log(&self, level: LogLevel, entry: &QueryLogEntry<'_>);
}

macro_rules! emit {
    ($level:expr, $($rest:tt)+) => {
        match $level {
            LogLevel::Debug => tracing::debug!($($rest)+),
            LogLevel::Info => tracing::info!($($rest)+),
            LogLevel::Warn => tracing::warn!($($rest)+),
            LogLevel::Error => tracing::error!($($rest)+),
        }
    };
}

/// Logger that emits `tracing` events on the `prax::query` target.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingLogger;

impl QueryLogger for TracingLogger {
    fn log(&self, level: LogLevel, entry: &QueryLogEntry<'_>) {
        emit!(
            level,
            target: "prax::query",
            query_id = entry.query_id,
            query_type = ?entry.query_type,
            sql = %entry.sql,
            params = entry.params.map(tracing::field::debug),
            duration_us = entry.duration.as_micros() as u64,
            threshold_ms = entry.threshold.map(|t| t.as_millis() as u64),
            error = entry.error.map(tracing::field::display),
            "{}",
            entry.message
        );
    }
}

/// Configuration for the logging middleware.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Level every entry is written at.
    pub level: LogLevel,
    /// Whether to log statement parameters.
    pub log_params: bool,
    /// Maximum length of logged SQL (0 = unlimited).
    pub max_sql_length: usize,
    /// Prefix for log messages.
    pub prefix: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            log_params: true,
            max_sql_length: 500,
            prefix: "prax".to_string(),
        }
    }
}

/// Middleware that logs every statement after it completes.
///
/// Logging never changes the result returned by the rest of the chain.
///
/// # Example
///
/// ```rust
/// use prax_pipeline::middleware::{LoggingMiddleware, LogLevel};
///
/// let logging = LoggingMiddleware::new()
///     .with_level(LogLevel::Debug)
///     .with_params(false);
/// ```
pub struct LoggingMiddleware {
    config: LoggingConfig,
    logger: Arc<dyn QueryLogger>,
    query_count: AtomicU64,
}

impl LoggingMiddleware {
    /// Create a new logging middleware with default settings.
    pub fn new() -> Self {
        Self::with_config(LoggingConfig::default())
    }

    /// Create with custom configuration.
    pub fn with_config(config: LoggingConfig) -> Self {
        Self {
            config,
            logger: Arc::new(TracingLogger),
            query_count: AtomicU64::new(0),
        }
    }

    /// Set the log level.
    pub fn with_level(mut self, level: LogLevel) -> Self {
        self.config.level = level;
        self
    }

    /// Enable or disable parameter logging.
    pub fn with_params(mut self, enabled: bool) -> Self {
        self.config.log_params = enabled;
        self
    }

    /// Set the log prefix.
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.config.prefix = prefix.into();
        self
    }

    /// Write entries to a custom logger.
    pub fn with_logger(mut self, logger: Arc<dyn QueryLogger>) -> Self {
        self.logger = logger;
        self
    }

    /// Get the total query count.
    pub fn query_count(&self) -> u64 {
        self.query_count.load(Ordering::Relaxed)
    }

    fn log_after(
        &self,
        exec: &ExecutionContext,
        query_id: u64,
        duration: Duration,
        error: Option<&QueryError>,
    ) {
        let sql = truncate(exec.sql(), self.config.max_sql_length);
        let params = (self.config.log_params && !exec.params().is_empty()).then(|| exec.params());
        let message = match error {
            None => format!("[{}] Query completed", self.config.prefix),
            Some(_) => format!("[{}] Query failed", self.config.prefix),
        };

        self.logger.log(
            self.config.level,
            &QueryLogEntry {
                message: &message,
                query_id,
                query_type: exec.query_type(),
                sql: &sql,
                params,
                duration,
                error,
                threshold: None,
            },
        );
    }
}

impl Default for LoggingMiddleware {
    fn default() -> Self {
        Self::new()
    }
}

impl Middleware for LoggingMiddleware {
    fn handle<'a>(
        &'a self,
        ctx: CallContext,
        exec: ExecutionContext,
        next: Next,
    ) -> BoxFuture<'a, MiddlewareResult<QueryResponse>> {
        Box::pin(async move {
            let query_id = self.query_count.fetch_add(1, Ordering::SeqCst);
            let start = Instant::now();

            let result = next.run(ctx, exec.clone()).await;

            self.log_after(&exec, query_id, start.elapsed(), result.as_ref().err());
            result
        })
    }

    fn name(&self) -> &str {
        "LoggingMiddleware"
    }
}

/// Configuration for the slow-query middleware.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlowQueryConfig {
    /// Statements slower than this are logged.
    #[serde(rename = "threshold_ms", with = "crate::config::duration_ms")]
    pub threshold: Duration,
}

impl Default for SlowQueryConfig {
    fn default() -> Self {
        Self {
            threshold: Duration::from_secs(1),
        }
    }
}

/// Middleware that only logs statements slower than a threshold.
pub struct SlowQueryMiddleware {
    threshold: Duration,
    logger: Arc<dyn QueryLogger>,
    slow_count: AtomicU64,
}

impl SlowQueryMiddleware {
    /// Create a slow-query logger with the given threshold.
    pub fn new(threshold: Duration) -> Self {
        Self {
            threshold,
            logger: Arc::new(TracingLogger),
            slow_count: AtomicU64::new(0),
        }
    }

    /// Write entries to a custom logger.
    pub fn with_logger(mut self, logger: Arc<dyn QueryLogger>) -> Self {
        self.logger = logger;
        self
    }

    /// The configured threshold.
    pub fn threshold(&self) -> Duration {
        self.threshold
    }

    /// Number of slow statements seen so far.
    pub fn slow_count(&self) -> u64 {
        self.slow_count.load(Ordering::Relaxed)
    }
}

impl Middleware for SlowQueryMiddleware {
    fn handle<'a>(
        &'a self,
        ctx: CallContext,
        exec: ExecutionContext,
        next: Next,
    ) -> BoxFuture<'a, MiddlewareResult<QueryResponse>> {
        Box::pin(async move {
            let start = Instant::now();
            let result = next.run(ctx, exec.clone()).await;
            let duration = start.elapsed();

            if duration > self.threshold {
                let query_id = self.slow_count.fetch_add(1, Ordering::SeqCst);
                let message = format!(
                    "Slow query detected: took {}ms (threshold {}ms)",
                    duration.as_millis(),
                    self.threshold.as_millis()
                );
                self.logger.log(
                    LogLevel::Warn,
                    &QueryLogEntry {
                        message: &message,
                        query_id,
                        query_type: exec.query_type(),
                        sql: exec.sql(),
                        params: None,
                        duration,
                        error: result.as_ref().err(),
                        threshold: Some(self.threshold),
                    },
                );
            }

            result
        })
    }

    fn name(&self) -> &str {
        "SlowQueryMiddleware"
    }
}
