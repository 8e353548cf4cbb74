//! The pipeline's error type.
//!
//! Whatever goes wrong between the first middleware and the executor ends up
//! as a [`QueryError`]. It pairs a stable [`ErrorCode`] with a message and an
//! [`ErrorContext`] naming the middleware, the statement and any hints.
//!
//! # Error Codes
//!
//! Codes print as `P` plus four digits, grouped by the leading digit:
//! - 1xxx: the statement was rejected before it ran
//! - 3xxx: the driver could not get a usable connection
//! - 4xxx: the database aborted the transaction
//! - 5xxx: execution failed, timed out, was cancelled or was refused by a breaker
//! - 7xxx: the pipeline was misconfigured
//! - 9xxx: a bug in the pipeline itself
//!
//! ```rust
//! use prax_pipeline::{QueryError, ErrorCode};
//! use std::time::Duration;
//!
//! let err = QueryError::timeout(Duration::from_millis(250));
//! assert_eq!(err.code, ErrorCode::QueryTimeout);
//! assert!(err.is_timeout());
//! assert!(err.to_string().contains("250ms"));
//! ```

use std::fmt;
use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::middleware::ValidationError;

/// Shorthand for results whose error is a [`QueryError`].
pub type QueryResult<T> = Result<T, QueryError>;

/// Stable identifiers for every kind of pipeline failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    /// A validator rejected the statement (P1001).
    ValidationFailed = 1001,

    /// The driver could not connect (P3001).
    ConnectionFailed = 3001,
    /// No pooled connection was available (P3002).
    PoolExhausted = 3002,
    /// Establishing a connection took too long (P3003).
    ConnectionTimeout = 3003,

    /// The database broke a deadlock by aborting us (P4002).
    Deadlock = 4002,
    /// A serializable transaction conflicted (P4003).
    SerializationFailure = 4003,

    /// A timeout middleware gave up waiting (P5001).
    QueryTimeout = 5001,
    /// Any other failure reported by the executor (P5005).
    DatabaseError = 5005,
    /// The caller cancelled the call (P5006).
    Cancelled = 5006,
    /// The caller's own deadline passed (P5007).
    DeadlineExceeded = 5007,
    /// The circuit breaker refused the call (P5008).
    CircuitOpen = 5008,

    /// A config file, env override or builder argument was invalid (P7001).
    InvalidConfiguration = 7001,

    /// An invariant inside the pipeline was broken (P9001).
    Internal = 9001,
}

impl ErrorCode {
    /// The printable form, such as `"P5001"`.
    pub fn code(&self) -> String {
        format!("P{:04}", *self as u16)
    }

    /// One-line summary of the category.
    pub fn description(&self) -> &'static str {
        match self {
            Self::ValidationFailed => "statement rejected by validation",
            Self::ConnectionFailed => "could not connect to the database",
            Self::PoolExhausted => "no pooled connection available",
            Self::ConnectionTimeout => "connection attempt timed out",
            Self::Deadlock => "transaction aborted by deadlock detection",
            Self::SerializationFailure => "serializable transaction conflict",
            Self::QueryTimeout => "statement timed out",
            Self::DatabaseError => "database reported an error",
            Self::Cancelled => "call cancelled",
            Self::DeadlineExceeded => "caller deadline exceeded",
            Self::CircuitOpen => "circuit breaker open",
            Self::InvalidConfiguration => "invalid pipeline configuration",
            Self::Internal => "internal pipeline error",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.code())
    }
}

/// Where an error happened and what might fix it.
#[derive(Debug, Clone, Default)]
pub struct ErrorContext {
    /// Name of the middleware that raised the error.
    pub middleware: Option<String>,
    /// Caller-supplied description of the operation.
    pub operation: Option<String>,
    /// The statement that failed.
    pub sql: Option<String>,
    /// Things to try, most likely first.
    pub suggestions: Vec<String>,
    /// Longer free-form guidance.
    pub help: Option<String>,
}

/// A failure raised anywhere in the execution chain.
///
/// Clones share the underlying source, so errors can be stored on the
/// execution context and returned at the same time.
#[derive(Error, Debug, Clone)]
pub struct QueryError {
    /// Category of the failure.
    pub code: ErrorCode,
    /// Human-readable explanation.
    pub message: String,
    /// Location and hints.
    pub context: ErrorContext,
    /// Lower-level cause, when there is one.
    #[source]
    pub source: Option<Arc<dyn std::error::Error + Send + Sync>>,
}

impl fmt::Display for QueryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

impl QueryError {
    /// Build an error from a code and message.
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            context: ErrorContext::default(),
            source: None,
        }
    }

    /// Record which middleware produced this error.
    pub fn with_middleware(mut self, name: impl Into<String>) -> Self {
        self.context.middleware = Some(name.into());
        self
    }

    /// Describe the operation in progress.
    pub fn with_context(mut self, operation: impl Into<String>) -> Self {
        self.context.operation = Some(operation.into());
        self
    }

    /// Append a remediation hint.
    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.context.suggestions.push(suggestion.into());
        self
    }

    /// Attach longer guidance.
    pub fn with_help(mut self, help: impl Into<String>) -> Self {
        self.context.help = Some(help.into());
        self
    }

    /// Attach the failing statement.
    pub fn with_sql(mut self, sql: impl Into<String>) -> Self {
        self.context.sql = Some(sql.into());
        self
    }

    /// Attach the underlying cause.
    pub fn with_source<E: std::error::Error + Send + Sync + 'static>(mut self, source: E) -> Self {
        self.source = Some(Arc::new(source));
        self
    }

    /// A validator rejected the statement. The message reads `validation failed: <cause>`.
    pub fn validation(cause: ValidationError) -> Self {
        Self::new(
            ErrorCode::ValidationFailed,
            format!("validation failed: {}", cause),
        )
        .with_help("Validation errors are never worth retrying; fix the statement instead")
        .with_source(cause)
    }

    /// The driver could not reach the database.
    pub fn connection(message: impl Into<String>) -> Self {
        Self::new(
            ErrorCode::ConnectionFailed,
            format!("Connection error: {}", message.into()),
        )
        .with_suggestion("Make sure the database accepts connections from this host")
    }

    /// The database aborted the transaction to break a deadlock.
    pub fn deadlock() -> Self {
        Self::new(ErrorCode::Deadlock, "transaction aborted to resolve a deadlock")
            .with_suggestion("Run the transaction again; lock tables in the same order everywhere")
    }

    /// The executor reported a failure. The message is kept as given.
    pub fn database(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::DatabaseError, message)
    }

    /// A timeout middleware gave up after `timeout`.
    pub fn timeout(timeout: Duration) -> Self {
        Self::new(
            ErrorCode::QueryTimeout,
            format!("query timed out after {}ms", timeout.as_millis()),
        )
        .with_suggestion("Raise `timeout_ms`, or switch to the adaptive timeout for variable workloads")
    }

    /// The caller cancelled the call.
    pub fn cancelled() -> Self {
        Self::new(ErrorCode::Cancelled, "call was cancelled by the caller")
    }

    /// The caller's deadline passed.
    pub fn deadline_exceeded() -> Self {
        Self::new(ErrorCode::DeadlineExceeded, "caller deadline exceeded")
    }

    /// The circuit breaker refused the call.
    pub fn circuit_open() -> Self {
        Self::new(ErrorCode::CircuitOpen, "circuit breaker is open")
            .with_help("The breaker will allow a trial call once its open timeout has elapsed")
    }

    /// Configuration could not be loaded or applied.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::new(
            ErrorCode::InvalidConfiguration,
            format!("Invalid pipeline configuration: {}", message.into()),
        )
    }

    /// An internal invariant was violated.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(
            ErrorCode::Internal,
            format!("Internal error: {}", message.into()),
        )
    }

    /// Whether a validator rejected the statement.
    pub fn is_validation(&self) -> bool {
        self.code == ErrorCode::ValidationFailed
    }

    /// Whether a timeout fired (pipeline or connection).
    pub fn is_timeout(&self) -> bool {
        matches!(self.code, ErrorCode::QueryTimeout | ErrorCode::ConnectionTimeout)
    }

    /// Whether the caller cancelled the call or its deadline passed.
    pub fn is_cancellation(&self) -> bool {
        matches!(self.code, ErrorCode::Cancelled | ErrorCode::DeadlineExceeded)
    }

    /// Whether the circuit breaker refused the call.
    pub fn is_circuit_open(&self) -> bool {
        self.code == ErrorCode::CircuitOpen
    }

    /// Whether the same call may succeed if tried again.
    pub fn is_transient(&self) -> bool {
        use ErrorCode::*;
        matches!(
            self.code,
            ConnectionFailed
                | ConnectionTimeout
                | PoolExhausted
                | QueryTimeout
                | Deadlock
                | SerializationFailure
        )
    }

    /// Multi-line report with context, suggestions and help.
    pub fn display_full(&self) -> String {
        let mut out = format!("error[{}]: {}\n", self.code, self.message);

        let located = [
            ("middleware", self.context.middleware.as_deref()),
            ("operation", self.context.operation.as_deref()),
        ];
        for (label, value) in located {
            if let Some(value) = value {
                let _ = writeln!(out, "  {label}: {value}");
            }
        }
        if let Some(sql) = self.context.sql.as_deref() {
            let _ = writeln!(out, "  sql: {}", truncate(sql, 200));
        }

        if !self.context.suggestions.is_empty() {
            out.push_str("\nTry:\n");
            for suggestion in &self.context.suggestions {
                let _ = writeln!(out, "  - {suggestion}");
            }
        }
        if let Some(help) = self.context.help.as_deref() {
            let _ = writeln!(out, "\nHelp: {help}");
        }

        out
    }
}

/// Truncate to at most `max` bytes without splitting a character.
pub(crate) fn truncate(s: &str, max: usize) -> String {
    if max == 0 || s.len() <= max {
        return s.to_string();
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &s[..end])
}

/// Build a [`QueryError`], chaining builder calls given as `method = value`.
#[macro_export]
macro_rules! query_error {
    ($code:expr, $msg:expr) => {
        $crate::error::QueryError::new($code, $msg)
    };
    ($code:expr, $msg:expr, $($key:ident = $value:expr),+ $(,)?) => {{
        let mut err = $crate::error::QueryError::new($code, $msg);
        $(
            err = err.$key($value);
        )+
        err
    }};
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_format() {
        assert_eq!(ErrorCode::ValidationFailed.code(), "P1001");
        assert_eq!(ErrorCode::QueryTimeout.code(), "P5001");
        assert_eq!(ErrorCode::CircuitOpen.to_string(), "P5008");
    }

    #[test]
    fn test_validation_error_message() {
        let err = QueryError::validation(ValidationError::EmptyStatement);
        assert!(err.is_validation());
        assert_eq!(err.message, "validation failed: statement is empty");
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn test_timeout_is_not_cancellation() {
        let err = QueryError::timeout(Duration::from_secs(2));
        assert!(err.is_timeout());
        assert!(!err.is_cancellation());
        assert!(err.message.contains("2000ms"));

        assert!(QueryError::cancelled().is_cancellation());
        assert!(QueryError::deadline_exceeded().is_cancellation());
        assert!(!QueryError::deadline_exceeded().is_timeout());
    }

    #[test]
    fn test_transient_errors() {
        assert!(QueryError::connection("refused").is_transient());
        assert!(QueryError::deadlock().is_transient());
        assert!(!QueryError::circuit_open().is_transient());
        assert!(!QueryError::validation(ValidationError::EmptyStatement).is_transient());
    }

    #[test]
    fn test_clone_shares_source() {
        let err = QueryError::validation(ValidationError::EmptyStatement);
        let copy = err.clone();
        assert_eq!(copy.code, err.code);
        assert!(copy.source.is_some());
    }

    #[test]
    fn test_display_full() {
        let err = QueryError::circuit_open()
            .with_middleware("CircuitBreakerRetryMiddleware")
            .with_sql("SELECT 1");

        let output = err.display_full();
        assert!(output.contains("P5008"));
        assert!(output.contains("CircuitBreakerRetryMiddleware"));
        assert!(output.contains("SELECT 1"));
        assert!(output.contains("Help"));
    }

    #[test]
    fn test_truncate_respects_char_boundaries() {
        assert_eq!(truncate("SELECT 1", 0), "SELECT 1");
        assert_eq!(truncate("héllo", 2), "h...");
        assert_eq!(truncate("abcdef", 3), "abc...");
    }

    #[test]
    fn test_error_macro() {
        let err = query_error!(
            ErrorCode::DatabaseError,
            "relation does not exist",
            with_sql = "SELECT * FROM missing",
            with_suggestion = "Run migrations first"
        );

        assert_eq!(err.code, ErrorCode::DatabaseError);
        assert_eq!(err.context.sql.as_deref(), Some("SELECT * FROM missing"));
        assert_eq!(err.context.suggestions.len(), 1);
    }
}
