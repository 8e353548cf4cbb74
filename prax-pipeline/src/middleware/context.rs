//! Execution context passed through the middleware chain.

use super::circuit::CircuitState;
use crate::error::QueryError;
use crate::value::Value;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Coarse classification of a statement by its leading keyword.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueryType {
    /// `SELECT`, or a `WITH` common table expression.
    Select,
    /// `INSERT`.
    Insert,
    /// `UPDATE`.
    Update,
    /// `DELETE`.
    Delete,
    /// `BEGIN` or `START TRANSACTION`.
    TransactionBegin,
    /// `COMMIT`.
    TransactionCommit,
    /// `ROLLBACK`.
    TransactionRollback,
    /// Anything else (DDL, `VACUUM`, vendor commands).
    Unknown,
}

const LEADING_KEYWORDS: &[(&str, QueryType)] = &[
    ("SELECT", QueryType::Select),
    ("WITH", QueryType::Select),
    ("INSERT", QueryType::Insert),
    ("UPDATE", QueryType::Update),
    ("DELETE", QueryType::Delete),
    ("BEGIN", QueryType::TransactionBegin),
    ("START TRANSACTION", QueryType::TransactionBegin),
    ("COMMIT", QueryType::TransactionCommit),
    ("ROLLBACK", QueryType::TransactionRollback),
];

impl QueryType {
    /// Classify `sql` by its first keyword, ignoring case and leading whitespace.
    pub fn from_sql(sql: &str) -> Self {
        let head = sql.trim_start();
        LEADING_KEYWORDS
            .iter()
            .find(|(keyword, _)| {
                head.get(..keyword.len())
                    .is_some_and(|prefix| prefix.eq_ignore_ascii_case(keyword))
            })
            .map_or(Self::Unknown, |&(_, kind)| kind)
    }

    /// `true` for statements that only read.
    pub fn is_read(&self) -> bool {
        *self == Self::Select
    }

    /// `true` for `INSERT`, `UPDATE` and `DELETE`.
    pub fn is_write(&self) -> bool {
        matches!(self, Self::Insert | Self::Update | Self::Delete)
    }
}

/// Typed annotations collected while a statement travels the chain.
///
/// The first four fields are supplied by the caller; the rest are filled in
/// by middleware as the call proceeds.
#[derive(Debug, Clone, Default)]
pub struct QueryMetadata {
    /// Model or table the statement targets.
    pub model: Option<String>,
    /// Caller-level operation, e.g. `"findMany"`.
    pub operation: Option<String>,
    /// Correlation id propagated into logs.
    pub request_id: Option<String>,
    /// Tenant on whose behalf the statement runs.
    pub tenant_id: Option<String>,
    /// Set once the validation middleware accepted the statement.
    pub validated: bool,
    /// The timeout a timeout middleware enforced on this call.
    pub effective_timeout: Option<Duration>,
    /// Breaker state observed when the call was admitted.
    pub circuit_state: Option<CircuitState>,
    /// Number of attempts a retry middleware made.
    pub attempts: u32,
    /// Free-form string tags.
    pub tags: BTreeMap<String, String>,
}

impl QueryMetadata {
    /// Empty metadata.
    pub fn new() -> Self {
        Self::default()
    }

    /// Name the target model.
    pub fn with_model(self, model: impl Into<String>) -> Self {
        Self {
            model: Some(model.into()),
            ..self
        }
    }

    /// Name the caller-level operation.
    pub fn with_operation(self, operation: impl Into<String>) -> Self {
        Self {
            operation: Some(operation.into()),
            ..self
        }
    }

    /// Attach a correlation id.
    pub fn with_request_id(self, request_id: impl Into<String>) -> Self {
        Self {
            request_id: Some(request_id.into()),
            ..self
        }
    }

    /// Attach a tenant.
    pub fn with_tenant_id(self, tenant_id: impl Into<String>) -> Self {
        Self {
            tenant_id: Some(tenant_id.into()),
            ..self
        }
    }

    /// Insert or replace a tag.
    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }
}

#[derive(Debug)]
struct ExecutionState {
    started_at: Instant,
    ended_at: Option<Instant>,
    last_error: Option<QueryError>,
    metadata: QueryMetadata,
    is_retry_attempt: bool,
    retry_attempt: u32,
}

#[derive(Debug)]
struct ContextInner {
    sql: String,
    params: Vec<Value>,
    query_type: QueryType,
    state: Mutex<ExecutionState>,
}

/// Context for one logical execution.
///
/// The statement and its parameters are fixed at construction; middleware may
/// only annotate timings, retry bookkeeping, the last error and metadata.
/// Clones share the same state, so annotations made by an inner middleware
/// (or a spawned timeout task) are visible to outer ones.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    inner: Arc<ContextInner>,
}

impl ExecutionContext {
    /// Create a new execution context.
    pub fn new(sql: impl Into<String>, params: Vec<Value>) -> Self {
        let sql = sql.into();
        let query_type = QueryType::from_sql(&sql);
        Self {
            inner: Arc::new(ContextInner {
                sql,
                params,
                query_type,
                state: Mutex::new(ExecutionState {
                    started_at: Instant::now(),
                    ended_at: None,
                    last_error: None,
                    metadata: QueryMetadata::new(),
                    is_retry_attempt: false,
                    retry_attempt: 0,
                }),
            }),
        }
    }

    /// Attach metadata (builder pattern).
    pub fn with_metadata(self, metadata: QueryMetadata) -> Self {
        self.inner.state.lock().metadata = metadata;
        self
    }

    /// The statement text.
    pub fn sql(&self) -> &str {
        &self.inner.sql
    }

    /// Get the statement parameters.
    pub fn params(&self) -> &[Value] {
        &self.inner.params
    }

    /// Classification of the statement.
    pub fn query_type(&self) -> QueryType {
        self.inner.query_type
    }

    /// When the context was created.
    pub fn started_at(&self) -> Instant {
        self.inner.state.lock().started_at
    }

    /// When the chain finished, if it has.
    pub fn ended_at(&self) -> Option<Instant> {
        self.inner.state.lock().ended_at
    }

    /// Record the end of execution.
    pub fn mark_finished(&self) {
        self.inner.state.lock().ended_at = Some(Instant::now());
    }

    /// Time from start to end, or to now if still running.
    pub fn elapsed(&self) -> Duration {
        let state = self.inner.state.lock();
        match state.ended_at {
            Some(end) => end.duration_since(state.started_at),
            None => state.started_at.elapsed(),
        }
    }

    /// The most recent error seen for this execution.
    pub fn last_error(&self) -> Option<QueryError> {
        self.inner.state.lock().last_error.clone()
    }

    /// Record an error.
    pub fn set_last_error(&self, error: Option<QueryError>) {
        self.inner.state.lock().last_error = error;
    }

    /// Whether the current attempt is a retry.
    pub fn is_retry_attempt(&self) -> bool {
        self.inner.state.lock().is_retry_attempt
    }

    /// Zero-based attempt number of the current attempt.
    pub fn retry_attempt(&self) -> u32 {
        self.inner.state.lock().retry_attempt
    }

    /// Record the attempt about to run.
    pub fn set_retry_attempt(&self, attempt: u32) {
        let mut state = self.inner.state.lock();
        state.retry_attempt = attempt;
        state.is_retry_attempt = attempt > 0;
    }

    /// Snapshot of the metadata.
    pub fn metadata(&self) -> QueryMetadata {
        self.inner.state.lock().metadata.clone()
    }

    /// Modify the metadata in place.
    pub fn update_metadata<R>(&self, f: impl FnOnce(&mut QueryMetadata) -> R) -> R {
        f(&mut self.inner.state.lock().metadata)
    }

    /// Shorthand for `query_type().is_read()`.
    pub fn is_read(&self) -> bool {
        self.inner.query_type.is_read()
    }

    /// Shorthand for `query_type().is_write()`.
    pub fn is_write(&self) -> bool {
        self.inner.query_type.is_write()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_type_detection() {
        assert_eq!(QueryType::from_sql("SELECT * FROM users"), QueryType::Select);
        assert_eq!(QueryType::from_sql("  with t as (select 1) select * from t"), QueryType::Select);
        assert_eq!(QueryType::from_sql("INSERT INTO users VALUES (1)"), QueryType::Insert);
        assert_eq!(QueryType::from_sql("update users set name = 'x'"), QueryType::Update);
        assert_eq!(QueryType::from_sql("DELETE FROM users WHERE id = 1"), QueryType::Delete);
        assert_eq!(QueryType::from_sql("BEGIN"), QueryType::TransactionBegin);
        assert_eq!(QueryType::from_sql("COMMIT"), QueryType::TransactionCommit);
        assert_eq!(QueryType::from_sql("ROLLBACK"), QueryType::TransactionRollback);
        assert_eq!(QueryType::from_sql("start transaction"), QueryType::TransactionBegin);
        assert_eq!(QueryType::from_sql("VACUUM"), QueryType::Unknown);
        assert_eq!(QueryType::from_sql("é"), QueryType::Unknown);
    }

    #[test]
    fn test_execution_context() {
        let ctx = ExecutionContext::new("SELECT * FROM users WHERE id = $1", vec![Value::Int(1)]);
        assert_eq!(ctx.sql(), "SELECT * FROM users WHERE id = $1");
        assert_eq!(ctx.params(), &[Value::Int(1)]);
        assert!(ctx.is_read());
        assert!(!ctx.is_write());
        assert!(ctx.ended_at().is_none());
        assert!(ctx.last_error().is_none());
    }

    #[test]
    fn test_clones_share_state() {
        let ctx = ExecutionContext::new("SELECT 1", vec![]);
        let other = ctx.clone();

        other.set_retry_attempt(2);
        other.update_metadata(|m| m.validated = true);
        other.set_last_error(Some(QueryError::deadlock()));

        assert_eq!(ctx.retry_attempt(), 2);
        assert!(ctx.is_retry_attempt());
        assert!(ctx.metadata().validated);
        assert!(ctx.last_error().is_some());
    }

    #[test]
    fn test_mark_finished_freezes_elapsed() {
        let ctx = ExecutionContext::new("SELECT 1", vec![]);
        ctx.mark_finished();
        let first = ctx.elapsed();
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(ctx.elapsed(), first);
    }

    #[test]
    fn test_metadata_builders() {
        let metadata = QueryMetadata::new()
            .with_model("Invoice")
            .with_operation("settle")
            .with_request_id("r-42")
            .with_tag("region", "eu-west");

        let ctx = ExecutionContext::new("SELECT 1", vec![]).with_metadata(metadata);
        let metadata = ctx.metadata();
        assert_eq!(metadata.model.as_deref(), Some("Invoice"));
        assert_eq!(metadata.operation.as_deref(), Some("settle"));
        assert_eq!(metadata.tags.get("region").map(String::as_str), Some("eu-west"));
        assert_eq!(metadata.attempts, 0);
    }
}
