//! Metrics middleware for statement performance tracking.
//!
//! Counters are per middleware instance and count once per invocation. Put a
//! metrics middleware outside a retry middleware to count logical calls, or
//! inside it to count individual attempts.

use super::call::CallContext;
use super::context::ExecutionContext;
use super::types::{BoxFuture, Middleware, MiddlewareResult, Next, QueryResponse};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;

/// Snapshot of collected metrics.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryMetrics {
    /// Total number of statements seen.
    pub total_queries: u64,
    /// Number of failed statements.
    pub total_errors: u64,
    /// Number of successful statements.
    pub success_count: u64,
    /// Sum of all durations.
    pub total_time: Duration,
    /// Fastest statement.
    pub min_time: Duration,
    /// Slowest statement.
    pub max_time: Duration,
    /// `total_time / total_queries`.
    pub avg_time: Duration,
    /// `total_queries / total_time` in seconds.
    pub qps: f64,
}

impl QueryMetrics {
    /// Calculate success rate (0.0 to 1.0).
    pub fn success_rate(&self) -> f64 {
        if self.total_queries == 0 {
            1.0
        } else {
            self.success_count as f64 / self.total_queries as f64
        }
    }

    /// Calculate error rate (0.0 to 1.0).
    pub fn error_rate(&self) -> f64 {
        1.0 - self.success_rate()
    }
}

#[derive(Debug, Default)]
struct Extremes {
    min: Option<Duration>,
    max: Duration,
}

/// Middleware that counts statements, errors and durations.
///
/// # Example
///
/// ```rust
/// use prax_pipeline::middleware::{ChainBuilder, MetricsMiddleware};
/// use std::sync::Arc;
///
/// let metrics = Arc::new(MetricsMiddleware::new());
/// let chain = ChainBuilder::new().with_shared(metrics.clone()).build();
///
/// // ... execute statements through `chain` ...
///
/// let stats = metrics.metrics();
/// println!("total: {}, avg: {:?}", stats.total_queries, stats.avg_time);
/// ```
#[derive(Debug, Default)]
pub struct MetricsMiddleware {
    total_queries: AtomicU64,
    total_errors: AtomicU64,
    total_time_ns: AtomicU64,
    extremes: Mutex<Extremes>,
}

impl MetricsMiddleware {
    /// Create a middleware with zeroed counters.
    pub fn new() -> Self {
        Self::default()
    }

    fn record(&self, duration: Duration, success: bool) {
        self.total_queries.fetch_add(1, Ordering::SeqCst);
        if !success {
            self.total_errors.fetch_add(1, Ordering::SeqCst);
        }
        self.total_time_ns
            .fetch_add(duration.as_nanos() as u64, Ordering::SeqCst);

        let mut extremes = self.extremes.lock();
        extremes.min = Some(extremes.min.map_or(duration, |m| m.min(duration)));
        extremes.max = extremes.max.max(duration);
    }

    /// Snapshot the counters.
    pub fn metrics(&self) -> QueryMetrics {
        let extremes = self.extremes.lock();
        let total = self.total_queries.load(Ordering::SeqCst);
        let errors = self.total_errors.load(Ordering::SeqCst);
        let total_time = Duration::from_nanos(self.total_time_ns.load(Ordering::SeqCst));

        let avg_time = if total > 0 {
            Duration::from_nanos(total_time.as_nanos() as u64 / total)
        } else {
            Duration::ZERO
        };
        let qps = if total_time.is_zero() {
            0.0
        } else {
            total as f64 / total_time.as_secs_f64()
        };

        QueryMetrics {
            total_queries: total,
            total_errors: errors,
            success_count: total.saturating_sub(errors),
            total_time,
            min_time: extremes.min.unwrap_or_default(),
            max_time: extremes.max,
            avg_time,
            qps,
        }
    }

    /// Zero every counter.
    pub fn reset(&self) {
        let mut extremes = self.extremes.lock();
        self.total_queries.store(0, Ordering::SeqCst);
        self.total_errors.store(0, Ordering::SeqCst);
        self.total_time_ns.store(0, Ordering::SeqCst);
        *extremes = Extremes::default();
    }
}

impl Middleware for MetricsMiddleware {
    fn handle<'a>(
        &'a self,
        ctx: CallContext,
        exec: ExecutionContext,
        next: Next,
    ) -> BoxFuture<'a, MiddlewareResult<QueryResponse>> {
        Box::pin(async move {
            let start = Instant::now();
            let result = next.run(ctx, exec).await;
            self.record(start.elapsed(), result.is_ok());
            result
        })
    }

    fn name(&self) -> &str {
        "MetricsMiddleware"
    }
}

/// Coarse statement classification by leading verb.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatementVerb {
    /// SELECT
    Select,
    /// INSERT
    Insert,
    /// UPDATE
    Update,
    /// DELETE
    Delete,
    /// Anything else.
    Other,
}

impl StatementVerb {
    /// Classify by the first six letters of the first alphabetic word.
    ///
    /// Matching is case-sensitive: only upper-case verbs are recognised.
    pub fn classify(sql: &str) -> Self {
        let word: String = sql
            .chars()
            .skip_while(|c| !c.is_alphabetic())
            .take_while(|c| c.is_alphabetic())
            .take(6)
            .collect();

        match word.as_str() {
            "SELECT" => Self::Select,
            "INSERT" => Self::Insert,
            "UPDATE" => Self::Update,
            "DELETE" => Self::Delete,
            _ => Self::Other,
        }
    }

    fn index(self) -> usize {
        match self {
            Self::Select => 0,
            Self::Insert => 1,
            Self::Update => 2,
            Self::Delete => 3,
            Self::Other => 4,
        }
    }
}

/// Snapshot of per-verb statement counts.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryStatistics {
    /// Total statements.
    pub total: u64,
    /// Failed statements.
    pub errors: u64,
    /// SELECT statements.
    pub selects: u64,
    /// INSERT statements.
    pub inserts: u64,
    /// UPDATE statements.
    pub updates: u64,
    /// DELETE statements.
    pub deletes: u64,
    /// Unclassified statements.
    pub others: u64,
    /// Sum of all durations.
    pub total_time: Duration,
    /// Mean duration.
    pub avg_time: Duration,
}

impl QueryStatistics {
    /// Share of `verb` in the total (0.0 when empty).
    pub fn ratio(&self, verb: StatementVerb) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        let count = match verb {
            StatementVerb::Select => self.selects,
            StatementVerb::Insert => self.inserts,
            StatementVerb::Update => self.updates,
            StatementVerb::Delete => self.deletes,
            StatementVerb::Other => self.others,
        };
        count as f64 / self.total as f64
    }

    /// Share of writes (INSERT, UPDATE, DELETE) in the total.
    pub fn write_ratio(&self) -> f64 {
        self.ratio(StatementVerb::Insert)
            + self.ratio(StatementVerb::Update)
            + self.ratio(StatementVerb::Delete)
    }
}

/// Middleware that tracks the read/write mix of statements.
#[derive(Debug, Default)]
pub struct QueryTypeMetricsMiddleware {
    by_verb: [AtomicU64; 5],
    errors: AtomicU64,
    total_time_ns: AtomicU64,
}

impl QueryTypeMetricsMiddleware {
    /// Create a middleware with zeroed counters.
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot the counters.
    pub fn statistics(&self) -> QueryStatistics {
        let count = |verb: StatementVerb| self.by_verb[verb.index()].load(Ordering::SeqCst);
        let selects = count(StatementVerb::Select);
        let inserts = count(StatementVerb::Insert);
        let updates = count(StatementVerb::Update);
        let deletes = count(StatementVerb::Delete);
        let others = count(StatementVerb::Other);
        let total = selects + inserts + updates + deletes + others;
        let total_time = Duration::from_nanos(self.total_time_ns.load(Ordering::SeqCst));

        QueryStatistics {
            total,
            errors: self.errors.load(Ordering::SeqCst),
            selects,
            inserts,
            updates,
            deletes,
            others,
            total_time,
            avg_time: if total > 0 {
                Duration::from_nanos(total_time.as_nanos() as u64 / total)
            } else {
                Duration::ZERO
            },
        }
    }

    /// Zero every counter.
    pub fn reset(&self) {
        for counter in &self.by_verb {
            counter.store(0, Ordering::SeqCst);
        }
        self.errors.store(0, Ordering::SeqCst);
        self.total_time_ns.store(0, Ordering::SeqCst);
    }
}

impl Middleware for QueryTypeMetricsMiddleware {
    fn handle<'a>(
        &'a self,
        ctx: CallContext,
        exec: ExecutionContext,
        next: Next,
    ) -> BoxFuture<'a, MiddlewareResult<QueryResponse>> {
        Box::pin(async move {
            let verb = StatementVerb::classify(exec.sql());
            let start = Instant::now();

            let result = next.run(ctx, exec).await;

            self.by_verb[verb.index()].fetch_add(1, Ordering::SeqCst);
            self.total_time_ns
                .fetch_add(start.elapsed().as_nanos() as u64, Ordering::SeqCst);
            if result.is_err() {
                self.errors.fetch_add(1, Ordering::SeqCst);
            }
            result
        })
    }

    fn name(&self) -> &str {
        "QueryTypeMetricsMiddleware"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::QueryError;
    use crate::middleware::types::executor_fn;
    use std::sync::Arc;

    fn failing() -> Next {
        Next::terminal(Some(Arc::new(executor_fn(|_ctx, _sql, _params| async {
            Err(QueryError::deadlock())
        }))))
    }

    #[test]
    fn test_initial_metrics() {
        let metrics = MetricsMiddleware::new().metrics();
        assert_eq!(metrics, QueryMetrics::default());
        assert_eq!(metrics.success_rate(), 1.0);
    }

    #[test]
    fn test_metrics_accuracy() {
        let middleware = MetricsMiddleware::new();
        middleware.record(Duration::from_millis(10), true);
        middleware.record(Duration::from_millis(20), false);
        middleware.record(Duration::from_millis(30), true);

        let metrics = middleware.metrics();
        assert_eq!(metrics.total_queries, 3);
        assert_eq!(metrics.total_errors, 1);
        assert_eq!(metrics.success_count, 2);
        assert_eq!(metrics.total_time, Duration::from_millis(60));
        assert_eq!(metrics.min_time, Duration::from_millis(10));
        assert_eq!(metrics.max_time, Duration::from_millis(30));
        assert_eq!(metrics.avg_time, Duration::from_millis(20));
        assert!((metrics.qps - 50.0).abs() < 1e-9);
        assert!((metrics.error_rate() - 1.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_reset() {
        let middleware = MetricsMiddleware::new();
        middleware.record(Duration::from_millis(5), false);
        middleware.reset();
        assert_eq!(middleware.metrics(), QueryMetrics::default());
    }

    #[tokio::test]
    async fn test_handle_counts_outcomes() {
        let middleware = MetricsMiddleware::new();

        middleware
            .handle(
                CallContext::new(),
                ExecutionContext::new("SELECT 1", vec![]),
                Next::terminal(None),
            )
            .await
            .unwrap();
        let err = middleware
            .handle(
                CallContext::new(),
                ExecutionContext::new("SELECT 1", vec![]),
                failing(),
            )
            .await
            .unwrap_err();

        assert_eq!(err.code, crate::ErrorCode::Deadlock);
        let metrics = middleware.metrics();
        assert_eq!(metrics.total_queries, 2);
        assert_eq!(metrics.total_errors, 1);
    }

    #[test]
    fn test_statement_verb_classification() {
        assert_eq!(StatementVerb::classify("SELECT * FROM t"), StatementVerb::Select);
        assert_eq!(StatementVerb::classify("  (SELECT 1)"), StatementVerb::Select);
        assert_eq!(StatementVerb::classify("INSERT INTO t VALUES (1)"), StatementVerb::Insert);
        assert_eq!(StatementVerb::classify("UPDATE t SET x = 1"), StatementVerb::Update);
        assert_eq!(StatementVerb::classify("DELETE FROM t"), StatementVerb::Delete);
        assert_eq!(StatementVerb::classify("select 1"), StatementVerb::Other);
        assert_eq!(StatementVerb::classify("WITH x AS (SELECT 1) SELECT * FROM x"), StatementVerb::Other);
        assert_eq!(StatementVerb::classify(""), StatementVerb::Other);
    }

    #[tokio::test]
    async fn test_query_type_statistics() {
        let middleware = QueryTypeMetricsMiddleware::new();
        for sql in ["SELECT 1", "SELECT 2", "SELECT 3", "INSERT INTO t VALUES (1)"] {
            middleware
                .handle(
                    CallContext::new(),
                    ExecutionContext::new(sql, vec![]),
                    Next::terminal(None),
                )
                .await
                .unwrap();
        }
        middleware
            .handle(
                CallContext::new(),
                ExecutionContext::new("DELETE FROM t", vec![]),
                failing(),
            )
            .await
            .unwrap_err();

        let stats = middleware.statistics();
        assert_eq!(stats.total, 5);
        assert_eq!(stats.selects, 3);
        assert_eq!(stats.inserts, 1);
        assert_eq!(stats.deletes, 1);
        assert_eq!(stats.errors, 1);
        assert!((stats.ratio(StatementVerb::Select) - 0.6).abs() < 1e-9);
        assert!((stats.write_ratio() - 0.4).abs() < 1e-9);

        middleware.reset();
        assert_eq!(middleware.statistics(), QueryStatistics::default());
    }
}
