//! Timing middleware for measuring statement execution time.

use super::call::CallContext;
use super::context::ExecutionContext;
use super::types::{BoxFuture, Middleware, MiddlewareResult, Next, QueryResponse};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;

/// Middleware that measures how long the rest of the chain takes.
///
/// This is a lightweight alternative to [`MetricsMiddleware`]: it keeps a
/// running total and count, and stamps `execution_time_us` on successful
/// responses.
///
/// [`MetricsMiddleware`]: super::MetricsMiddleware
#[derive(Debug, Default)]
pub struct TimingMiddleware {
    total_time_ns: AtomicU64,
    query_count: AtomicU64,
}

impl TimingMiddleware {
    /// Create a new timing middleware.
    pub fn new() -> Self {
        Self::default()
    }

    /// Total time spent in the rest of the chain.
    pub fn total_time(&self) -> Duration {
        Duration::from_nanos(self.total_time_ns.load(Ordering::Relaxed))
    }

    /// Number of statements timed.
    pub fn query_count(&self) -> u64 {
        self.query_count.load(Ordering::Relaxed)
    }

    /// Mean time per statement.
    pub fn avg_time(&self) -> Duration {
        match self.query_count() {
            0 => Duration::ZERO,
            count => Duration::from_nanos(self.total_time_ns.load(Ordering::Relaxed) / count),
        }
    }

    /// Reset timing statistics.
    pub fn reset(&self) {
        self.total_time_ns.store(0, Ordering::SeqCst);
        self.query_count.store(0, Ordering::SeqCst);
    }
}

impl Middleware for TimingMiddleware {
    fn handle<'a>(
        &'a self,
        ctx: CallContext,
        exec: ExecutionContext,
        next: Next,
    ) -> BoxFuture<'a, MiddlewareResult<QueryResponse>> {
        Box::pin(async move {
            let start = Instant::now();

            let result = next.run(ctx, exec).await;

            let elapsed = start.elapsed();
            self.total_time_ns
                .fetch_add(elapsed.as_nanos() as u64, Ordering::Relaxed);
            self.query_count.fetch_add(1, Ordering::Relaxed);

            result.map(|response| response.with_execution_time(elapsed.as_micros() as u64))
        })
    }

    fn name(&self) -> &str {
        "TimingMiddleware"
    }
}
