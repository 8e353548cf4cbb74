//! Execution chain and builder.

use super::call::CallContext;
use super::circuit::{CircuitBreakerConfig, CircuitBreakerRetryMiddleware};
use super::context::ExecutionContext;
use super::logging::{LogLevel, LoggingMiddleware, SlowQueryMiddleware};
use super::metrics::MetricsMiddleware;
use super::retry::{RetryMiddleware, RetryPolicy};
use super::timeout::{AdaptiveTimeoutConfig, AdaptiveTimeoutMiddleware, TimeoutMiddleware};
use super::types::{
    Middleware, MiddlewareResult, Next, QueryResponse, SharedMiddleware, StatementExecutor,
};
use super::validation::ValidationMiddleware;
use crate::config::PipelineConfig;
use crate::error::QueryResult;
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use tracing::Instrument;

/// An ordered, thread-safe registry of middleware.
///
/// Middleware run in registration order: the "before" halves run first to
/// last and the "after" halves run last to first. Every call to
/// [`execute`](Self::execute) works on a snapshot of the list taken under a
/// read lock, so concurrent [`push`](Self::push)/[`remove`](Self::remove)
/// calls never disturb executions that are already in flight.
pub struct ExecutionChain {
    middlewares: RwLock<Vec<SharedMiddleware>>,
    executor: Option<Arc<dyn StatementExecutor>>,
}

impl ExecutionChain {
    /// Create an empty chain with no executor.
    pub fn new() -> Self {
        Self {
            middlewares: RwLock::new(Vec::new()),
            executor: None,
        }
    }

    /// Create a chain with initial middleware.
    pub fn with(middlewares: Vec<SharedMiddleware>) -> Self {
        Self {
            middlewares: RwLock::new(middlewares),
            executor: None,
        }
    }

    /// Start a [`ChainBuilder`].
    pub fn builder() -> ChainBuilder {
        ChainBuilder::new()
    }

    /// Set the executor run after the last middleware.
    pub fn with_executor(mut self, executor: Arc<dyn StatementExecutor>) -> Self {
        self.executor = Some(executor);
        self
    }

    /// Add middleware to the end of the chain.
    pub fn push<M: Middleware + 'static>(&self, middleware: M) -> &Self {
        self.push_shared(Arc::new(middleware))
    }

    /// Add an already shared middleware to the end of the chain.
    pub fn push_shared(&self, middleware: SharedMiddleware) -> &Self {
        self.middlewares.write().push(middleware);
        self
    }

    /// Append several middleware, preserving their order.
    pub fn extend<I>(&self, middlewares: I) -> &Self
    where
        I: IntoIterator<Item = SharedMiddleware>,
    {
        self.middlewares.write().extend(middlewares);
        self
    }

    /// Remove every middleware with the given name. Returns how many were removed.
    pub fn remove(&self, name: &str) -> usize {
        let mut middlewares = self.middlewares.write();
        let before = middlewares.len();
        middlewares.retain(|m| m.name() != name);
        before - middlewares.len()
    }

    /// Remove all middleware.
    pub fn clear(&self) {
        self.middlewares.write().clear();
    }

    /// Names of the registered middleware, in order.
    pub fn list(&self) -> Vec<String> {
        self.middlewares
            .read()
            .iter()
            .map(|m| m.name().to_string())
            .collect()
    }

    /// Check whether a middleware with the given name is registered.
    pub fn has_middleware(&self, name: &str) -> bool {
        self.middlewares.read().iter().any(|m| m.name() == name)
    }

    /// Get the number of middlewares in the chain.
    pub fn len(&self) -> usize {
        self.middlewares.read().len()
    }

    /// Check if the chain is empty.
    pub fn is_empty(&self) -> bool {
        self.middlewares.read().is_empty()
    }

    /// Run the chain using the configured executor.
    ///
    /// Without an executor the innermost step is a no-op returning an empty
    /// response.
    pub async fn execute(
        &self,
        ctx: CallContext,
        exec: ExecutionContext,
    ) -> MiddlewareResult<QueryResponse> {
        self.run(ctx, exec, self.executor.clone()).await
    }

    /// Run the chain with `executor` as the innermost step for this call only.
    pub async fn execute_with(
        &self,
        ctx: CallContext,
        exec: ExecutionContext,
        executor: Arc<dyn StatementExecutor>,
    ) -> MiddlewareResult<QueryResponse> {
        self.run(ctx, exec, Some(executor)).await
    }

    async fn run(
        &self,
        ctx: CallContext,
        exec: ExecutionContext,
        executor: Option<Arc<dyn StatementExecutor>>,
    ) -> MiddlewareResult<QueryResponse> {
        let snapshot: Arc<[SharedMiddleware]> = Arc::from(self.middlewares.read().clone());
        let span = tracing::debug_span!(
            target: "prax::pipeline",
            "execute",
            query_type = ?exec.query_type(),
            middlewares = snapshot.len(),
        );

        let result = Next::new(snapshot, executor)
            .run(ctx, exec.clone())
            .instrument(span)
            .await;

        exec.mark_finished();
        if let Err(ref error) = result {
            exec.set_last_error(Some(error.clone()));
        }
        result
    }
}

impl Default for ExecutionChain {
    fn default() -> Self {
        Self::new()
    }
}

/// Fluent builder for execution chains.
///
/// # Example
///
/// ```rust
/// use prax_pipeline::middleware::{ChainBuilder, LogLevel, RetryPolicy, LinearBackoff};
/// use std::time::Duration;
///
/// let chain = ChainBuilder::new()
///     .logging(LogLevel::Info)
///     .strict_validation()
///     .retry(RetryPolicy::new(3).with_backoff(LinearBackoff::new(Duration::from_millis(50))))
///     .timeout(Duration::from_secs(5))
///     .build();
///
/// assert_eq!(
///     chain.list(),
///     vec!["LoggingMiddleware", "ValidationMiddleware", "RetryMiddleware", "TimeoutMiddleware"],
/// );
/// ```
pub struct ChainBuilder {
    middlewares: Vec<SharedMiddleware>,
    executor: Option<Arc<dyn StatementExecutor>>,
}

impl ChainBuilder {
    /// Create a new builder.
    pub fn new() -> Self {
        Self {
            middlewares: Vec::new(),
            executor: None,
        }
    }

    /// Add middleware.
    pub fn with<M: Middleware + 'static>(mut self, middleware: M) -> Self {
        self.middlewares.push(Arc::new(middleware));
        self
    }

    /// Add a shared middleware, keeping a handle to it elsewhere.
    pub fn with_shared(mut self, middleware: SharedMiddleware) -> Self {
        self.middlewares.push(middleware);
        self
    }

    /// Add middleware conditionally.
    pub fn with_if<M: Middleware + 'static>(self, condition: bool, middleware: M) -> Self {
        if condition {
            self.with(middleware)
        } else {
            self
        }
    }

    /// Log every statement at `level`.
    pub fn logging(self, level: LogLevel) -> Self {
        self.with(LoggingMiddleware::new().with_level(level))
    }

    /// Log statements slower than `threshold`.
    pub fn slow_queries(self, threshold: Duration) -> Self {
        self.with(SlowQueryMiddleware::new(threshold))
    }

    /// Reject empty, oversized or over-parameterised statements.
    pub fn validation(self) -> Self {
        self.with(ValidationMiddleware::standard())
    }

    /// Like [`validation`](Self::validation), plus dangerous-keyword and injection checks.
    pub fn strict_validation(self) -> Self {
        self.with(ValidationMiddleware::strict())
    }

    /// Retry failed calls according to `policy`.
    pub fn retry(self, policy: RetryPolicy) -> Self {
        self.with(RetryMiddleware::new(policy))
    }

    /// Retry behind a circuit breaker.
    pub fn circuit_breaker(self, policy: RetryPolicy, config: CircuitBreakerConfig) -> Self {
        self.with(CircuitBreakerRetryMiddleware::new(policy, config))
    }

    /// Bound every call by a fixed timeout.
    pub fn timeout(self, timeout: Duration) -> Self {
        self.with(TimeoutMiddleware::new(timeout))
    }

    /// Bound every call by a percentile-derived timeout.
    pub fn adaptive_timeout(self, config: AdaptiveTimeoutConfig) -> Self {
        self.with(AdaptiveTimeoutMiddleware::new(config))
    }

    /// Set the executor run after the last middleware.
    pub fn executor(mut self, executor: Arc<dyn StatementExecutor>) -> Self {
        self.executor = Some(executor);
        self
    }

    /// Assemble a chain from configuration.
    ///
    /// Sections are applied in a fixed order: logging, slow-query logging,
    /// metrics, validation, circuit breaker (or plain retry), timeout and
    /// adaptive timeout. Timeouts sit innermost so that each attempt gets its
    /// own deadline. The metrics middleware is returned separately so its
    /// counters can be read.
    ///
    /// Fails if a validation pattern does not compile.
    pub fn from_config(config: &PipelineConfig) -> QueryResult<(Self, Option<Arc<MetricsMiddleware>>)> {
        let mut builder = Self::new();

        if let Some(ref logging) = config.logging {
            builder = builder.with(LoggingMiddleware::with_config(logging.clone()));
        }
        if let Some(ref slow) = config.slow_query {
            builder = builder.with(SlowQueryMiddleware::new(slow.threshold));
        }

        let metrics = config.metrics.then(|| Arc::new(MetricsMiddleware::new()));
        if let Some(ref metrics) = metrics {
            builder = builder.with_shared(metrics.clone());
        }

        if let Some(ref validation) = config.validation {
            builder = builder.with(validation.build()?);
        }

        match (&config.retry, &config.circuit_breaker) {
            (retry, Some(breaker)) => {
                let policy = retry.as_ref().map(|r| r.to_policy()).unwrap_or_default();
                builder = builder.circuit_breaker(policy, breaker.clone());
            }
            (Some(retry), None) => {
                builder = builder.retry(retry.to_policy());
            }
            (None, None) => {}
        }

        if let Some(ref timeout) = config.timeout {
            builder = builder.with(TimeoutMiddleware::with_config(timeout.clone()));
        }
        if let Some(ref adaptive) = config.adaptive_timeout {
            builder = builder.adaptive_timeout(adaptive.clone());
        }

        Ok((builder, metrics))
    }

    /// Build the chain.
    pub fn build(self) -> ExecutionChain {
        ExecutionChain {
            middlewares: RwLock::new(self.middlewares),
            executor: self.executor,
        }
    }
}

impl Default for ChainBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::QueryError;
    use crate::middleware::types::{executor_fn, from_fn};
    use parking_lot::Mutex;
    use pretty_assertions::assert_eq;

    fn recorder(
        name: &'static str,
        log: Arc<Mutex<Vec<String>>>,
    ) -> impl Middleware + 'static {
        from_fn(name, move |ctx, exec, next| {
            let log = log.clone();
            Box::pin(async move {
                log.lock().push(format!("{name}:before"));
                let result = next.run(ctx, exec).await;
                log.lock().push(format!("{name}:after"));
                result
            })
        })
    }

    #[test]
    fn test_chain_empty() {
        let chain = ExecutionChain::new();
        assert!(chain.is_empty());
        assert_eq!(chain.len(), 0);
        assert!(chain.list().is_empty());
    }

    #[tokio::test]
    async fn test_chain_ordering_is_nested() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let chain = ExecutionChain::new();
        chain
            .push(recorder("m1", log.clone()))
            .push(recorder("m2", log.clone()))
            .push(recorder("m3", log.clone()));

        let result = chain
            .execute(CallContext::new(), ExecutionContext::new("SELECT 1", vec![]))
            .await;
        assert!(result.is_ok());

        assert_eq!(
            *log.lock(),
            vec![
                "m1:before", "m2:before", "m3:before", "m3:after", "m2:after", "m1:after",
            ]
        );
    }

    #[tokio::test]
    async fn test_short_circuit_skips_rest() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let chain = ExecutionChain::new();
        chain
            .push(recorder("outer", log.clone()))
            .push(from_fn("gate", |_ctx, _exec, _next| {
                Box::pin(async { Err(QueryError::internal("blocked")) })
            }))
            .push(recorder("inner", log.clone()));

        let err = chain
            .execute(CallContext::new(), ExecutionContext::new("SELECT 1", vec![]))
            .await
            .unwrap_err();
        assert!(err.message.contains("blocked"));
        assert_eq!(*log.lock(), vec!["outer:before", "outer:after"]);
    }

    #[tokio::test]
    async fn test_execute_records_outcome_on_context() {
        let chain = ExecutionChain::new().with_executor(Arc::new(executor_fn(
            |_ctx, _sql, _params| async { Err(QueryError::database("boom")) },
        )));

        let exec = ExecutionContext::new("SELECT 1", vec![]);
        let result = chain.execute(CallContext::new(), exec.clone()).await;

        assert!(result.is_err());
        assert!(exec.ended_at().is_some());
        assert_eq!(exec.last_error().map(|e| e.message), Some("boom".to_string()));
    }

    #[tokio::test]
    async fn test_execute_with_overrides_executor() {
        let chain = ExecutionChain::new();
        let response = chain
            .execute_with(
                CallContext::new(),
                ExecutionContext::new("UPDATE t SET x = 1", vec![]),
                Arc::new(executor_fn(|_ctx, _sql, _params| async {
                    Ok(QueryResponse::with_affected(3))
                })),
            )
            .await
            .unwrap();
        assert_eq!(response.rows_affected, Some(3));
    }

    #[test]
    fn test_remove_list_and_has() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let chain = ExecutionChain::new();
        chain
            .push(recorder("a", log.clone()))
            .push(recorder("b", log.clone()))
            .push(recorder("a", log.clone()));

        assert_eq!(chain.list(), vec!["a", "b", "a"]);
        assert!(chain.has_middleware("b"));

        assert_eq!(chain.remove("a"), 2);
        assert_eq!(chain.list(), vec!["b"]);
        assert!(!chain.has_middleware("a"));
        assert_eq!(chain.remove("missing"), 0);

        chain.clear();
        assert!(chain.is_empty());
    }

    #[tokio::test]
    async fn test_mutation_does_not_affect_in_flight_execution() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let chain = Arc::new(ExecutionChain::new());
        let (entered_tx, entered_rx) = tokio::sync::oneshot::channel::<()>();
        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
        let entered_tx = Mutex::new(Some(entered_tx));
        let release_rx = Arc::new(tokio::sync::Mutex::new(Some(release_rx)));

        chain.push(from_fn("gate", move |ctx, exec, next| {
            if let Some(tx) = entered_tx.lock().take() {
                let _ = tx.send(());
            }
            let release_rx = release_rx.clone();
            Box::pin(async move {
                if let Some(rx) = release_rx.lock().await.take() {
                    let _ = rx.await;
                }
                next.run(ctx, exec).await
            })
        }));
        chain.push(recorder("tail", log.clone()));

        let running = {
            let chain = chain.clone();
            tokio::spawn(async move {
                chain
                    .execute(CallContext::new(), ExecutionContext::new("SELECT 1", vec![]))
                    .await
            })
        };

        entered_rx.await.unwrap();
        chain.remove("tail");
        release_tx.send(()).unwrap();

        assert!(running.await.unwrap().is_ok());
        assert_eq!(*log.lock(), vec!["tail:before", "tail:after"]);
    }

    #[test]
    fn test_builder() {
        let chain = ChainBuilder::new()
            .logging(LogLevel::Debug)
            .with_if(true, MetricsMiddleware::new())
            .with_if(false, MetricsMiddleware::new())
            .validation()
            .build();

        assert_eq!(
            chain.list(),
            vec!["LoggingMiddleware", "MetricsMiddleware", "ValidationMiddleware"]
        );
    }
}
