//! Middleware system for statement execution.
//!
//! An [`ExecutionChain`] wraps every database call in an ordered list of
//! interceptors. Each one sees the call before and after the rest of the
//! chain runs and may:
//!
//! - **Observe** - log statements, collect metrics and timings
//! - **Reject** - validate statements before they reach the database
//! - **Repeat** - retry failed calls with backoff, behind a circuit breaker
//! - **Bound** - enforce fixed or adaptive timeouts
//! - **Recover** - turn errors into results
//!
//! # Example
//!
//! ```rust
//! use prax_pipeline::middleware::{
//!     executor_fn, CallContext, ChainBuilder, ExecutionContext, LogLevel, QueryResponse,
//!     RetryPolicy,
//! };
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # tokio_test();
//! # fn tokio_test() {
//! # let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
//! # rt.block_on(async {
//! let chain = ChainBuilder::new()
//!     .logging(LogLevel::Debug)
//!     .validation()
//!     .retry(RetryPolicy::new(3))
//!     .timeout(Duration::from_secs(5))
//!     .executor(Arc::new(executor_fn(|_ctx, _sql, _params| async {
//!         Ok(QueryResponse::with_affected(1))
//!     })))
//!     .build();
//!
//! let exec = ExecutionContext::new("UPDATE users SET active = true", vec![]);
//! let response = chain.execute(CallContext::new(), exec).await.unwrap();
//! assert_eq!(response.rows_affected, Some(1));
//! # });
//! # }
//! ```

mod call;
mod chain;
mod circuit;
mod context;
mod logging;
mod metrics;
mod recover;
mod retry;
mod timeout;
mod timing;
mod types;
mod validation;

pub use call::CallContext;
pub use chain::{ChainBuilder, ExecutionChain};
pub use circuit::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerRetryMiddleware, CircuitBreakerSnapshot,
    CircuitState, HalfOpenPolicy,
};
pub use context::{ExecutionContext, QueryMetadata, QueryType};
pub use logging::{
    LogLevel, LoggingConfig, LoggingMiddleware, QueryLogEntry, QueryLogger, SlowQueryConfig,
    SlowQueryMiddleware, TracingLogger,
};
pub use metrics::{
    MetricsMiddleware, QueryMetrics, QueryStatistics, QueryTypeMetricsMiddleware, StatementVerb,
};
pub use recover::ErrorHandlerMiddleware;
pub use retry::{
    BackoffConfig, BackoffStrategy, ConstantBackoff, DefaultBackoff, ExponentialBackoff,
    LinearBackoff, RetryConfig, RetryMiddleware, RetryPolicy, RetryPredicate, RetryableChecker,
};
pub use timeout::{
    AdaptiveTimeoutConfig, AdaptiveTimeoutMiddleware, AdaptiveTimeoutStats, TimeoutConfig,
    TimeoutMiddleware,
};
pub use timing::TimingMiddleware;
pub use types::{
    BoxFuture, FnExecutor, FnMiddleware, Middleware, MiddlewareResult, Next, QueryResponse,
    SharedMiddleware, StatementExecutor, executor_fn, from_fn,
};
pub use validation::{
    CompositeValidator, CustomValidator, DangerousKeywordValidator, InjectionValidator,
    LengthValidator, NonEmptyStatementValidator, ParameterValidator, PatternMode,
    PatternValidator, ValidationConfig, ValidationError, ValidationMiddleware, Validator,
};
