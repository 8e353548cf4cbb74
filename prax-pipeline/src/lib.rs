//! # prax-pipeline
//!
//! Resilient statement execution for the Prax ORM.
//!
//! Every call to the database passes through an ordered chain of middleware
//! before reaching a [`StatementExecutor`](middleware::StatementExecutor):
//! - Structured logging and slow-statement detection
//! - Metrics and per-verb statistics
//! - Validation (empty statements, dangerous keywords, injection heuristics)
//! - Retry with pluggable backoff, optionally behind a circuit breaker
//! - Fixed and adaptive timeouts with cooperative cancellation
//! - Error recovery
//!
//! ## Building a chain
//!
//! ```rust
//! use prax_pipeline::middleware::{
//!     executor_fn, CallContext, ChainBuilder, ExecutionContext, LinearBackoff, QueryResponse,
//!     RetryPolicy,
//! };
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
//! # rt.block_on(async {
//! let policy = RetryPolicy::new(3)
//!     .with_backoff(LinearBackoff::new(Duration::from_millis(10)));
//!
//! let chain = ChainBuilder::new()
//!     .validation()
//!     .retry(policy)
//!     .executor(Arc::new(executor_fn(|_ctx, _sql, _params| async {
//!         Ok(QueryResponse::new(serde_json::json!([{ "id": 1 }])))
//!     })))
//!     .build();
//!
//! let exec = ExecutionContext::new("SELECT * FROM users WHERE id = $1", vec![1i64.into()]);
//! let response = chain.execute(CallContext::new(), exec).await.unwrap();
//! assert_eq!(response.data[0]["id"], 1);
//! # });
//! ```
//!
//! ## From configuration
//!
//! ```rust
//! use prax_pipeline::PipelineConfig;
//!
//! let config = PipelineConfig::from_toml_str(
//!     r#"
//!     metrics = true
//!
//!     [retry]
//!     max_attempts = 5
//!
//!     [timeout]
//!     timeout_ms = 2000
//!     "#,
//! )
//! .unwrap();
//!
//! let (builder, metrics) = config.builder().unwrap();
//! let chain = builder.build();
//! assert_eq!(chain.len(), 3);
//! assert!(metrics.is_some());
//! ```

pub mod config;
pub mod error;
pub mod logging;
pub mod middleware;
pub mod value;

pub use config::PipelineConfig;
pub use error::{ErrorCode, ErrorContext, QueryError, QueryResult};
pub use value::Value;

/// Convenience re-exports.
pub mod prelude {
    pub use crate::config::PipelineConfig;
    pub use crate::error::{QueryError, QueryResult};
    pub use crate::middleware::{
        CallContext, ChainBuilder, ExecutionChain, ExecutionContext, Middleware, Next,
        QueryResponse, RetryPolicy, StatementExecutor,
    };
    pub use crate::value::Value;
}
