//! Core middleware types and traits.

use crate::error::QueryError;
use crate::value::Value;
use async_trait::async_trait;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use super::call::CallContext;
use super::context::ExecutionContext;

/// Result type for middleware operations.
pub type MiddlewareResult<T> = Result<T, QueryError>;

/// A boxed future for async middleware operations.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// A middleware that can be shared across threads.
pub type SharedMiddleware = Arc<dyn Middleware>;

/// The rest of the chain, as seen from one middleware.
///
/// `Next` owns a snapshot of the chain and an index into it, so it can be
/// run more than once (retries) and moved into spawned tasks (timeouts).
#[derive(Clone)]
pub struct Next {
    middlewares: Arc<[SharedMiddleware]>,
    index: usize,
    executor: Option<Arc<dyn StatementExecutor>>,
}

impl Next {
    pub(crate) fn new(
        middlewares: Arc<[SharedMiddleware]>,
        executor: Option<Arc<dyn StatementExecutor>>,
    ) -> Self {
        Self {
            middlewares,
            index: 0,
            executor,
        }
    }

    /// A continuation with no middleware that calls `executor` directly.
    ///
    /// Useful for driving a single middleware in isolation.
    pub fn terminal(executor: Option<Arc<dyn StatementExecutor>>) -> Self {
        Self::new(Arc::from(Vec::new()), executor)
    }

    /// Execute the remainder of the chain.
    pub fn run(
        &self,
        ctx: CallContext,
        exec: ExecutionContext,
    ) -> BoxFuture<'static, MiddlewareResult<QueryResponse>> {
        let next = self.clone();
        Box::pin(async move { next.dispatch(ctx, exec).await })
    }

    async fn dispatch(
        self,
        ctx: CallContext,
        exec: ExecutionContext,
    ) -> MiddlewareResult<QueryResponse> {
        let mut index = self.index;
        while let Some(middleware) = self.middlewares.get(index) {
            if middleware.enabled() {
                let next = Next {
                    middlewares: Arc::clone(&self.middlewares),
                    index: index + 1,
                    executor: self.executor.clone(),
                };
                return middleware.handle(ctx, exec, next).await;
            }
            index += 1;
        }

        match &self.executor {
            Some(executor) => executor.execute(&ctx, exec.sql(), exec.params()).await,
            None => Ok(QueryResponse::empty()),
        }
    }
}

/// Response from a statement execution.
#[derive(Debug, Clone)]
pub struct QueryResponse {
    /// The raw response data (typically JSON rows).
    pub data: serde_json::Value,
    /// Number of rows affected (for mutations).
    pub rows_affected: Option<u64>,
    /// Execution time in microseconds.
    pub execution_time_us: u64,
}

impl QueryResponse {
    /// Create a new query response with data.
    pub fn new(data: serde_json::Value) -> Self {
        Self {
            data,
            rows_affected: None,
            execution_time_us: 0,
        }
    }

    /// Create an empty response.
    pub fn empty() -> Self {
        Self::new(serde_json::Value::Null)
    }

    /// Create a response with affected rows count.
    pub fn with_affected(count: u64) -> Self {
        Self {
            rows_affected: Some(count),
            ..Self::empty()
        }
    }

    /// Set execution time.
    pub fn with_execution_time(mut self, us: u64) -> Self {
        self.execution_time_us = us;
        self
    }
}

/// Middleware trait for intercepting statement execution.
///
/// Implement this trait to create custom middleware that can:
/// - Act before and after the rest of the chain
/// - Short-circuit execution by returning without calling `next`
/// - Call `next` several times (retries)
/// - Recover or transform errors
///
/// # Example
///
/// ```rust
/// use prax_pipeline::middleware::{
///     BoxFuture, CallContext, ExecutionContext, Middleware, MiddlewareResult, Next, QueryResponse,
/// };
///
/// struct Audit;
///
/// impl Middleware for Audit {
///     fn handle<'a>(
///         &'a self,
///         ctx: CallContext,
///         exec: ExecutionContext,
///         next: Next,
///     ) -> BoxFuture<'a, MiddlewareResult<QueryResponse>> {
///         Box::pin(async move {
///             tracing::info!(sql = exec.sql(), "executing");
///             next.run(ctx, exec).await
///         })
///     }
///
///     fn name(&self) -> &str {
///         "Audit"
///     }
/// }
/// ```
pub trait Middleware: Send + Sync {
    /// Handle a statement, optionally calling the next handler.
    fn handle<'a>(
        &'a self,
        ctx: CallContext,
        exec: ExecutionContext,
        next: Next,
    ) -> BoxFuture<'a, MiddlewareResult<QueryResponse>>;

    /// Name of this middleware, used for lookup and removal.
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }

    /// Whether this middleware is enabled.
    fn enabled(&self) -> bool {
        true
    }
}

/// The innermost handler: whatever actually runs the statement.
#[async_trait]
pub trait StatementExecutor: Send + Sync {
    /// Run the statement and return rows or an affected count.
    async fn execute(
        &self,
        ctx: &CallContext,
        sql: &str,
        params: &[Value],
    ) -> MiddlewareResult<QueryResponse>;
}

/// A [`StatementExecutor`] backed by a closure. See [`executor_fn`].
pub struct FnExecutor<F> {
    f: F,
}

/// Wrap a closure as a [`StatementExecutor`].
pub fn executor_fn<F, Fut>(f: F) -> FnExecutor<F>
where
    F: Fn(CallContext, String, Vec<Value>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = MiddlewareResult<QueryResponse>> + Send + 'static,
{
    FnExecutor { f }
}

#[async_trait]
impl<F, Fut> StatementExecutor for FnExecutor<F>
where
    F: Fn(CallContext, String, Vec<Value>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = MiddlewareResult<QueryResponse>> + Send + 'static,
{
    async fn execute(
        &self,
        ctx: &CallContext,
        sql: &str,
        params: &[Value],
    ) -> MiddlewareResult<QueryResponse> {
        (self.f)(ctx.clone(), sql.to_string(), params.to_vec()).await
    }
}

/// A middleware backed by a closure. See [`from_fn`].
pub struct FnMiddleware<F> {
    name: String,
    handler: F,
}

/// Build a named middleware from a closure.
///
/// ```rust
/// use prax_pipeline::middleware::from_fn;
///
/// let tagger = from_fn("tagger", |ctx, exec, next| {
///     Box::pin(async move {
///         exec.update_metadata(|m| {
///             m.tags.insert("source".into(), "api".into());
///         });
///         next.run(ctx, exec).await
///     })
/// });
/// ```
pub fn from_fn<F>(name: impl Into<String>, handler: F) -> FnMiddleware<F>
where
    F: Fn(CallContext, ExecutionContext, Next) -> BoxFuture<'static, MiddlewareResult<QueryResponse>>
        + Send
        + Sync,
{
    FnMiddleware {
        name: name.into(),
        handler,
    }
}

impl<F> Middleware for FnMiddleware<F>
where
    F: Fn(CallContext, ExecutionContext, Next) -> BoxFuture<'static, MiddlewareResult<QueryResponse>>
        + Send
        + Sync,
{
    fn handle<'a>(
        &'a self,
        ctx: CallContext,
        exec: ExecutionContext,
        next: Next,
    ) -> BoxFuture<'a, MiddlewareResult<QueryResponse>> {
        (self.handler)(ctx, exec, next)
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_response_builder() {
        let response = QueryResponse::new(serde_json::json!({"id": 1})).with_execution_time(1000);
        assert_eq!(response.execution_time_us, 1000);
        assert!(response.rows_affected.is_none());
    }

    #[test]
    fn test_query_response_affected() {
        let response = QueryResponse::with_affected(5);
        assert_eq!(response.rows_affected, Some(5));
        assert!(response.data.is_null());
    }

    #[tokio::test]
    async fn test_terminal_without_executor_is_noop() {
        let next = Next::terminal(None);
        let response = next
            .run(CallContext::new(), ExecutionContext::new("SELECT 1", vec![]))
            .await
            .unwrap();
        assert!(response.data.is_null());
    }

    #[tokio::test]
    async fn test_executor_fn_receives_statement() {
        let executor = executor_fn(|_ctx, sql, params| async move {
            Ok(QueryResponse::new(serde_json::json!({
                "sql": sql,
                "params": params.len(),
            })))
        });
        let next = Next::terminal(Some(Arc::new(executor)));
        let response = next
            .run(
                CallContext::new(),
                ExecutionContext::new("SELECT $1", vec![Value::Int(1)]),
            )
            .await
            .unwrap();
        assert_eq!(response.data["sql"], "SELECT $1");
        assert_eq!(response.data["params"], 1);
    }

    #[tokio::test]
    async fn test_disabled_middleware_is_skipped() {
        struct Disabled;
        impl Middleware for Disabled {
            fn handle<'a>(
                &'a self,
                _ctx: CallContext,
                _exec: ExecutionContext,
                _next: Next,
            ) -> BoxFuture<'a, MiddlewareResult<QueryResponse>> {
                Box::pin(async { Err(QueryError::internal("should not run")) })
            }

            fn enabled(&self) -> bool {
                false
            }
        }

        let chain: Arc<[SharedMiddleware]> = Arc::from(vec![Arc::new(Disabled) as SharedMiddleware]);
        let next = Next::new(chain, None);
        let result = next
            .run(CallContext::new(), ExecutionContext::new("SELECT 1", vec![]))
            .await;
        assert!(result.is_ok());
    }
}
