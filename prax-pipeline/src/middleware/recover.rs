//! Error recovery middleware.

use super::call::CallContext;
use super::context::ExecutionContext;
use super::types::{BoxFuture, Middleware, MiddlewareResult, Next, QueryResponse};
use crate::error::QueryError;

/// Middleware that hands errors from the rest of the chain to a handler.
///
/// The handler may recover by returning `Ok`, or transform the error by
/// returning a different `Err`. Successful results pass through untouched.
///
/// # Example
///
/// ```rust
/// use prax_pipeline::QueryError;
/// use prax_pipeline::middleware::{ErrorHandlerMiddleware, ExecutionContext, QueryResponse};
///
/// // Treat a missing optional table as an empty result.
/// let recover = ErrorHandlerMiddleware::new(|err: QueryError, exec: &ExecutionContext| {
///     if exec.is_read() && err.message.contains("does not exist") {
///         Ok(QueryResponse::new(serde_json::json!([])))
///     } else {
///         Err(err)
///     }
/// });
/// ```
pub struct ErrorHandlerMiddleware<F> {
    handler: F,
}

impl<F> ErrorHandlerMiddleware<F>
where
    F: Fn(QueryError, &ExecutionContext) -> MiddlewareResult<QueryResponse> + Send + Sync,
{
    /// Wrap `handler`.
    pub fn new(handler: F) -> Self {
        Self { handler }
    }
}

impl<F> Middleware for ErrorHandlerMiddleware<F>
where
    F: Fn(QueryError, &ExecutionContext) -> MiddlewareResult<QueryResponse> + Send + Sync,
{
    fn handle<'a>(
        &'a self,
        ctx: CallContext,
        exec: ExecutionContext,
        next: Next,
    ) -> BoxFuture<'a, MiddlewareResult<QueryResponse>> {
        Box::pin(async move {
            match next.run(ctx, exec.clone()).await {
                Ok(response) => Ok(response),
                Err(err) => {
                    let code = err.code;
                    let handled = (self.handler)(err, &exec);
                    if handled.is_ok() {
                        tracing::debug!(
                            target: "prax::pipeline",
                            code = %code,
                            "error recovered by handler"
                        );
                    }
                    handled
                }
            }
        })
    }

    fn name(&self) -> &str {
        "ErrorHandlerMiddleware"
    }
}
