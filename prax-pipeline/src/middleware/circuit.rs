//! Circuit breaker gating a retry loop.
//!
//! The breaker is a three-state machine:
//!
//! - **Closed**: calls pass through. Each failure bumps the failure count and
//!   each success clears it. Reaching `failure_threshold` opens the circuit.
//! - **Open**: calls are rejected with [`ErrorCode::CircuitOpen`] without
//!   running the rest of the chain. Once `open_timeout` has passed since the
//!   last failure, the next call moves the breaker to half-open.
//! - **Half-open**: calls run normally. `success_threshold` consecutive
//!   successes close the circuit; a failure is handled per [`HalfOpenPolicy`].
//!
//! [`ErrorCode::CircuitOpen`]: crate::ErrorCode::CircuitOpen

use super::call::CallContext;
use super::context::ExecutionContext;
use super::retry::RetryPolicy;
use super::types::{BoxFuture, Middleware, MiddlewareResult, Next, QueryResponse};
use crate::error::QueryError;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// State of a circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Calls pass through.
    Closed,
    /// Calls are rejected.
    Open,
    /// Trial calls are allowed.
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// What a failure does while the breaker is half-open.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HalfOpenPolicy {
    /// Any failure reopens the circuit.
    #[default]
    ReopenImmediately,
    /// Failures count toward `failure_threshold` again, as in the closed state.
    AccumulateFailures,
}

/// Circuit breaker settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the circuit.
    pub failure_threshold: u32,
    /// Consecutive half-open successes that close it again.
    pub success_threshold: u32,
    /// How long the circuit stays open after the last failure.
    #[serde(rename = "open_timeout_ms", with = "crate::config::duration_ms")]
    pub open_timeout: Duration,
    /// Half-open failure handling.
    pub half_open_policy: HalfOpenPolicy,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            open_timeout: Duration::from_secs(30),
            half_open_policy: HalfOpenPolicy::ReopenImmediately,
        }
    }
}

impl CircuitBreakerConfig {
    /// Set the failure threshold.
    pub fn failure_threshold(mut self, n: u32) -> Self {
        self.failure_threshold = n;
        self
    }

    /// Set the success threshold.
    pub fn success_threshold(mut self, n: u32) -> Self {
        self.success_threshold = n;
        self
    }

    /// Set the open timeout.
    pub fn open_timeout(mut self, timeout: Duration) -> Self {
        self.open_timeout = timeout;
        self
    }

    /// Set the half-open failure policy.
    pub fn half_open_policy(mut self, policy: HalfOpenPolicy) -> Self {
        self.half_open_policy = policy;
        self
    }
}

/// Point-in-time view of a breaker.
#[derive(Debug, Clone, PartialEq)]
pub struct CircuitBreakerSnapshot {
    /// Current state.
    pub state: CircuitState,
    /// Consecutive failures counted so far.
    pub failure_count: u32,
    /// Consecutive half-open successes counted so far.
    pub success_count: u32,
    /// When the last failure was recorded.
    pub last_failure_time: Option<Instant>,
    /// When the last success was recorded.
    pub last_success_time: Option<Instant>,
    /// Calls rejected while open.
    pub rejected_count: u64,
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    last_failure_time: Option<Instant>,
    last_success_time: Option<Instant>,
    rejected_count: u64,
}

impl BreakerState {
    fn transition(&mut self, to: CircuitState) {
        if self.state != to {
            tracing::info!(
                target: "prax::pipeline",
                from = %self.state,
                to = %to,
                "circuit breaker state change"
            );
            self.state = to;
        }
        self.failure_count = 0;
        self.success_count = 0;
    }
}

/// A thread-safe circuit breaker.
///
/// All reads and transitions happen under one mutex, so concurrent callers
/// always observe a consistent state.
#[derive(Debug)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerState>,
}

impl CircuitBreaker {
    /// Create a closed breaker. Zero thresholds fall back to the defaults.
    pub fn new(mut config: CircuitBreakerConfig) -> Self {
        let defaults = CircuitBreakerConfig::default();
        if config.failure_threshold == 0 {
            config.failure_threshold = defaults.failure_threshold;
        }
        if config.success_threshold == 0 {
            config.success_threshold = defaults.success_threshold;
        }
        Self {
            config,
            inner: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                failure_count: 0,
                success_count: 0,
                last_failure_time: None,
                last_success_time: None,
                rejected_count: 0,
            }),
        }
    }

    /// The effective configuration.
    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Current state, without applying the open timeout.
    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    /// Ask to run a call.
    ///
    /// Moves an open breaker to half-open once the open timeout has passed.
    /// Returns the state the call was admitted under, or a circuit-open error.
    pub fn try_acquire(&self) -> Result<CircuitState, QueryError> {
        let mut inner = self.inner.lock();
        if inner.state == CircuitState::Open {
            let expired = inner
                .last_failure_time
                .is_none_or(|t| t.elapsed() >= self.config.open_timeout);
            if !expired {
                inner.rejected_count += 1;
                return Err(QueryError::circuit_open());
            }
            inner.transition(CircuitState::HalfOpen);
        }
        Ok(inner.state)
    }

    /// Record a successful call.
    pub fn on_success(&self) {
        let mut inner = self.inner.lock();
        inner.last_success_time = Some(Instant::now());
        match inner.state {
            CircuitState::Closed => inner.failure_count = 0,
            CircuitState::HalfOpen => {
                inner.success_count += 1;
                if inner.success_count >= self.config.success_threshold {
                    inner.transition(CircuitState::Closed);
                }
            }
            // A call admitted before the circuit opened.
            CircuitState::Open => {}
        }
    }

    /// Record a failed call.
    pub fn on_failure(&self) {
        let mut inner = self.inner.lock();
        inner.last_failure_time = Some(Instant::now());
        match (inner.state, self.config.half_open_policy) {
            (CircuitState::HalfOpen, HalfOpenPolicy::ReopenImmediately) => {
                inner.transition(CircuitState::Open);
            }
            (CircuitState::Closed, _) | (CircuitState::HalfOpen, HalfOpenPolicy::AccumulateFailures) => {
                inner.failure_count += 1;
                inner.success_count = 0;
                if inner.failure_count >= self.config.failure_threshold {
                    inner.transition(CircuitState::Open);
                }
            }
            (CircuitState::Open, _) => {}
        }
    }

    /// Snapshot the counters.
    pub fn snapshot(&self) -> CircuitBreakerSnapshot {
        let inner = self.inner.lock();
        CircuitBreakerSnapshot {
            state: inner.state,
            failure_count: inner.failure_count,
            success_count: inner.success_count,
            last_failure_time: inner.last_failure_time,
            last_success_time: inner.last_success_time,
            rejected_count: inner.rejected_count,
        }
    }

    /// Force the breaker back to closed.
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.transition(CircuitState::Closed);
        inner.rejected_count = 0;
    }
}

/// Retry loop behind a circuit breaker.
///
/// The breaker sees one outcome per call through this middleware, however
/// many attempts the retry loop made. Cancellations are not counted.
pub struct CircuitBreakerRetryMiddleware {
    breaker: Arc<CircuitBreaker>,
    policy: RetryPolicy,
}

impl CircuitBreakerRetryMiddleware {
    /// Create with a fresh breaker.
    pub fn new(policy: RetryPolicy, config: CircuitBreakerConfig) -> Self {
        Self::with_breaker(policy, Arc::new(CircuitBreaker::new(config)))
    }

    /// Create around an existing breaker, e.g. to share it or inspect it later.
    pub fn with_breaker(policy: RetryPolicy, breaker: Arc<CircuitBreaker>) -> Self {
        Self { breaker, policy }
    }

    /// The underlying breaker.
    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }
}

impl Middleware for CircuitBreakerRetryMiddleware {
    fn handle<'a>(
        &'a self,
        ctx: CallContext,
        exec: ExecutionContext,
        next: Next,
    ) -> BoxFuture<'a, MiddlewareResult<QueryResponse>> {
        Box::pin(async move {
            let state = match self.breaker.try_acquire() {
                Ok(state) => state,
                Err(err) => {
                    exec.update_metadata(|m| m.circuit_state = Some(CircuitState::Open));
                    return Err(err.with_middleware(self.name()));
                }
            };
            exec.update_metadata(|m| m.circuit_state = Some(state));

            let result = self.policy.run(self.name(), &ctx, &exec, &next).await;
            match &result {
                Ok(_) => self.breaker.on_success(),
                Err(err) if err.is_cancellation() => {}
                Err(_) => self.breaker.on_failure(),
            }
            result
        })
    }

    fn name(&self) -> &str {
        "CircuitBreakerRetryMiddleware"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::middleware::types::executor_fn;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    struct Backend {
        healthy: Arc<AtomicBool>,
        calls: Arc<AtomicU32>,
    }

    impl Backend {
        fn new(healthy: bool) -> Self {
            Self {
                healthy: Arc::new(AtomicBool::new(healthy)),
                calls: Arc::new(AtomicU32::new(0)),
            }
        }

        fn next(&self) -> Next {
            let healthy = self.healthy.clone();
            let calls = self.calls.clone();
            Next::terminal(Some(Arc::new(executor_fn(move |_ctx, _sql, _params| {
                calls.fetch_add(1, Ordering::SeqCst);
                let ok = healthy.load(Ordering::SeqCst);
                async move {
                    if ok {
                        Ok(QueryResponse::empty())
                    } else {
                        Err(QueryError::connection("refused"))
                    }
                }
            }))))
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    fn middleware(config: CircuitBreakerConfig) -> CircuitBreakerRetryMiddleware {
        CircuitBreakerRetryMiddleware::new(RetryPolicy::new(1), config)
    }

    async fn call(m: &CircuitBreakerRetryMiddleware, backend: &Backend) -> MiddlewareResult<QueryResponse> {
        m.handle(
            CallContext::new(),
            ExecutionContext::new("SELECT 1", vec![]),
            backend.next(),
        )
        .await
    }

    #[test]
    fn test_state_display() {
        assert_eq!(CircuitState::Closed.to_string(), "closed");
        assert_eq!(CircuitState::HalfOpen.to_string(), "half_open");
    }

    #[test]
    fn test_zero_thresholds_use_defaults() {
        let breaker = CircuitBreaker::new(CircuitBreakerConfig::default().failure_threshold(0).success_threshold(0));
        assert_eq!(breaker.config().failure_threshold, 5);
        assert_eq!(breaker.config().success_threshold, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_opens_after_threshold_and_rejects() {
        let backend = Backend::new(false);
        let m = middleware(CircuitBreakerConfig::default().failure_threshold(3));

        for _ in 0..3 {
            assert!(call(&m, &backend).await.is_err());
        }
        assert_eq!(m.breaker().state(), CircuitState::Open);

        let err = call(&m, &backend).await.unwrap_err();
        assert!(err.is_circuit_open());
        assert_eq!(err.message, "circuit breaker is open");
        assert_eq!(err.context.middleware.as_deref(), Some("CircuitBreakerRetryMiddleware"));
        assert_eq!(backend.calls(), 3);
        assert_eq!(m.breaker().snapshot().rejected_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_then_closes_after_successes() {
        let backend = Backend::new(false);
        let m = middleware(
            CircuitBreakerConfig::default()
                .failure_threshold(2)
                .success_threshold(2)
                .open_timeout(Duration::from_secs(5)),
        );

        call(&m, &backend).await.unwrap_err();
        call(&m, &backend).await.unwrap_err();
        assert_eq!(m.breaker().state(), CircuitState::Open);

        tokio::time::advance(Duration::from_secs(5)).await;
        backend.healthy.store(true, Ordering::SeqCst);

        let exec = ExecutionContext::new("SELECT 1", vec![]);
        m.handle(CallContext::new(), exec.clone(), backend.next()).await.unwrap();
        assert_eq!(exec.metadata().circuit_state, Some(CircuitState::HalfOpen));
        assert_eq!(m.breaker().state(), CircuitState::HalfOpen);

        call(&m, &backend).await.unwrap();
        assert_eq!(m.breaker().state(), CircuitState::Closed);
        assert_eq!(backend.calls(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_failure_reopens_immediately() {
        let backend = Backend::new(false);
        let m = middleware(
            CircuitBreakerConfig::default()
                .failure_threshold(3)
                .open_timeout(Duration::from_secs(1)),
        );

        for _ in 0..3 {
            call(&m, &backend).await.unwrap_err();
        }
        tokio::time::advance(Duration::from_secs(1)).await;

        let err = call(&m, &backend).await.unwrap_err();
        assert!(!err.is_circuit_open());
        assert_eq!(m.breaker().state(), CircuitState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_accumulate_policy() {
        let backend = Backend::new(false);
        let m = middleware(
            CircuitBreakerConfig::default()
                .failure_threshold(2)
                .open_timeout(Duration::from_secs(1))
                .half_open_policy(HalfOpenPolicy::AccumulateFailures),
        );

        call(&m, &backend).await.unwrap_err();
        call(&m, &backend).await.unwrap_err();
        tokio::time::advance(Duration::from_secs(1)).await;

        call(&m, &backend).await.unwrap_err();
        assert_eq!(m.breaker().state(), CircuitState::HalfOpen);
        call(&m, &backend).await.unwrap_err();
        assert_eq!(m.breaker().state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn test_success_resets_failure_count() {
        let backend = Backend::new(false);
        let m = middleware(CircuitBreakerConfig::default().failure_threshold(3));

        call(&m, &backend).await.unwrap_err();
        call(&m, &backend).await.unwrap_err();
        backend.healthy.store(true, Ordering::SeqCst);
        call(&m, &backend).await.unwrap();

        assert_eq!(m.breaker().snapshot().failure_count, 0);
        assert_eq!(m.breaker().state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_count_as_one_outcome() {
        let backend = Backend::new(false);
        let m = CircuitBreakerRetryMiddleware::new(
            RetryPolicy::new(3).with_backoff(crate::middleware::ConstantBackoff(Duration::from_millis(1))),
            CircuitBreakerConfig::default().failure_threshold(2),
        );

        call(&m, &backend).await.unwrap_err();
        assert_eq!(backend.calls(), 3);
        assert_eq!(m.breaker().snapshot().failure_count, 1);
        assert_eq!(m.breaker().state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_cancellation_is_not_counted() {
        let backend = Backend::new(false);
        let m = middleware(CircuitBreakerConfig::default().failure_threshold(1));
        let ctx = CallContext::new();
        ctx.cancel();

        let err = m
            .handle(ctx, ExecutionContext::new("SELECT 1", vec![]), backend.next())
            .await
            .unwrap_err();

        assert!(err.is_cancellation());
        assert_eq!(m.breaker().state(), CircuitState::Closed);
        assert_eq!(backend.calls(), 0);
    }
}
