//! Retry middleware for automatic statement retry on failure.

use super::call::CallContext;
use super::context::ExecutionContext;
use super::types::{BoxFuture, Middleware, MiddlewareResult, Next, QueryResponse};
use crate::error::{ErrorCode, QueryError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Computes the delay before a retry.
pub trait BackoffStrategy: Send + Sync {
    /// Delay before retry number `attempt` (1 for the first retry).
    fn next_backoff(&self, attempt: u32) -> Duration;
}

/// Exponential backoff: `initial * multiplier^(attempt - 1)`, clamped to `max_delay`.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Upper bound for any delay.
    pub max_delay: Duration,
    /// Growth factor between retries.
    pub multiplier: f64,
    /// Add up to 25% random jitter.
    pub jitter: bool,
}

/// The backoff used when none is configured.
pub type DefaultBackoff = ExponentialBackoff;

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            multiplier: 2.0,
            jitter: false,
        }
    }
}

impl ExponentialBackoff {
    /// Create with the given initial delay and default growth.
    pub fn new(initial_delay: Duration) -> Self {
        Self {
            initial_delay,
            ..Self::default()
        }
    }

    /// Set maximum delay.
    pub fn max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Set backoff multiplier.
    pub fn multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    /// Enable or disable jitter.
    pub fn jitter(mut self, enabled: bool) -> Self {
        self.jitter = enabled;
        self
    }
}

impl BackoffStrategy for ExponentialBackoff {
    fn next_backoff(&self, attempt: u32) -> Duration {
        let max = self.max_delay.as_nanos() as f64;
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let mut nanos = self.initial_delay.as_nanos() as f64 * self.multiplier.powi(exponent);

        if self.jitter {
            nanos += nanos * 0.25 * rand_jitter();
        }
        if !nanos.is_finite() {
            nanos = max;
        }

        Duration::from_nanos(nanos.clamp(0.0, max).round() as u64)
    }
}

/// Simple pseudo-random jitter in `[0, 1)` without an rng dependency.
fn rand_jitter() -> f64 {
    use std::collections::hash_map::RandomState;
    use std::hash::{BuildHasher, Hasher};

    let hasher = RandomState::new().build_hasher();
    let hash = hasher.finish();
    (hash % 1000) as f64 / 1000.0
}

/// Linear backoff: `attempt * interval`, optionally capped.
#[derive(Debug, Clone)]
pub struct LinearBackoff {
    /// Step added per retry.
    pub interval: Duration,
    /// Optional upper bound.
    pub max: Option<Duration>,
}

impl LinearBackoff {
    /// Create an uncapped linear backoff.
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            max: None,
        }
    }

    /// Cap every delay at `max`.
    pub fn with_max(mut self, max: Duration) -> Self {
        self.max = Some(max);
        self
    }
}

impl BackoffStrategy for LinearBackoff {
    fn next_backoff(&self, attempt: u32) -> Duration {
        let delay = self.interval.saturating_mul(attempt);
        match self.max {
            Some(max) => delay.min(max),
            None => delay,
        }
    }
}

/// The same delay before every retry.
#[derive(Debug, Clone, Copy)]
pub struct ConstantBackoff(pub Duration);

impl BackoffStrategy for ConstantBackoff {
    fn next_backoff(&self, _attempt: u32) -> Duration {
        self.0
    }
}

/// Decides whether an error is worth another attempt.
///
/// Any `Fn(&QueryError) -> bool` closure is a checker.
pub trait RetryableChecker: Send + Sync {
    /// Return `true` to retry after `error`.
    fn is_retryable(&self, error: &QueryError) -> bool;
}

impl<F> RetryableChecker for F
where
    F: Fn(&QueryError) -> bool + Send + Sync,
{
    fn is_retryable(&self, error: &QueryError) -> bool {
        self(error)
    }
}

/// Built-in retry predicates.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryPredicate {
    /// Retry on any error.
    #[default]
    Always,
    /// Never retry.
    Never,
    /// Retry connection, timeout, deadlock and serialization failures.
    Transient,
    /// Retry anything except validation failures.
    ExceptValidation,
    /// Retry only the listed codes.
    #[serde(skip)]
    Codes(Vec<ErrorCode>),
}

impl RetryableChecker for RetryPredicate {
    fn is_retryable(&self, error: &QueryError) -> bool {
        match self {
            Self::Always => true,
            Self::Never => false,
            Self::Transient => error.is_transient(),
            Self::ExceptValidation => !error.is_validation(),
            Self::Codes(codes) => codes.contains(&error.code),
        }
    }
}

/// How many times to try, how long to wait, and which errors qualify.
#[derive(Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    backoff: Arc<dyn BackoffStrategy>,
    retryable: Arc<dyn RetryableChecker>,
}

impl RetryPolicy {
    /// Create a policy allowing `max_attempts` attempts in total.
    ///
    /// Zero is treated as 3.
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: if max_attempts == 0 { 3 } else { max_attempts },
            backoff: Arc::new(DefaultBackoff::default()),
            retryable: Arc::new(RetryPredicate::Always),
        }
    }

    /// Set the backoff strategy.
    pub fn with_backoff<B: BackoffStrategy + 'static>(mut self, backoff: B) -> Self {
        self.backoff = Arc::new(backoff);
        self
    }

    /// Set the retryable check.
    pub fn with_retryable<R: RetryableChecker + 'static>(mut self, retryable: R) -> Self {
        self.retryable = Arc::new(retryable);
        self
    }

    /// Total number of attempts allowed.
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Delay before retry number `attempt`.
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        self.backoff.next_backoff(attempt)
    }

    /// Whether `error` may be retried. Cancellations never are.
    pub fn should_retry(&self, error: &QueryError) -> bool {
        !error.is_cancellation() && self.retryable.is_retryable(error)
    }

    /// Drive `next` until it succeeds, fails permanently or runs out of attempts.
    pub(crate) async fn run(
        &self,
        middleware: &str,
        ctx: &CallContext,
        exec: &ExecutionContext,
        next: &Next,
    ) -> MiddlewareResult<QueryResponse> {
        let mut attempt = 0;
        loop {
            if let Some(err) = ctx.err() {
                return Err(err.with_middleware(middleware));
            }

            exec.set_retry_attempt(attempt);
            exec.update_metadata(|m| m.attempts = attempt + 1);

            let error = match next.run(ctx.clone(), exec.clone()).await {
                Ok(response) => return Ok(response),
                Err(error) => error,
            };
            exec.set_last_error(Some(error.clone()));

            if !self.should_retry(&error) || attempt + 1 >= self.max_attempts {
                return Err(error);
            }

            attempt += 1;
            let delay = self.backoff_for(attempt);
            tracing::debug!(
                target: "prax::pipeline",
                middleware,
                attempt,
                max_attempts = self.max_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "retrying statement"
            );

            tokio::select! {
                biased;
                err = ctx.cancelled() => return Err(err.with_middleware(middleware)),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3)
    }
}

impl fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_attempts", &self.max_attempts)
            .field("first_delay", &self.backoff.next_backoff(1))
            .finish_non_exhaustive()
    }
}

/// Middleware that re-runs the rest of the chain on failure.
///
/// # Example
///
/// ```rust
/// use prax_pipeline::middleware::{ExponentialBackoff, RetryMiddleware, RetryPolicy, RetryPredicate};
/// use std::time::Duration;
///
/// let retry = RetryMiddleware::new(
///     RetryPolicy::new(5)
///         .with_backoff(ExponentialBackoff::new(Duration::from_millis(50)).multiplier(2.0))
///         .with_retryable(RetryPredicate::Transient),
/// );
/// ```
pub struct RetryMiddleware {
    policy: RetryPolicy,
}

impl RetryMiddleware {
    /// Create a new retry middleware with the given policy.
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    /// Get the policy.
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }
}

impl Middleware for RetryMiddleware {
    fn handle<'a>(
        &'a self,
        ctx: CallContext,
        exec: ExecutionContext,
        next: Next,
    ) -> BoxFuture<'a, MiddlewareResult<QueryResponse>> {
        Box::pin(async move { self.policy.run(self.name(), &ctx, &exec, &next).await })
    }

    fn name(&self) -> &str {
        "RetryMiddleware"
    }
}

fn default_multiplier() -> f64 {
    2.0
}

/// Serializable backoff description.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BackoffConfig {
    /// See [`ExponentialBackoff`].
    Exponential {
        /// Delay before the first retry.
        #[serde(rename = "initial_delay_ms", with = "crate::config::duration_ms")]
        initial_delay: Duration,
        /// Upper bound for any delay.
        #[serde(rename = "max_delay_ms", with = "crate::config::duration_ms")]
        max_delay: Duration,
        /// Growth factor.
        #[serde(default = "default_multiplier")]
        multiplier: f64,
        /// Add random jitter.
        #[serde(default)]
        jitter: bool,
    },
    /// See [`LinearBackoff`].
    Linear {
        /// Step added per retry.
        #[serde(rename = "interval_ms", with = "crate::config::duration_ms")]
        interval: Duration,
        /// Optional cap.
        #[serde(
            rename = "max_ms",
            default,
            with = "crate::config::option_duration_ms"
        )]
        max: Option<Duration>,
    },
    /// See [`ConstantBackoff`].
    Constant {
        /// Delay before every retry.
        #[serde(rename = "delay_ms", with = "crate::config::duration_ms")]
        delay: Duration,
    },
}

impl Default for BackoffConfig {
    fn default() -> Self {
        let backoff = ExponentialBackoff::default();
        Self::Exponential {
            initial_delay: backoff.initial_delay,
            max_delay: backoff.max_delay,
            multiplier: backoff.multiplier,
            jitter: backoff.jitter,
        }
    }
}

impl BackoffConfig {
    fn build(&self) -> Arc<dyn BackoffStrategy> {
        match *self {
            Self::Exponential {
                initial_delay,
                max_delay,
                multiplier,
                jitter,
            } => Arc::new(ExponentialBackoff {
                initial_delay,
                max_delay,
                multiplier,
                jitter,
            }),
            Self::Linear { interval, max } => Arc::new(LinearBackoff { interval, max }),
            Self::Constant { delay } => Arc::new(ConstantBackoff(delay)),
        }
    }
}

/// Serializable retry configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts (0 is treated as 3).
    pub max_attempts: u32,
    /// Delay between attempts.
    pub backoff: BackoffConfig,
    /// Which errors are retried.
    pub retry_on: RetryPredicate,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: BackoffConfig::default(),
            retry_on: RetryPredicate::Always,
        }
    }
}

impl RetryConfig {
    /// Build the runtime policy.
    pub fn to_policy(&self) -> RetryPolicy {
        RetryPolicy {
            backoff: self.backoff.build(),
            retryable: Arc::new(self.retry_on.clone()),
            ..RetryPolicy::new(self.max_attempts)
        }
    }
}
