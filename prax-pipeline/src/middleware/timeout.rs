//! Fixed and adaptive timeout middleware.
//!
//! Both variants run the rest of the chain on a spawned task and race its
//! result against a deadline and the caller's cancellation. When the deadline
//! wins, the task's [`CallContext`] is cancelled so a cooperative executor can
//! stop; otherwise the task is left to finish on its own and its result is
//! discarded.

use super::call::CallContext;
use super::context::ExecutionContext;
use super::types::{BoxFuture, Middleware, MiddlewareResult, Next, QueryResponse};
use crate::error::{ErrorCode, QueryError};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_PERCENTILE: f64 = 0.99;
const MIN_SAMPLES: usize = 10;
const MAX_WINDOW: usize = 1000;
// 1.2 as a ratio so the scaling stays in integer nanoseconds.
const HEADROOM: (u128, u128) = (6, 5);

enum Race {
    Completed(MiddlewareResult<QueryResponse>),
    TimedOut,
    Cancelled(QueryError),
}

async fn race(timeout: Duration, ctx: &CallContext, exec: &ExecutionContext, next: &Next) -> Race {
    let child = ctx.with_timeout(timeout);
    let (tx, rx) = oneshot::channel();

    let task_ctx = child.clone();
    let task = next.run(task_ctx, exec.clone());
    tokio::spawn(async move {
        let _ = tx.send(task.await);
    });

    tokio::select! {
        biased;
        err = ctx.cancelled() => {
            child.cancel();
            Race::Cancelled(err)
        }
        result = rx => match result {
            // The child's own deadline surfaced from inside the chain.
            Ok(Err(err)) if err.code == ErrorCode::DeadlineExceeded && ctx.err().is_none() => {
                Race::TimedOut
            }
            Ok(result) => Race::Completed(result),
            Err(_) => Race::Completed(Err(QueryError::internal(
                "statement task ended without producing a result",
            ))),
        },
        _ = tokio::time::sleep(timeout) => {
            child.cancel();
            Race::TimedOut
        }
    }
}

/// Fixed timeout settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Deadline for each call. Zero means 30 seconds.
    #[serde(rename = "timeout_ms", with = "crate::config::duration_ms")]
    pub timeout: Duration,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

/// Middleware that fails calls running longer than a fixed duration.
pub struct TimeoutMiddleware {
    timeout: Duration,
}

impl TimeoutMiddleware {
    /// Create with the given timeout. Zero means 30 seconds.
    pub fn new(timeout: Duration) -> Self {
        Self::with_config(TimeoutConfig { timeout })
    }

    /// Create from configuration.
    pub fn with_config(config: TimeoutConfig) -> Self {
        let timeout = if config.timeout.is_zero() {
            DEFAULT_TIMEOUT
        } else {
            config.timeout
        };
        Self { timeout }
    }

    /// The enforced timeout.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

impl Middleware for TimeoutMiddleware {
    fn handle<'a>(
        &'a self,
        ctx: CallContext,
        exec: ExecutionContext,
        next: Next,
    ) -> BoxFuture<'a, MiddlewareResult<QueryResponse>> {
        Box::pin(async move {
            exec.update_metadata(|m| m.effective_timeout = Some(self.timeout));

            match race(self.timeout, &ctx, &exec, &next).await {
                Race::Completed(result) => result,
                Race::TimedOut => {
                    tracing::warn!(
                        target: "prax::pipeline",
                        timeout_ms = self.timeout.as_millis() as u64,
                        sql = exec.sql(),
                        "statement timed out"
                    );
                    Err(QueryError::timeout(self.timeout).with_middleware(self.name()))
                }
                Race::Cancelled(err) => Err(err.with_middleware(self.name())),
            }
        })
    }

    fn name(&self) -> &str {
        "TimeoutMiddleware"
    }
}

fn default_window_size() -> usize {
    MAX_WINDOW
}

/// Adaptive timeout settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AdaptiveTimeoutConfig {
    /// Timeout used until enough samples are collected.
    #[serde(rename = "base_timeout_ms", with = "crate::config::duration_ms")]
    pub base_timeout: Duration,
    /// Lower clamp for the computed timeout.
    #[serde(rename = "min_timeout_ms", with = "crate::config::duration_ms")]
    pub min_timeout: Duration,
    /// Upper clamp for the computed timeout.
    #[serde(rename = "max_timeout_ms", with = "crate::config::duration_ms")]
    pub max_timeout: Duration,
    /// Percentile of recent durations, in `(0, 1)`.
    pub percentile: f64,
    /// Number of recent successful durations kept, between 1 and 1000.
    #[serde(default = "default_window_size")]
    pub window_size: usize,
}

impl Default for AdaptiveTimeoutConfig {
    fn default() -> Self {
        Self {
            base_timeout: DEFAULT_TIMEOUT,
            min_timeout: Duration::from_millis(100),
            max_timeout: Duration::from_secs(60),
            percentile: DEFAULT_PERCENTILE,
            window_size: default_window_size(),
        }
    }
}

/// Snapshot of an adaptive timeout's history.
#[derive(Debug, Clone, PartialEq)]
pub struct AdaptiveTimeoutStats {
    /// Samples currently in the window.
    pub sample_count: usize,
    /// Calls seen, including timed-out and failed ones.
    pub total_executions: u64,
    /// Mean of the window.
    pub average: Duration,
    /// Largest sample in the window.
    pub max: Duration,
    /// Smallest sample in the window.
    pub min: Duration,
    /// Timeout the next call would get.
    pub current_timeout: Duration,
    /// Fraction of calls that hit the deadline.
    pub exceed_rate: f64,
}

#[derive(Debug, Default)]
struct AdaptiveState {
    samples: VecDeque<Duration>,
    total_executions: u64,
    timeout_exceed_count: u64,
}

/// Timeout derived from a percentile of recent successful durations.
///
/// The effective timeout is `percentile(window) * 1.2`, clamped to
/// `[min_timeout, max_timeout]`. With fewer than ten samples the base
/// timeout is used.
pub struct AdaptiveTimeoutMiddleware {
    config: AdaptiveTimeoutConfig,
    state: Mutex<AdaptiveState>,
}

impl AdaptiveTimeoutMiddleware {
    /// Create from configuration, repairing out-of-range values.
    pub fn new(mut config: AdaptiveTimeoutConfig) -> Self {
        if !(config.percentile > 0.0 && config.percentile < 1.0) {
            config.percentile = DEFAULT_PERCENTILE;
        }
        if config.base_timeout.is_zero() {
            config.base_timeout = DEFAULT_TIMEOUT;
        }
        if config.min_timeout > config.max_timeout {
            std::mem::swap(&mut config.min_timeout, &mut config.max_timeout);
        }
        config.window_size = config.window_size.clamp(1, MAX_WINDOW);

        Self {
            config,
            state: Mutex::new(AdaptiveState::default()),
        }
    }

    /// The effective configuration.
    pub fn config(&self) -> &AdaptiveTimeoutConfig {
        &self.config
    }

    /// The timeout the next call would get.
    pub fn current_timeout(&self) -> Duration {
        self.compute_timeout(&self.state.lock())
    }

    fn compute_timeout(&self, state: &AdaptiveState) -> Duration {
        if state.samples.len() < MIN_SAMPLES {
            return self.config.base_timeout;
        }
        let mut sorted: Vec<Duration> = state.samples.iter().copied().collect();
        sorted.sort_unstable();

        with_headroom(percentile(&sorted, self.config.percentile))
            .clamp(self.config.min_timeout, self.config.max_timeout)
    }

    fn record_success(&self, elapsed: Duration) {
        let mut state = self.state.lock();
        if state.samples.len() >= self.config.window_size {
            state.samples.pop_front();
        }
        state.samples.push_back(elapsed);
    }

    /// Snapshot the window and counters.
    pub fn stats(&self) -> AdaptiveTimeoutStats {
        let state = self.state.lock();
        let count = state.samples.len();
        let total: u128 = state.samples.iter().map(Duration::as_nanos).sum();

        AdaptiveTimeoutStats {
            sample_count: count,
            total_executions: state.total_executions,
            average: if count > 0 {
                from_nanos(total / count as u128)
            } else {
                Duration::ZERO
            },
            max: state.samples.iter().max().copied().unwrap_or_default(),
            min: state.samples.iter().min().copied().unwrap_or_default(),
            current_timeout: self.compute_timeout(&state),
            exceed_rate: if state.total_executions > 0 {
                state.timeout_exceed_count as f64 / state.total_executions as f64
            } else {
                0.0
            },
        }
    }
}

impl Middleware for AdaptiveTimeoutMiddleware {
    fn handle<'a>(
        &'a self,
        ctx: CallContext,
        exec: ExecutionContext,
        next: Next,
    ) -> BoxFuture<'a, MiddlewareResult<QueryResponse>> {
        Box::pin(async move {
            let timeout = {
                let mut state = self.state.lock();
                state.total_executions += 1;
                self.compute_timeout(&state)
            };
            exec.update_metadata(|m| m.effective_timeout = Some(timeout));

            let start = Instant::now();
            match race(timeout, &ctx, &exec, &next).await {
                Race::Completed(Ok(response)) => {
                    self.record_success(start.elapsed());
                    Ok(response)
                }
                Race::Completed(Err(err)) => Err(err),
                Race::TimedOut => {
                    self.state.lock().timeout_exceed_count += 1;
                    tracing::warn!(
                        target: "prax::pipeline",
                        timeout_ms = timeout.as_millis() as u64,
                        sql = exec.sql(),
                        "statement exceeded adaptive timeout"
                    );
                    Err(QueryError::timeout(timeout).with_middleware(self.name()))
                }
                Race::Cancelled(err) => Err(err.with_middleware(self.name())),
            }
        })
    }

    fn name(&self) -> &str {
        "AdaptiveTimeoutMiddleware"
    }
}

fn with_headroom(d: Duration) -> Duration {
    let (num, den) = HEADROOM;
    from_nanos(d.as_nanos() * num / den)
}

/// Saturates at `Duration::MAX`.
fn from_nanos(nanos: u128) -> Duration {
    const NANOS_PER_SEC: u128 = 1_000_000_000;
    match u64::try_from(nanos / NANOS_PER_SEC) {
        Ok(secs) => Duration::new(secs, (nanos % NANOS_PER_SEC) as u32),
        Err(_) => Duration::MAX,
    }
}

/// Linear-interpolated percentile of an ascending, non-empty slice.
fn percentile(sorted: &[Duration], p: f64) -> Duration {
    let Some(last) = sorted.len().checked_sub(1) else {
        return Duration::ZERO;
    };
    let rank = p * last as f64;
    let lo = rank.floor() as usize;
    let hi = rank.ceil() as usize;
    let weight = rank - lo as f64;

    let spread = (sorted[hi] - sorted[lo]).as_nanos() as f64 * weight;
    sorted[lo].saturating_add(from_nanos(spread.round() as u128))
}
