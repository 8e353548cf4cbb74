//! Caller-side cancellation and deadlines.

use crate::error::QueryError;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// The caller's cancellation scope for one logical execution.
///
/// Every blocking point in the pipeline (retry delays, timeout races) selects
/// on [`CallContext::cancelled`] so that a cancelled caller gets control back
/// promptly. Middleware pass the context downward unchanged unless they need a
/// tighter deadline, in which case they derive a child with
/// [`CallContext::with_timeout`].
///
/// Executors that want real cancellation (rather than an abandoned future)
/// should watch [`CallContext::token`] themselves.
#[derive(Debug, Clone, Default)]
pub struct CallContext {
    token: CancellationToken,
    deadline: Option<Instant>,
}

impl CallContext {
    /// Create a context with no deadline.
    pub fn new() -> Self {
        Self::default()
    }

    /// Derive a child whose deadline is at most `timeout` from now.
    ///
    /// Cancelling the parent cancels the child; cancelling the child leaves
    /// the parent untouched. A timeout too large to represent as an instant
    /// adds no bound of its own.
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        match Instant::now().checked_add(timeout) {
            Some(deadline) => self.with_deadline(deadline),
            None => Self {
                token: self.token.child_token(),
                deadline: self.deadline,
            },
        }
    }

    /// Derive a child with the tighter of the current and the given deadline.
    pub fn with_deadline(&self, deadline: Instant) -> Self {
        let deadline = match self.deadline {
            Some(current) if current < deadline => current,
            _ => deadline,
        };
        Self {
            token: self.token.child_token(),
            deadline: Some(deadline),
        }
    }

    /// The deadline, if one was set.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Time left before the deadline.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline.map(|d| d.saturating_duration_since(Instant::now()))
    }

    /// The underlying cancellation token.
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Cancel this context and all children.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Check whether the context is done, either cancelled or past its deadline.
    pub fn is_done(&self) -> bool {
        self.err().is_some()
    }

    /// The reason the context is done, or `None` while it is still live.
    pub fn err(&self) -> Option<QueryError> {
        if self.token.is_cancelled() {
            Some(QueryError::cancelled())
        } else if self.deadline.is_some_and(|d| Instant::now() >= d) {
            Some(QueryError::deadline_exceeded())
        } else {
            None
        }
    }

    /// Wait until the context is cancelled or its deadline passes.
    ///
    /// Resolves with the matching cancellation error.
    pub async fn cancelled(&self) -> QueryError {
        match self.deadline {
            Some(deadline) => {
                tokio::select! {
                    biased;
                    _ = self.token.cancelled() => QueryError::cancelled(),
                    _ = tokio::time::sleep_until(deadline) => {
                        QueryError::deadline_exceeded()
                    }
                }
            }
            None => {
                self.token.cancelled().await;
                QueryError::cancelled()
            }
        }
    }
}
