//! Call context: a deadline plus a cancellation token.
//!
//! A `CallContext` is threaded through every blocking operation (transport
//! I/O, LLM calls, tool calls). Children inherit the parent's cancellation
//! and never outlive the parent's deadline, so deadlines cascade: a tool
//! call can never run longer than the turn that issued it.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Why a context-bound operation did not complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interrupted {
    /// The deadline elapsed.
    DeadlineExceeded,
    /// The context (or an ancestor) was cancelled.
    Cancelled,
}

/// Deadline and cancellation scope for one operation.
#[derive(Debug, Clone)]
pub struct CallContext {
    deadline: Instant,
    budget: Duration,
    cancel: CancellationToken,
}

impl CallContext {
    /// A root context that expires after `timeout`.
    pub fn new(timeout: Duration) -> Self {
        Self::with_token(timeout, CancellationToken::new())
    }

    /// A root context bound to an externally owned cancellation token.
    pub fn with_token(timeout: Duration, cancel: CancellationToken) -> Self {
        Self {
            deadline: Instant::now() + timeout,
            budget: timeout,
            cancel,
        }
    }

    /// Derive a child context whose deadline is the earlier of the parent's
    /// deadline and `now + timeout`.
    pub fn child(&self, timeout: Duration) -> Self {
        let now = Instant::now();
        let wanted = now + timeout;
        let deadline = wanted.min(self.deadline);
        Self {
            deadline,
            budget: deadline.saturating_duration_since(now),
            cancel: self.cancel.child_token(),
        }
    }

    /// The budget this context was created with (after clamping to the parent).
    pub fn budget(&self) -> Duration {
        self.budget
    }

    /// Time left before the deadline.
    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Cancel this context and all of its children.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Drive `fut` until it completes, the deadline passes, or the context is
    /// cancelled. On interruption the future is dropped immediately.
    pub async fn run<F>(&self, fut: F) -> Result<F::Output, Interrupted>
    where
        F: Future,
    {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(Interrupted::Cancelled),
            res = tokio::time::timeout_at(self.deadline, fut) => {
                res.map_err(|_| Interrupted::DeadlineExceeded)
            }
        }
    }
}
