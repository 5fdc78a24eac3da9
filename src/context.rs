//! Cancellation and deadline propagation.
//!
//! Every backend, indexer and aggregator call takes a `&Context`. Clones share
//! the same cancellation flag, so cancelling any clone cancels all of them.

use crate::error::{QuarryError, Result};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Default)]
pub struct Context {
    cancelled: Arc<AtomicBool>,
    deadline: Option<Instant>,
}

impl Context {
    /// A context that is never cancelled and has no deadline.
    pub fn background() -> Self {
        Self::default()
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            cancelled: Arc::new(AtomicBool::new(false)),
            deadline: Some(Instant::now() + timeout),
        }
    }

    /// Derive a child sharing this context's cancellation flag, with the
    /// earlier of the two deadlines.
    pub fn child_with_timeout(&self, timeout: Duration) -> Self {
        let candidate = Instant::now() + timeout;
        let deadline = match self.deadline {
            Some(existing) if existing < candidate => existing,
            _ => candidate,
        };

        Self {
            cancelled: Arc::clone(&self.cancelled),
            deadline: Some(deadline),
        }
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Time left before the deadline; `Some(ZERO)` once it has passed.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    /// Fails with `Cancelled` or `DeadlineExceeded` when the caller no longer
    /// wants the result.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            return Err(QuarryError::Cancelled);
        }

        match self.remaining() {
            Some(left) if left.is_zero() => Err(QuarryError::DeadlineExceeded),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancellation_is_shared_between_clones() {
        let ctx = Context::background();
        let clone = ctx.clone();
        assert!(ctx.check().is_ok());

        clone.cancel();
        assert!(matches!(ctx.check(), Err(QuarryError::Cancelled)));
    }

    #[test]
    fn expired_deadline_fails_check() {
        let ctx = Context::with_timeout(Duration::ZERO);
        assert!(matches!(ctx.check(), Err(QuarryError::DeadlineExceeded)));
    }

    #[test]
    fn child_keeps_the_earlier_deadline() {
        let parent = Context::with_timeout(Duration::from_millis(10));
        let child = parent.child_with_timeout(Duration::from_secs(60));
        assert_eq!(child.deadline(), parent.deadline());
    }
}
