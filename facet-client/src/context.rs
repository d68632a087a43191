//! Call context: deadline plus cooperative cancellation.
//!
//! A [`Context`] travels with every call. It carries an optional absolute
//! deadline and an optional cancellation signal; either one resolves
//! [`Context::done`]. Contexts are cheap to clone and derive.

use crate::error::Error;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;

/// Deadline and cancellation scope for a call.
#[derive(Debug, Clone, Default)]
pub struct Context {
    deadline: Option<Instant>,
    cancel: Option<watch::Receiver<bool>>,
}

/// Handle that cancels the [`Context`] it was derived from.
///
/// Dropping the handle without calling [`CancelHandle::cancel`] leaves the
/// context uncancelable.
#[derive(Debug)]
pub struct CancelHandle(watch::Sender<bool>);

impl CancelHandle {
    pub fn cancel(&self) {
        let _ = self.0.send(true);
    }
}

impl Context {
    /// A context with no deadline and no cancellation.
    pub fn background() -> Self {
        Self::default()
    }

    /// Derives a context whose deadline is at most `timeout` from now.
    /// An earlier inherited deadline is kept.
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    /// Derives a context with the given absolute deadline, keeping an
    /// earlier inherited one.
    pub fn with_deadline(&self, at: Instant) -> Self {
        let deadline = match self.deadline {
            Some(existing) => Some(existing.min(at)),
            None => Some(at),
        };
        Self {
            deadline,
            cancel: self.cancel.clone(),
        }
    }

    /// Derives a cancelable context and its cancellation handle.
    pub fn with_cancel(&self) -> (Self, CancelHandle) {
        let (tx, rx) = watch::channel(false);
        let ctx = Self {
            deadline: self.deadline,
            cancel: Some(rx),
        };
        (ctx, CancelHandle(tx))
    }

    /// Applies a network timeout: zero inherits this context unchanged.
    pub(crate) fn with_net_timeout(&self, timeout: Duration) -> Self {
        if timeout.is_zero() {
            self.clone()
        } else {
            self.with_timeout(timeout)
        }
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Why the context is done, if it is: explicit cancellation wins over
    /// an expired deadline.
    pub fn err(&self) -> Option<Error> {
        if let Some(rx) = &self.cancel {
            if *rx.borrow() {
                return Some(Error::Canceled);
            }
        }
        if let Some(d) = self.deadline {
            if Instant::now() >= d {
                return Some(Error::DeadlineExceeded);
            }
        }
        None
    }

    /// Resolves when the context is cancelled or its deadline passes.
    /// Never resolves for a bare background context.
    pub async fn done(&self) {
        let expired = async {
            match self.deadline {
                Some(d) => tokio::time::sleep_until(d).await,
                None => std::future::pending().await,
            }
        };
        tokio::select! {
            _ = expired => {}
            _ = self.cancelled() => {}
        }
    }

    async fn cancelled(&self) {
        match &self.cancel {
            Some(rx) => {
                let mut rx = rx.clone();
                loop {
                    if *rx.borrow() {
                        return;
                    }
                    if rx.changed().await.is_err() {
                        // Handle dropped without cancelling: never fires.
                        std::future::pending::<()>().await;
                    }
                }
            }
            None => std::future::pending().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_background_never_errors() {
        assert!(Context::background().err().is_none());
    }

    #[tokio::test]
    async fn test_cancel() {
        let (ctx, handle) = Context::background().with_cancel();
        assert!(ctx.err().is_none());

        handle.cancel();
        assert!(matches!(ctx.err(), Some(Error::Canceled)));

        // done() resolves promptly once cancelled
        tokio::time::timeout(Duration::from_millis(100), ctx.done())
            .await
            .expect("done() did not resolve after cancel");
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_expiry() {
        let ctx = Context::background().with_timeout(Duration::from_secs(1));
        assert!(ctx.err().is_none());

        ctx.done().await;
        assert!(matches!(ctx.err(), Some(Error::DeadlineExceeded)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_earlier_deadline_kept() {
        let ctx = Context::background().with_timeout(Duration::from_secs(1));
        let derived = ctx.with_timeout(Duration::from_secs(60));
        assert_eq!(ctx.deadline(), derived.deadline());
    }

    #[test]
    fn test_net_timeout_zero_inherits() {
        let ctx = Context::background().with_timeout(Duration::from_secs(5));
        let inherited = ctx.with_net_timeout(Duration::ZERO);
        assert_eq!(inherited.deadline(), ctx.deadline());
    }

    #[tokio::test]
    async fn test_cancel_wins_over_deadline() {
        let (ctx, handle) = Context::background().with_cancel();
        let ctx = ctx.with_deadline(Instant::now() - Duration::from_secs(1));
        handle.cancel();
        assert!(matches!(ctx.err(), Some(Error::Canceled)));
    }
}
