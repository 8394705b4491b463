use std::future::Future;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;

use crate::error::{Error, Result};

/// Caller-owned deadline and cancellation for one executor call.
///
/// The default context imposes neither; timeout policy belongs to the caller.
#[derive(Debug, Clone, Default)]
pub struct QueryContext {
    deadline: Option<Instant>,
    cancel: Option<watch::Receiver<bool>>,
}

/// Cancels every [`QueryContext`] cloned from the one it was created with.
#[derive(Debug)]
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }
}

impl QueryContext {
    pub fn background() -> Self {
        Self::default()
    }

    pub fn with_cancel() -> (Self, CancelHandle) {
        let (tx, rx) = watch::channel(false);
        let ctx = Self {
            deadline: None,
            cancel: Some(rx),
        };
        (ctx, CancelHandle { tx })
    }

    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    /// Keeps the earlier of the existing and the new deadline.
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(match self.deadline {
            Some(current) if current < deadline => current,
            _ => deadline,
        });
        self
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.as_ref().is_some_and(|rx| *rx.borrow())
    }

    /// Drive `fut` to completion unless the context is cancelled or its
    /// deadline passes first; in that case `fut` is dropped mid-flight.
    pub async fn run<F, T>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = T>,
    {
        if self.is_cancelled() {
            return Err(Error::Cancelled);
        }
        if self.deadline.is_some_and(|deadline| deadline <= Instant::now()) {
            return Err(Error::DeadlineExceeded);
        }

        let bounded = async {
            match self.deadline {
                Some(deadline) => tokio::time::timeout_at(deadline, fut)
                    .await
                    .map_err(|_| Error::DeadlineExceeded),
                None => Ok(fut.await),
            }
        };

        tokio::select! {
            biased;
            _ = self.cancelled() => Err(Error::Cancelled),
            out = bounded => out,
        }
    }

    async fn cancelled(&self) {
        if let Some(rx) = &self.cancel {
            let mut rx = rx.clone();
            if rx.wait_for(|cancelled| *cancelled).await.is_ok() {
                return;
            }
        }
        // No handle, or the handle was dropped without cancelling.
        std::future::pending::<()>().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn background_runs_to_completion() {
        let ctx = QueryContext::background();
        assert_eq!(ctx.run(async { 7 }).await.unwrap(), 7);
        assert!(ctx.deadline().is_none());
    }

    #[tokio::test]
    async fn cancelled_before_start_never_polls() {
        let (ctx, handle) = QueryContext::with_cancel();
        handle.cancel();
        assert!(ctx.is_cancelled());
        let polled = std::sync::atomic::AtomicBool::new(false);
        let out = ctx
            .run(async {
                polled.store(true, std::sync::atomic::Ordering::SeqCst);
            })
            .await;
        assert!(matches!(out, Err(Error::Cancelled)));
        assert!(!polled.load(std::sync::atomic::Ordering::SeqCst));
    }

    #[tokio::test]
    async fn cancel_aborts_in_flight() {
        let (ctx, handle) = QueryContext::with_cancel();
        let slow = tokio::time::sleep(Duration::from_secs(30));
        let canceller = async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            handle.cancel();
        };
        let (out, ()) = tokio::join!(ctx.run(slow), canceller);
        assert!(matches!(out, Err(Error::Cancelled)));
    }

    #[tokio::test]
    async fn dropped_handle_does_not_cancel() {
        let (ctx, handle) = QueryContext::with_cancel();
        drop(handle);
        assert_eq!(ctx.run(async { "done" }).await.unwrap(), "done");
    }

    #[tokio::test]
    async fn deadline_exceeded() {
        let ctx = QueryContext::background().with_timeout(Duration::from_millis(10));
        let out = ctx.run(tokio::time::sleep(Duration::from_secs(30))).await;
        assert!(matches!(out, Err(Error::DeadlineExceeded)));
    }

    #[tokio::test]
    async fn expired_deadline_never_polls() {
        let ctx = QueryContext::background()
            .with_deadline(Instant::now() - Duration::from_millis(1));
        let polled = std::sync::atomic::AtomicBool::new(false);
        let out = ctx
            .run(async {
                polled.store(true, std::sync::atomic::Ordering::SeqCst);
            })
            .await;
        assert!(matches!(out, Err(Error::DeadlineExceeded)));
        assert!(!polled.load(std::sync::atomic::Ordering::SeqCst));
    }

    #[test]
    fn earlier_deadline_wins() {
        let now = Instant::now();
        let early = now + Duration::from_secs(1);
        let late = now + Duration::from_secs(60);
        let ctx = QueryContext::background()
            .with_deadline(early)
            .with_deadline(late);
        assert_eq!(ctx.deadline(), Some(early));
    }
}
