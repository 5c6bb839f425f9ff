//! Cancellation helpers shared by every suspension point of a worker
//! (dequeue, slot acquisition and sandboxed execution).

use futures::{future::BoxFuture, Future, FutureExt};

/// Race a future against a cancellation future.
pub trait CancelFutureExt: Future + Sized {
    /// Returns `None` if `cancel` resolves first, `Some(output)` otherwise.
    ///
    /// Cancellation is checked before the wrapped future is polled, so an
    /// already-cancelled token never lets new work start.
    fn with_cancel<'a, C>(self, cancel: C) -> BoxFuture<'a, Option<Self::Output>>
    where
        Self: Send + 'a,
        Self::Output: Send,
        C: Future<Output = ()> + Send + 'a,
    {
        async move {
            tokio::select! {
                biased;
                _ = cancel => None,
                v = self => Some(v),
            }
        }
        .boxed()
    }
}

impl<F: Future + Sized> CancelFutureExt for F {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    #[tokio::test]
    async fn completes_when_not_cancelled() {
        let token = CancellationToken::new();
        let res = async { 42 }.with_cancel(token.cancelled()).await;
        assert_eq!(res, Some(42));
    }

    #[tokio::test]
    async fn cancelled_token_wins_immediately() {
        let token = CancellationToken::new();
        token.cancel();
        let res = async { 42 }.with_cancel(token.cancelled()).await;
        assert_eq!(res, None);
    }

    #[tokio::test]
    async fn cancellation_interrupts_pending_work() {
        let token = CancellationToken::new();
        let child = token.child_token();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            token.cancel();
        });
        let res = tokio::time::sleep(Duration::from_secs(30))
            .with_cancel(child.cancelled())
            .await;
        assert!(res.is_none());
    }
}
