//! Races a future against a timer and surfaces a distinct `TimedOut` failure
//! (spec §4.8).

use std::future::Future;
use std::time::Duration;

use crate::error::{Error, Result};

/// Runs `fut` to completion, or fails with [`Error::TimedOut`] if `duration`
/// elapses first.
///
/// Cancellation on timeout is handled by `tokio::time::timeout` itself: it
/// drops `fut` when the timer wins, and dropping an in-flight tokio I/O
/// future cancels the underlying read/write so no waiter is left registered
/// on the socket.
pub async fn with_timeout<F, T>(fut: F, duration: Duration) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(duration, fut).await {
        Ok(result) => result,
        Err(_elapsed) => Err(Error::TimedOut),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn ready_future_completes_before_timeout() {
        let result = with_timeout(async { Ok(42) }, Duration::from_millis(50)).await;
        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test]
    async fn slow_future_times_out() {
        let result = with_timeout(
            async {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok(())
            },
            Duration::from_millis(10),
        )
        .await;
        assert!(matches!(result, Err(Error::TimedOut)));
    }

    #[tokio::test]
    async fn inner_error_propagates_unchanged() {
        let result: Result<()> = with_timeout(
            async { Err(Error::Malformed("boom".into())) },
            Duration::from_millis(50),
        )
        .await;
        assert!(matches!(result, Err(Error::Malformed(_))));
    }
}
