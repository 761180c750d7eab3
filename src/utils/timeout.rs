//! Async timeout helpers

use crate::error::{PaymentError, Result};
use std::future::Future;
use std::time::Duration;

/// Per-packet deadline used when none is configured
pub const DEFAULT_PACKET_TIMEOUT: Duration = Duration::from_secs(30);

/// Pause before retrying after a temporary rejection
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Run `future`, failing with [`PaymentError::Timeout`] once `duration` elapses
pub async fn with_timeout<F, T>(duration: Duration, future: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(duration, future).await {
        Ok(result) => result,
        Err(_) => Err(PaymentError::Timeout),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_completes_within_deadline() {
        let value = with_timeout(Duration::from_secs(1), async { Ok(7) }).await;
        assert!(matches!(value, Ok(7)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_elapsed_deadline_is_timeout() {
        let result: Result<()> = with_timeout(Duration::from_millis(10), async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;
        assert!(matches!(result, Err(PaymentError::Timeout)));
    }
}
