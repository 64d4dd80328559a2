//! Routing and retry policy of the dispatcher.
//!
//! A request bearing an empty node id, or the local node's own id, is
//! executed against local collaborators; everything else is forwarded
//! over the target's register-node stream. A forwarded call that fails
//! `Unavailable` is retried up to three times with a ten second gap; the
//! wait is interruptible by shutdown. No other kind is retried.

use std::time::Duration;

use tracing::warn;

use edgeiam_common::{IamError, Result};

use crate::shutdown::Shutdown;

/// Timeout of query operations and pause/resume.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// Timeout of the provisioning family (start/finish/deprovision).
pub const PROVISIONING_TIMEOUT: Duration = Duration::from_secs(300);

/// Maximum attempts of one forwarded request.
pub const REQUEST_RETRY_MAX: usize = 3;

/// Gap between forwarded-request attempts.
pub const REQUEST_RETRY_DELAY: Duration = Duration::from_secs(10);

/// Whether `node_id` targets the local node. An empty id means self.
pub fn is_local(node_id: &str, self_id: &str) -> bool {
    node_id.is_empty() || node_id == self_id
}

/// Runs `attempt` up to [`REQUEST_RETRY_MAX`] times.
///
/// Each attempt re-resolves the stream handle inside the closure, so a
/// node that reconnects between attempts is picked up. Aborted instantly
/// by shutdown with `WrongState`.
pub async fn forward_with_retry<F, Fut, T>(shutdown: &Shutdown, mut attempt: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let mut last = IamError::unavailable("no attempt was made");

    for try_index in 0..REQUEST_RETRY_MAX {
        if shutdown.is_triggered() {
            return Err(IamError::wrong_state("handler is closed"));
        }

        match attempt().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_retryable() => {
                warn!(attempt = try_index + 1, error = %err, "forwarded request failed");
                last = err;
            }
            Err(err) => return Err(err),
        }

        if try_index + 1 < REQUEST_RETRY_MAX {
            tokio::select! {
                _ = tokio::time::sleep(REQUEST_RETRY_DELAY) => {}
                _ = shutdown.wait() => {
                    return Err(IamError::wrong_state("handler is closed"));
                }
            }
        }
    }

    Err(last)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_is_local() {
        assert!(is_local("", "main"));
        assert!(is_local("main", "main"));
        assert!(!is_local("node0", "main"));
    }

    #[tokio::test]
    async fn test_first_success_returns_without_retry() {
        let shutdown = Shutdown::new();
        let calls = Arc::new(AtomicUsize::new(0));

        let counted = calls.clone();
        let value = forward_with_retry(&shutdown, move || {
            let counted = counted.clone();
            async move {
                counted.fetch_add(1, Ordering::SeqCst);
                Ok(42)
            }
        })
        .await
        .unwrap();

        assert_eq!(value, 42);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unavailable_retries_up_to_three_times() {
        let shutdown = Shutdown::new();
        let calls = Arc::new(AtomicUsize::new(0));

        let counted = calls.clone();
        let err = forward_with_retry(&shutdown, move || {
            let counted = counted.clone();
            async move {
                counted.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(IamError::unavailable("stream is closed"))
            }
        })
        .await
        .unwrap_err();

        assert_eq!(err.kind(), edgeiam_common::ErrorKind::Unavailable);
        assert_eq!(calls.load(Ordering::SeqCst), REQUEST_RETRY_MAX);
    }

    #[tokio::test]
    async fn test_non_retryable_error_returns_immediately() {
        let shutdown = Shutdown::new();
        let calls = Arc::new(AtomicUsize::new(0));

        let counted = calls.clone();
        let err = forward_with_retry(&shutdown, move || {
            let counted = counted.clone();
            async move {
                counted.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(IamError::timed_out("response timeout"))
            }
        })
        .await
        .unwrap_err();

        assert_eq!(err.kind(), edgeiam_common::ErrorKind::TimedOut);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_recovery_on_second_attempt() {
        let shutdown = Shutdown::new();
        let calls = Arc::new(AtomicUsize::new(0));

        let counted = calls.clone();
        let fut = forward_with_retry(&shutdown, move || {
            let counted = counted.clone();
            async move {
                if counted.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(IamError::unavailable("stream is closed"))
                } else {
                    Ok("ok")
                }
            }
        });

        // The retry gap is real time; pause the clock around it.
        tokio::time::pause();
        let value = fut.await.unwrap();
        assert_eq!(value, "ok");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_shutdown_aborts_retry_wait() {
        let shutdown = Shutdown::new();
        let aborter = shutdown.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            aborter.trigger();
        });

        let started = std::time::Instant::now();
        let err = forward_with_retry(&shutdown, || async {
            Err::<(), _>(IamError::unavailable("stream is closed"))
        })
        .await
        .unwrap_err();

        assert_eq!(err.kind(), edgeiam_common::ErrorKind::WrongState);
        assert!(started.elapsed() < REQUEST_RETRY_DELAY);
    }

    #[tokio::test]
    async fn test_shutdown_before_first_attempt() {
        let shutdown = Shutdown::new();
        shutdown.trigger();

        let err = forward_with_retry(&shutdown, || async { Ok(1) }).await.unwrap_err();
        assert_eq!(err.kind(), edgeiam_common::ErrorKind::WrongState);
    }
}
