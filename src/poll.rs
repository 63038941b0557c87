//! Polling and bounded retry on `tokio::time`.

use std::future::Future;
use std::time::Duration;

use tokio::time::{Instant, sleep};
use tracing::debug;

use crate::error::{CapupError, Result};

/// Poll `check` until it returns `true`, an error, or `timeout` elapses.
///
/// The first check runs immediately.
pub async fn wait_until<F, Fut>(
    operation: &str,
    interval: Duration,
    timeout: Duration,
    mut check: F,
) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool>>,
{
    let start = Instant::now();
    loop {
        if check().await? {
            return Ok(());
        }
        if start.elapsed() >= timeout {
            return Err(CapupError::Timeout {
                operation: operation.to_string(),
                details: format!("condition not met within {}s", timeout.as_secs()),
            });
        }
        debug!(operation = %operation, "Condition not met, polling again in {}s", interval.as_secs());
        sleep(interval).await;
    }
}

/// Run `op`, retrying transient failures every `interval` until `timeout`.
///
/// Non-transient errors are returned immediately. When the timeout expires
/// the last transient error is returned.
pub async fn retry_transient<F, Fut, T>(
    operation: &str,
    interval: Duration,
    timeout: Duration,
    mut op: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let start = Instant::now();
    let mut attempt = 1u32;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && start.elapsed() + interval <= timeout => {
                debug!(
                    operation = %operation,
                    attempt,
                    error = %e,
                    "Transient failure, retrying in {}s",
                    interval.as_secs()
                );
                attempt += 1;
                sleep(interval).await;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;
    use crate::error::ErrorKind;

    #[tokio::test(start_paused = true)]
    async fn test_wait_until_succeeds_after_polls() {
        let count = Arc::new(AtomicU32::new(0));
        let c = Arc::clone(&count);
        wait_until("test", Duration::from_secs(15), Duration::from_secs(300), move || {
            let c = Arc::clone(&c);
            async move { Ok(c.fetch_add(1, Ordering::SeqCst) >= 2) }
        })
        .await
        .unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_until_times_out() {
        let err = wait_until("control plane", Duration::from_secs(15), Duration::from_secs(60), || async {
            Ok(false)
        })
        .await
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert!(err.to_string().contains("control plane"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_until_propagates_check_error() {
        let err = wait_until("x", Duration::from_secs(1), Duration::from_secs(10), || async {
            Err::<bool, _>(CapupError::Precondition("failed".into()))
        })
        .await
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Precondition);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_transient_retries_until_success() {
        let count = Arc::new(AtomicU32::new(0));
        let c = Arc::clone(&count);
        let value = retry_transient("patch", Duration::from_secs(30), Duration::from_secs(300), move || {
            let c = Arc::clone(&c);
            async move {
                if c.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(CapupError::KubernetesApi("connection reset".into()))
                } else {
                    Ok(42)
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(value, 42);
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_transient_gives_up_after_timeout() {
        let count = Arc::new(AtomicU32::new(0));
        let c = Arc::clone(&count);
        let err = retry_transient("patch", Duration::from_secs(30), Duration::from_secs(290), move || {
            let c = Arc::clone(&c);
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(CapupError::KubernetesApi("still down".into()))
            }
        })
        .await
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ResourceAccess);
        // Attempts at 0s, 30s, ..., 270s.
        assert_eq!(count.load(Ordering::SeqCst), 10);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_transient_stops_on_permanent_error() {
        let count = Arc::new(AtomicU32::new(0));
        let c = Arc::clone(&count);
        let err = retry_transient("patch", Duration::from_secs(30), Duration::from_secs(300), move || {
            let c = Arc::clone(&c);
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(CapupError::not_found("KubeadmControlPlane", "default", "cp"))
            }
        })
        .await
        .unwrap_err();
        assert!(err.is_not_found());
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
