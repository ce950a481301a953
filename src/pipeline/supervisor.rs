//! Restart loop for long-running pipeline tasks
//!
//! A supervised task that returns a transient error or panics is restarted
//! after an exponentially growing delay. Fatal errors are handed back to the
//! caller; a clean return or shutdown ends supervision.

use super::metrics::TaskMetrics;
use crate::error::PipelineError;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

/// An attempt that ran at least this long resets the backoff.
const HEALTHY_RUN: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
#[error("Maximum retry attempts exceeded")]
pub struct MaxRetriesExceeded;

#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    initial_delay: Duration,
    max_delay: Duration,
    /// `None` retries forever.
    max_retries: Option<u32>,
    current_attempt: u32,
}

impl ExponentialBackoff {
    pub fn new(initial: Duration, max: Duration, max_retries: Option<u32>) -> Self {
        Self {
            initial_delay: initial,
            max_delay: max,
            max_retries,
            current_attempt: 0,
        }
    }

    /// Delay before the next attempt: `initial * 2^attempt`, capped at `max`.
    pub fn next_delay(&self) -> Duration {
        let factor = 2u32.saturating_pow(self.current_attempt.min(31));
        self.initial_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    pub fn attempts(&self) -> u32 {
        self.current_attempt
    }

    pub async fn sleep(&mut self) -> Result<(), MaxRetriesExceeded> {
        if let Some(max) = self.max_retries {
            if self.current_attempt >= max {
                return Err(MaxRetriesExceeded);
            }
        }

        let delay = self.next_delay();
        match self.max_retries {
            Some(max) => log::warn!(
                "⏳ Retry attempt {} of {} in {:?}",
                self.current_attempt + 1,
                max,
                delay
            ),
            None => log::warn!("⏳ Retry attempt {} in {:?}", self.current_attempt + 1, delay),
        }

        sleep(delay).await;
        self.current_attempt += 1;
        Ok(())
    }

    pub fn reset(&mut self) {
        self.current_attempt = 0;
    }
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self::new(Duration::from_millis(500), Duration::from_secs(30), None)
    }
}

/// Aborts the wrapped task when dropped, so cancelling the supervisor also
/// stops the attempt it is waiting on.
struct AbortOnDrop<T>(JoinHandle<T>);

impl<T> Drop for AbortOnDrop<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Runs `make_task()` until it ends cleanly, fails fatally, or `shutdown` fires.
pub async fn supervise<F, Fut>(
    name: &'static str,
    shutdown: CancellationToken,
    mut backoff: ExponentialBackoff,
    metrics: Arc<TaskMetrics>,
    mut make_task: F,
) -> Result<(), PipelineError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<(), PipelineError>> + Send + 'static,
{
    loop {
        let started = Instant::now();
        let mut attempt = AbortOnDrop(tokio::spawn(make_task()));

        match (&mut attempt.0).await {
            Ok(Ok(())) => {
                log::info!("✅ {} stopped", name);
                return Ok(());
            }
            Ok(Err(e)) if e.is_fatal() => {
                log::error!("❌ {} failed fatally: {}", name, e);
                return Err(e);
            }
            Ok(Err(e)) => {
                log::warn!("⚠️  {} failed: {}", name, e);
            }
            Err(join_error) if join_error.is_panic() => {
                log::error!("💥 {} panicked", name);
            }
            Err(_) => {
                log::info!("{} was cancelled", name);
                return Ok(());
            }
        }

        if shutdown.is_cancelled() {
            return Ok(());
        }
        if started.elapsed() >= HEALTHY_RUN {
            backoff.reset();
        }

        metrics.record_restart();
        tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            slept = backoff.sleep() => {
                if slept.is_err() {
                    log::error!("❌ {} exhausted its restart budget", name);
                    return Err(PipelineError::RetriesExhausted(name));
                }
                log::info!("🔄 Restarting {}", name);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StoreError;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_backoff(max_retries: Option<u32>) -> ExponentialBackoff {
        ExponentialBackoff::new(Duration::from_millis(1), Duration::from_millis(5), max_retries)
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let mut backoff =
            ExponentialBackoff::new(Duration::from_millis(100), Duration::from_secs(1), None);
        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
        backoff.current_attempt = 3;
        assert_eq!(backoff.next_delay(), Duration::from_millis(800));
        backoff.current_attempt = 4;
        assert_eq!(backoff.next_delay(), Duration::from_secs(1));
        backoff.current_attempt = 40;
        assert_eq!(backoff.next_delay(), Duration::from_secs(1));
        backoff.reset();
        assert_eq!(backoff.attempts(), 0);
    }

    #[tokio::test]
    async fn test_backoff_max_retries() {
        let mut backoff = fast_backoff(Some(2));
        assert!(backoff.sleep().await.is_ok());
        assert!(backoff.sleep().await.is_ok());
        assert!(backoff.sleep().await.is_err());
    }

    #[tokio::test]
    async fn test_restarts_after_transient_errors_and_panics() {
        let calls = Arc::new(AtomicU32::new(0));
        let metrics = Arc::new(TaskMetrics::default());

        let counter = calls.clone();
        let result = supervise(
            "flaky",
            CancellationToken::new(),
            fast_backoff(None),
            metrics.clone(),
            move || {
                let attempt = counter.fetch_add(1, Ordering::SeqCst);
                async move {
                    match attempt {
                        0 => Err(PipelineError::Store(StoreError::DeadlineExceeded(
                            Duration::from_millis(1),
                        ))),
                        1 => panic!("boom"),
                        _ => Ok(()),
                    }
                }
            },
        )
        .await;

        assert!(result.is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(metrics.restarts(), 2);
    }

    #[tokio::test]
    async fn test_fatal_error_is_returned() {
        let result = supervise(
            "fatal",
            CancellationToken::new(),
            fast_backoff(None),
            Arc::new(TaskMetrics::default()),
            || async { Err(PipelineError::FatalConfiguration("bad".into())) },
        )
        .await;
        assert!(matches!(result, Err(PipelineError::FatalConfiguration(_))));
    }

    #[tokio::test]
    async fn test_retry_budget_exhausted() {
        let result = supervise(
            "doomed",
            CancellationToken::new(),
            fast_backoff(Some(1)),
            Arc::new(TaskMetrics::default()),
            || async {
                Err(PipelineError::BatchNotCommitted {
                    next_offset: 0,
                    failed: 1,
                })
            },
        )
        .await;
        assert!(matches!(result, Err(PipelineError::RetriesExhausted("doomed"))));
    }

    #[tokio::test]
    async fn test_shutdown_stops_supervision() {
        let shutdown = CancellationToken::new();
        let token = shutdown.clone();
        let handle = tokio::spawn(supervise(
            "forever",
            shutdown.clone(),
            fast_backoff(None),
            Arc::new(TaskMetrics::default()),
            move || {
                let token = token.clone();
                async move {
                    token.cancelled().await;
                    Ok(())
                }
            },
        ));

        shutdown.cancel();
        let result = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_ok());
    }
}
