//! Periodic batch monitors.
//!
//! Each monitor exposes one "process a batch" entry point. The same entry
//! point runs on a timer through [`spawn_monitor`] and on demand from request
//! handlers and tests.

use crate::error::Result;
use crate::types::now_ms;
use async_trait::async_trait;
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

/// Outcome counters for one monitor cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchReport {
    /// Items examined
    pub processed: usize,
    /// Items whose state changed
    pub settled: usize,
    /// Items left for a later cycle (no price, lost a race, nothing due)
    pub skipped: usize,
    pub failed: usize,
}

#[async_trait]
pub trait Monitor: Send + Sync {
    fn name(&self) -> &'static str;

    /// Process every eligible item as of `now` (unix ms). Per-item errors are
    /// counted in the report, never returned.
    async fn process_batch_at(&self, now: i64) -> Result<BatchReport>;

    async fn process_batch(&self) -> Result<BatchReport> {
        self.process_batch_at(now_ms()).await
    }
}

/// Run `monitor` every `interval` until the task is aborted.
///
/// A cycle that overruns the interval delays the next tick instead of
/// bunching ticks up, so two cycles of one monitor never overlap.
pub fn spawn_monitor(monitor: Arc<dyn Monitor>, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!("Starting {} monitor every {:?}", monitor.name(), interval);
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            match monitor.process_batch().await {
                Ok(report) if report.settled > 0 || report.failed > 0 => {
                    info!("{} cycle: {:?}", monitor.name(), report);
                }
                Ok(report) => debug!("{} cycle: {:?}", monitor.name(), report),
                Err(e) => error!("{} cycle failed: {}", monitor.name(), e),
            }
        }
    })
}

/// Run `op` until it succeeds, fails with a non-transient error, or has been
/// attempted `max_attempts` times. Backoff grows linearly from `base_delay`.
pub async fn retry_transient<T, F, Fut>(
    what: &str,
    max_attempts: u32,
    base_delay: Duration,
    mut op: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 1;
    loop {
        match op().await {
            Err(e) if e.is_transient() && attempt < max_attempts => {
                warn!(
                    "{} hit a write conflict (attempt {}/{}): {}",
                    what, attempt, max_attempts, e
                );
                tokio::time::sleep(base_delay * attempt).await;
                attempt += 1;
            }
            other => return other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LedgerError;
    use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_retry_until_success() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result = retry_transient("op", 3, Duration::from_millis(1), || async move {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(LedgerError::TransientConflict("busy".to_string()))
            } else {
                Ok(7)
            }
        })
        .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_gives_up_after_budget() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result: Result<()> = retry_transient("op", 3, Duration::from_millis(1), || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(LedgerError::TransientConflict("busy".to_string()))
        })
        .await;
        assert!(result.unwrap_err().is_transient());
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_non_transient_is_not_retried() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result: Result<()> = retry_transient("op", 3, Duration::from_millis(1), || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(LedgerError::InvalidState("nope".to_string()))
        })
        .await;
        assert!(result.is_err());
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    struct Counting(AtomicUsize);

    #[async_trait]
    impl Monitor for Counting {
        fn name(&self) -> &'static str {
            "counting"
        }

        async fn process_batch_at(&self, _now: i64) -> Result<BatchReport> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(BatchReport::default())
        }
    }

    #[tokio::test]
    async fn test_spawned_monitor_runs_repeatedly() {
        let monitor = Arc::new(Counting(AtomicUsize::new(0)));
        let handle = spawn_monitor(monitor.clone(), Duration::from_millis(10));
        tokio::time::sleep(Duration::from_millis(60)).await;
        handle.abort();
        assert!(monitor.0.load(Ordering::SeqCst) >= 2);
    }
}
