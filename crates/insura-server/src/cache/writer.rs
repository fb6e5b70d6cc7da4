//! Bounded runner for best-effort background cache work.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};

/// Runs detached cache writes with a concurrency cap and a per-task timeout.
///
/// Work is dropped (and logged) when the cap is reached; it is never queued.
/// Tasks are not tied to the request that submitted them.
#[derive(Debug, Clone)]
pub struct BackgroundWriter {
    permits: Arc<Semaphore>,
    tracker: TaskTracker,
    timeout: Duration,
    closed: Arc<AtomicBool>,
}

impl BackgroundWriter {
    pub fn new(max_inflight: usize, timeout: Duration) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(max_inflight.max(1))),
            tracker: TaskTracker::new(),
            timeout,
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Submit `work`. Returns `false` if it was dropped.
    pub fn submit<F>(&self, task: &'static str, work: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.closed.load(Ordering::Acquire) {
            debug!(task, "background writer closed, dropping work");
            return false;
        }
        let permit = match Arc::clone(&self.permits).try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                warn!(task, "background writer saturated, dropping work");
                return false;
            }
        };
        let timeout = self.timeout;
        self.tracker.spawn(async move {
            let _permit = permit;
            if tokio::time::timeout(timeout, work).await.is_err() {
                warn!(
                    task,
                    timeout_ms = timeout.as_millis() as u64,
                    "background cache write timed out"
                );
            }
        });
        true
    }

    /// Number of tasks still running.
    pub fn in_flight(&self) -> usize {
        self.tracker.len()
    }

    /// Wait until every task submitted so far has finished.
    pub async fn flush(&self) {
        self.tracker.close();
        self.tracker.wait().await;
        if !self.closed.load(Ordering::Acquire) {
            self.tracker.reopen();
        }
    }

    /// Refuse new work and wait for running tasks to drain.
    pub async fn shutdown(&self) {
        self.closed.store(true, Ordering::Release);
        self.tracker.close();
        self.tracker.wait().await;
        debug!("background writer drained");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test]
    async fn test_runs_submitted_work() {
        let writer = BackgroundWriter::new(4, Duration::from_secs(1));
        let done = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let done = Arc::clone(&done);
            assert!(writer.submit("test", async move {
                done.fetch_add(1, Ordering::SeqCst);
            }));
        }
        writer.flush().await;
        assert_eq!(done.load(Ordering::SeqCst), 3);
        assert_eq!(writer.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_drops_work_when_saturated() {
        let writer = BackgroundWriter::new(1, Duration::from_secs(1));
        assert!(writer.submit("slow", async {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }));
        assert!(!writer.submit("dropped", async {}));
        writer.flush().await;
        assert!(writer.submit("after", async {}));
    }

    #[tokio::test]
    async fn test_times_out_slow_work() {
        let writer = BackgroundWriter::new(1, Duration::from_millis(20));
        let finished = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&finished);
        writer.submit("hang", async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
            flag.store(true, Ordering::SeqCst);
        });
        writer.flush().await;
        assert!(!finished.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_shutdown_refuses_new_work() {
        let writer = BackgroundWriter::new(2, Duration::from_secs(1));
        writer.shutdown().await;
        assert!(!writer.submit("late", async {}));
    }
}
