//! Detached background work.
//!
//! Units scheduled here outlive the request that spawned them. A unit that
//! fails or panics is logged and counted; nothing reaches its caller.

use std::any::Any;
use std::fmt::Display;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures::FutureExt;
use tokio_util::task::TaskTracker;

/// Outcome of [`TaskRunner::shutdown`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Units still running when the deadline elapsed.
    pub pending: usize,
}

impl ShutdownReport {
    pub fn drained(&self) -> bool {
        self.pending == 0
    }
}

/// Fire-and-forget task spawner with a drain barrier.
#[derive(Clone, Default)]
pub struct TaskRunner {
    tracker: TaskTracker,
    failures: Arc<AtomicU64>,
}

impl TaskRunner {
    /// Create a new [`TaskRunner`].
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedule `unit` without waiting for it.
    ///
    /// `Err` results and panics are recorded under `task`.
    pub fn run<F, E>(&self, task: &'static str, unit: F)
    where
        F: Future<Output = Result<(), E>> + Send + 'static,
        E: Display + Send + 'static,
    {
        let failures = Arc::clone(&self.failures);

        self.tracker.spawn(async move {
            let outcome = match AssertUnwindSafe(unit).catch_unwind().await {
                Ok(Ok(())) => {
                    tracing::debug!(task, "background task completed");
                    "success"
                },
                Ok(Err(err)) => {
                    failures.fetch_add(1, Ordering::Relaxed);
                    tracing::error!(task, error = %err, "background task failed");
                    "failure"
                },
                Err(payload) => {
                    failures.fetch_add(1, Ordering::Relaxed);
                    tracing::error!(
                        task,
                        panic = panic_message(payload.as_ref()),
                        "background task panicked"
                    );
                    "panic"
                },
            };

            metrics::counter!("background_tasks_total", "task" => task, "outcome" => outcome)
                .increment(1);
        });
    }

    /// Units currently in flight.
    pub fn in_flight(&self) -> usize {
        self.tracker.len()
    }

    /// Units that returned an error or panicked since start.
    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    /// Close the runner and wait for in-flight units, at most `deadline`.
    ///
    /// Units scheduled after this call are still tracked and awaited.
    pub async fn shutdown(&self, deadline: Duration) -> ShutdownReport {
        self.tracker.close();

        let pending = match tokio::time::timeout(deadline, self.tracker.wait()).await {
            Ok(()) => 0,
            Err(_) => self.tracker.len(),
        };

        if pending == 0 {
            tracing::info!("background tasks drained");
        } else {
            tracing::warn!(pending, ?deadline, "background tasks left undrained");
        }

        ShutdownReport { pending }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(msg) = payload.downcast_ref::<&'static str>() {
        msg
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.as_str()
    } else {
        "unknown panic payload"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test]
    async fn test_caller_does_not_wait() {
        let runner = TaskRunner::new();
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();

        runner.run("blocked", async move {
            let _ = rx.await;
            Ok::<_, std::convert::Infallible>(())
        });

        // `run` returned while the unit is still parked.
        assert_eq!(runner.in_flight(), 1);
        tx.send(()).unwrap();
        assert!(runner.shutdown(Duration::from_secs(5)).await.drained());
    }

    fn runner_should_panic() -> bool {
        true
    }

    #[tokio::test]
    async fn test_failures_are_isolated() {
        let runner = TaskRunner::new();

        runner.run("error", async { Err::<(), _>("transport is down") });
        runner.run("panic", async {
            if runner_should_panic() {
                panic!("boom");
            }
            Ok::<(), String>(())
        });

        let report = runner.shutdown(Duration::from_secs(5)).await;
        assert!(report.drained());
        assert_eq!(runner.failures(), 2);
    }

    #[tokio::test]
    async fn test_shutdown_drains_all_units() {
        let runner = TaskRunner::new();
        let done = Arc::new(AtomicUsize::new(0));

        for i in 0..16 {
            let done = Arc::clone(&done);
            runner.run("count", async move {
                tokio::time::sleep(Duration::from_millis(i * 5)).await;
                done.fetch_add(1, Ordering::SeqCst);
                Ok::<_, String>(())
            });
        }

        let report = runner.shutdown(Duration::from_secs(5)).await;
        assert!(report.drained());
        assert_eq!(done.load(Ordering::SeqCst), 16);
        assert_eq!(runner.failures(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_reports_undrained_units() {
        let runner = TaskRunner::new();

        runner.run("quick", async { Ok::<_, String>(()) });
        for _ in 0..3 {
            runner.run("stuck", async {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok::<_, String>(())
            });
        }

        let report = runner.shutdown(Duration::from_millis(50)).await;
        assert_eq!(report, ShutdownReport { pending: 3 });
        assert!(!report.drained());
    }
}
