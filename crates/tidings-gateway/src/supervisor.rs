use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures_util::FutureExt;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info, warn};

use crate::error::{GatewayError, Result};

/// Owns every background task the broker starts and the global shutdown
/// token they all derive their cancellation from.
#[derive(Clone, Default)]
pub struct Supervisor {
    inner: Arc<SupervisorInner>,
}

#[derive(Default)]
struct SupervisorInner {
    tracker: TaskTracker,
    shutdown: CancellationToken,
    spawned: AtomicU64,
    panicked: AtomicU64,
}

impl Supervisor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shutdown_token(&self) -> &CancellationToken {
        &self.inner.shutdown
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    /// Runs `fut` as a tracked task. A panic is logged and turns the
    /// task's output into `None`; it never reaches the runtime.
    pub fn spawn<F, T>(&self, name: &'static str, fut: F) -> JoinHandle<Option<T>>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        self.inner.spawned.fetch_add(1, Ordering::Relaxed);
        let inner = self.inner.clone();
        self.inner.tracker.spawn(async move {
            match AssertUnwindSafe(fut).catch_unwind().await {
                Ok(out) => Some(out),
                Err(panic) => {
                    inner.panicked.fetch_add(1, Ordering::Relaxed);
                    error!(task = name, panic = %panic_message(panic.as_ref()), "background task panicked");
                    None
                }
            }
        })
    }

    pub fn spawned(&self) -> u64 {
        self.inner.spawned.load(Ordering::Relaxed)
    }

    pub fn panicked(&self) -> u64 {
        self.inner.panicked.load(Ordering::Relaxed)
    }

    pub fn running(&self) -> usize {
        self.inner.tracker.len()
    }

    /// Cancels the shutdown token and waits for tracked tasks to finish.
    pub async fn shutdown(&self, timeout: Duration) -> Result<()> {
        self.inner.shutdown.cancel();
        self.inner.tracker.close();

        if tokio::time::timeout(timeout, self.inner.tracker.wait())
            .await
            .is_err()
        {
            let running = self.inner.tracker.len();
            warn!(running, "shutdown timed out with tasks still running");
            return Err(GatewayError::ShutdownTimeout(running));
        }

        info!(spawned = self.spawned(), panicked = self.panicked(), "background tasks drained");
        Ok(())
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&'static str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s
    } else {
        "non-string panic payload"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn spawn_returns_output() {
        let supervisor = Supervisor::new();
        let out = supervisor.spawn("answer", async { 42 }).await.unwrap();
        assert_eq!(out, Some(42));
        assert_eq!(supervisor.spawned(), 1);
        assert_eq!(supervisor.panicked(), 0);
    }

    #[tokio::test]
    async fn panics_are_contained() {
        let supervisor = Supervisor::new();
        let out = supervisor
            .spawn::<_, ()>("boom", async { panic!("boom") })
            .await
            .unwrap();
        assert_eq!(out, None);
        assert_eq!(supervisor.panicked(), 1);

        // The supervisor keeps working afterwards.
        assert_eq!(supervisor.spawn("after", async { 1 }).await.unwrap(), Some(1));
    }

    #[tokio::test]
    async fn shutdown_waits_for_cooperative_tasks() {
        let supervisor = Supervisor::new();
        let token = supervisor.shutdown_token().clone();
        supervisor.spawn("waiter", async move { token.cancelled().await });

        supervisor.shutdown(Duration::from_secs(1)).await.unwrap();
        assert_eq!(supervisor.running(), 0);
        assert!(supervisor.is_shutting_down());
    }

    #[tokio::test]
    async fn shutdown_reports_stragglers() {
        let supervisor = Supervisor::new();
        supervisor.spawn("stubborn", std::future::pending::<()>());

        let err = supervisor
            .shutdown(Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::ShutdownTimeout(1)));
    }

    #[test]
    fn panic_payloads_are_readable() {
        let owned: Box<dyn Any + Send> = Box::new(String::from("owned"));
        assert_eq!(panic_message(owned.as_ref()), "owned");
        let fixed: Box<dyn Any + Send> = Box::new("fixed");
        assert_eq!(panic_message(fixed.as_ref()), "fixed");
    }
}
