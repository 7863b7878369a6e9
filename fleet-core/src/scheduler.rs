//! Process-wide periodic scheduler.
//!
//! One scheduler per process drives every recurring control-loop tick
//! (monitor probes, history cleanup). Each task runs on its own tokio loop;
//! a task error is logged and the loop keeps ticking.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

type TaskFuture = Pin<Box<dyn Future<Output = Result<(), String>> + Send>>;
type TaskFactory = Arc<dyn Fn() -> TaskFuture + Send + Sync>;

pub struct Scheduler {
    shutdown_tx: watch::Sender<bool>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl Scheduler {
    pub fn new() -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            shutdown_tx,
            handles: Mutex::new(Vec::new()),
        }
    }

    /// Register a named task firing every `interval`. The first tick happens
    /// one full interval after registration.
    pub fn schedule<F, Fut>(&self, name: &str, interval: Duration, task: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), String>> + Send + 'static,
    {
        let name = name.to_string();
        let factory: TaskFactory = Arc::new(move || {
            let fut: TaskFuture = Box::pin(task());
            fut
        });
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The immediate first tick of tokio's interval would fire the
            // task at registration time; consume it.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        debug!("scheduler tick: {name}");
                        if let Err(e) = (factory)().await {
                            warn!("scheduled task {name} failed: {e}");
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            debug!("scheduler task {name} stopping");
                            break;
                        }
                    }
                }
            }
        });

        self.handles.lock().push(handle);
    }

    /// Stop all task loops and wait for them to finish.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        let handles: Vec<JoinHandle<()>> = self.handles.lock().drain(..).collect();
        for handle in handles {
            let _ = handle.await;
        }
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_task_fires_and_stops() {
        let scheduler = Scheduler::new();
        let count = Arc::new(AtomicUsize::new(0));
        let task_count = count.clone();

        scheduler.schedule("tick", Duration::from_millis(20), move || {
            let c = task_count.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });

        tokio::time::sleep(Duration::from_millis(110)).await;
        scheduler.shutdown().await;
        let fired = count.load(Ordering::SeqCst);
        assert!(fired >= 3, "expected several ticks, got {fired}");

        // No more ticks after shutdown.
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(count.load(Ordering::SeqCst), fired);
    }

    #[tokio::test]
    async fn test_task_error_does_not_kill_loop() {
        let scheduler = Scheduler::new();
        let count = Arc::new(AtomicUsize::new(0));
        let task_count = count.clone();

        scheduler.schedule("flaky", Duration::from_millis(15), move || {
            let c = task_count.clone();
            async move {
                let n = c.fetch_add(1, Ordering::SeqCst);
                if n == 0 {
                    Err("first tick fails".to_string())
                } else {
                    Ok(())
                }
            }
        });

        tokio::time::sleep(Duration::from_millis(80)).await;
        scheduler.shutdown().await;
        assert!(count.load(Ordering::SeqCst) >= 2);
    }
}
