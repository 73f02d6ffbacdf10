use futures_util::future::BoxFuture;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

// ============================================================================
// Fixed-Delay Scheduler
// ============================================================================
//
// Each registered task runs on its own tokio task: run, wait `interval`,
// repeat. A run is never interrupted; shutdown is observed between runs, so
// `shutdown` returns only after every in-flight run has finished.
//
// ============================================================================

type TaskFn = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

struct ScheduledTask {
    name: String,
    interval: Duration,
    run: TaskFn,
}

pub struct Scheduler {
    pending: Vec<ScheduledTask>,
    handles: Vec<JoinHandle<()>>,
    shutdown_tx: watch::Sender<bool>,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler {
    pub fn new() -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            pending: Vec::new(),
            handles: Vec::new(),
            shutdown_tx,
        }
    }

    /// Register `task` to run every `interval` after the previous run ends
    pub fn every<F, Fut>(&mut self, name: impl Into<String>, interval: Duration, task: F) -> &mut Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let run: TaskFn = Arc::new(move || Box::pin(task()));
        self.pending.push(ScheduledTask {
            name: name.into(),
            interval,
            run,
        });
        self
    }

    /// Spawn every task registered so far
    pub fn start(&mut self) {
        for task in std::mem::take(&mut self.pending) {
            let mut shutdown_rx = self.shutdown_tx.subscribe();
            tracing::info!(task = %task.name, interval_ms = task.interval.as_millis() as u64, "Starting scheduled task");

            self.handles.push(tokio::spawn(async move {
                loop {
                    if *shutdown_rx.borrow() {
                        break;
                    }

                    (task.run)().await;

                    tokio::select! {
                        changed = shutdown_rx.changed() => {
                            if changed.is_err() || *shutdown_rx.borrow() {
                                break;
                            }
                        }
                        _ = tokio::time::sleep(task.interval) => {}
                    }
                }
                tracing::info!(task = %task.name, "Scheduled task stopped");
            }));
        }
    }

    pub fn running(&self) -> usize {
        self.handles.len()
    }

    /// Stop scheduling new runs and wait for in-flight ones to finish
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);

        for handle in self.handles {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "Scheduled task ended abnormally");
            }
        }
    }
}
