//! Bounded work queues with a fixed worker pool.
//!
//! Submission never blocks: a full queue is reported as
//! [`SubmitError::QueueFull`] so the producer can back off and resend.
//! Each task runs on its own spawned task, so a panic is logged and the
//! worker keeps consuming.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use tokio::sync::{Mutex, Notify, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error};

use crate::config::QueueConfig;
use crate::error::SubmitError;

pub type BoxFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

struct Shared {
    name: &'static str,
    pending: AtomicUsize,
    closed: AtomicBool,
    idle: Notify,
}

impl Shared {
    fn finish(&self) {
        if self.pending.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.idle.notify_waiters();
        }
    }
}

pub struct WorkQueue {
    tx: mpsc::Sender<BoxFuture>,
    shared: Arc<Shared>,
    stop_tx: watch::Sender<bool>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkQueue {
    /// Start `config.workers` workers over a channel of `config.capacity`.
    ///
    /// Must be called inside a tokio runtime.
    pub fn new(name: &'static str, config: QueueConfig) -> Self {
        let (tx, rx) = mpsc::channel(config.capacity.max(1));
        let (stop_tx, stop_rx) = watch::channel(false);
        let rx = Arc::new(Mutex::new(rx));
        let shared = Arc::new(Shared {
            name,
            pending: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
            idle: Notify::new(),
        });

        let workers = (0..config.workers.max(1))
            .map(|worker| {
                let rx = rx.clone();
                let shared = shared.clone();
                let stop_rx = stop_rx.clone();
                tokio::spawn(run_worker(worker, rx, shared, stop_rx))
            })
            .collect();

        debug!(queue = name, workers = config.workers, capacity = config.capacity, "work queue started");
        Self {
            tx,
            shared,
            stop_tx,
            workers: Mutex::new(workers),
        }
    }

    pub fn name(&self) -> &'static str {
        self.shared.name
    }

    /// Tasks submitted and not yet finished.
    pub fn pending(&self) -> usize {
        self.shared.pending.load(Ordering::SeqCst)
    }

    /// Queue a task without waiting.
    pub fn submit<F>(&self, task: F) -> Result<(), SubmitError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.shared.pending.fetch_add(1, Ordering::SeqCst);
        if self.shared.closed.load(Ordering::SeqCst) {
            self.shared.finish();
            return Err(SubmitError::Closed(self.shared.name));
        }
        match self.tx.try_send(Box::pin(task)) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.shared.finish();
                Err(SubmitError::QueueFull(self.shared.name))
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.shared.finish();
                Err(SubmitError::Closed(self.shared.name))
            }
        }
    }

    /// Wait until every submitted task has finished.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.shared.idle.notified();
            if self.shared.pending.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Refuse new tasks, let queued ones finish, then stop the workers.
    pub async fn shutdown(&self) {
        self.shared.closed.store(true, Ordering::SeqCst);
        self.wait_idle().await;
        let _ = self.stop_tx.send(true);
        let mut workers = self.workers.lock().await;
        for handle in workers.drain(..) {
            let _ = handle.await;
        }
        debug!(queue = self.shared.name, "work queue stopped");
    }
}

async fn run_worker(
    worker: usize,
    rx: Arc<Mutex<mpsc::Receiver<BoxFuture>>>,
    shared: Arc<Shared>,
    mut stop_rx: watch::Receiver<bool>,
) {
    loop {
        let task = {
            let mut rx = rx.lock().await;
            tokio::select! {
                biased;
                task = rx.recv() => task,
                _ = stop_rx.changed() => None,
            }
        };
        let Some(task) = task else {
            break;
        };
        if let Err(e) = tokio::spawn(task).await {
            error!(queue = shared.name, worker, error = %e, "task failed");
        }
        shared.finish();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;

    fn config(workers: usize, capacity: usize) -> QueueConfig {
        QueueConfig { workers, capacity }
    }

    #[tokio::test]
    async fn runs_submitted_tasks() {
        let queue = WorkQueue::new("test", config(2, 16));
        let counter = Arc::new(AtomicU32::new(0));
        for _ in 0..10 {
            let counter = counter.clone();
            queue
                .submit(async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                })
                .unwrap();
        }
        queue.wait_idle().await;
        assert_eq!(counter.load(Ordering::SeqCst), 10);
        assert_eq!(queue.pending(), 0);
    }

    #[tokio::test]
    async fn full_queue_rejects_without_blocking() {
        let queue = WorkQueue::new("test", config(1, 1));
        let gate = Arc::new(Notify::new());

        // Occupy the only worker, then fill the one buffered slot.
        let (started_tx, started_rx) = tokio::sync::oneshot::channel();
        let g = gate.clone();
        queue
            .submit(async move {
                let _ = started_tx.send(());
                g.notified().await;
            })
            .unwrap();
        started_rx.await.unwrap();
        queue.submit(async {}).unwrap();

        assert_eq!(queue.submit(async {}), Err(SubmitError::QueueFull("test")));
        gate.notify_one();
        queue.wait_idle().await;
    }

    #[tokio::test]
    async fn panicking_task_does_not_kill_worker() {
        let queue = WorkQueue::new("test", config(1, 4));
        queue.submit(async { panic!("boom"); }).unwrap();
        let done = Arc::new(AtomicBool::new(false));
        let d = done.clone();
        queue
            .submit(async move {
                d.store(true, Ordering::SeqCst);
            })
            .unwrap();
        queue.wait_idle().await;
        assert!(done.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn shutdown_drains_then_closes() {
        let queue = WorkQueue::new("test", config(1, 4));
        let counter = Arc::new(AtomicU32::new(0));
        for _ in 0..3 {
            let counter = counter.clone();
            queue
                .submit(async move {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    counter.fetch_add(1, Ordering::SeqCst);
                })
                .unwrap();
        }
        queue.shutdown().await;
        assert_eq!(counter.load(Ordering::SeqCst), 3);
        assert_eq!(queue.submit(async {}), Err(SubmitError::Closed("test")));
    }
}
