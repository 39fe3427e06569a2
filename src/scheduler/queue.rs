use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error};

/// Unit of queued work
pub type Job = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// FIFO of jobs executed strictly one at a time.
///
/// Enqueue never blocks or rejects. A single worker task drains the queue;
/// each job runs on its own task so a panic is contained to that job.
pub struct JobQueue {
    tx: mpsc::UnboundedSender<Job>,
    outstanding: Arc<AtomicUsize>,
    idle: Arc<Notify>,
    worker: JoinHandle<()>,
}

impl JobQueue {
    /// Must be called inside a Tokio runtime.
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let outstanding = Arc::new(AtomicUsize::new(0));
        let idle = Arc::new(Notify::new());

        let worker = tokio::spawn(Self::drain(rx, Arc::clone(&outstanding), Arc::clone(&idle)));

        Self {
            tx,
            outstanding,
            idle,
            worker,
        }
    }

    async fn drain(
        mut rx: mpsc::UnboundedReceiver<Job>,
        outstanding: Arc<AtomicUsize>,
        idle: Arc<Notify>,
    ) {
        while let Some(job) = rx.recv().await {
            if let Err(e) = tokio::spawn(job).await {
                error!("Queued job panicked: {}", e);
            }

            if outstanding.fetch_sub(1, Ordering::SeqCst) == 1 {
                idle.notify_waiters();
            }
        }
        debug!("Job queue closed");
    }

    pub fn enqueue<F>(&self, job: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.outstanding.fetch_add(1, Ordering::SeqCst);
        if self.tx.send(Box::pin(job)).is_err() {
            self.outstanding.fetch_sub(1, Ordering::SeqCst);
            error!("Job queue worker is gone, dropping job");
        }
    }

    /// Jobs waiting plus the one in flight
    pub fn len(&self) -> usize {
        self.outstanding.load(Ordering::SeqCst)
    }

    pub fn is_idle(&self) -> bool {
        self.len() == 0
    }

    /// Resolves once nothing is queued or running.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.is_idle() {
                return;
            }
            notified.await;
        }
    }
}

impl Default for JobQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for JobQueue {
    fn drop(&mut self) {
        if !self.is_idle() {
            debug!("Dropping job queue with {} outstanding jobs", self.len());
        }
        self.worker.abort();
    }
}
