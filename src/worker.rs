//! Bounded FIFO admission in front of the shared browser
//!
//! A fixed set of workers pulls jobs off one shared channel, so at most
//! `capacity` jobs run at once and the rest start in submission order.

use crate::{MeasureError, Metrics};
use futures::future::{BoxFuture, FutureExt};
use serde::Serialize;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// A submitted job. Resolves to whether it succeeded, for worker accounting.
type QueuedJob = Box<dyn FnOnce() -> BoxFuture<'static, bool> + Send>;

pub struct AdmissionWorker {
    id: usize,
    is_running: AtomicBool,
    busy_since: StdMutex<Option<Instant>>,
    processed_count: AtomicUsize,
    error_count: AtomicUsize,
}

impl AdmissionWorker {
    fn new(id: usize) -> Self {
        Self {
            id,
            is_running: AtomicBool::new(false),
            busy_since: StdMutex::new(None),
            processed_count: AtomicUsize::new(0),
            error_count: AtomicUsize::new(0),
        }
    }

    async fn run(self: Arc<Self>, shared: Arc<QueueShared>) {
        debug!("Starting admission worker {}", self.id);
        self.is_running.store(true, Ordering::Relaxed);

        loop {
            let job = {
                let mut receiver = shared.receiver.lock().await;
                receiver.recv().await
            };
            let Some(job) = job else { break };

            shared.waiting.fetch_sub(1, Ordering::SeqCst);
            if shared.closed.load(Ordering::SeqCst) {
                // Dropping the job drops its result sender.
                shared.publish();
                continue;
            }

            shared.running.fetch_add(1, Ordering::SeqCst);
            shared.publish();
            self.set_busy(Some(Instant::now()));

            let succeeded = match AssertUnwindSafe(async move { job().await })
                .catch_unwind()
                .await
            {
                Ok(succeeded) => succeeded,
                Err(_) => {
                    error!("Admission worker {} caught a panicking job", self.id);
                    false
                }
            };

            self.set_busy(None);
            shared.running.fetch_sub(1, Ordering::SeqCst);
            shared.publish();

            if succeeded {
                self.processed_count.fetch_add(1, Ordering::Relaxed);
            } else {
                self.error_count.fetch_add(1, Ordering::Relaxed);
            }
        }

        self.is_running.store(false, Ordering::Relaxed);
        debug!("Admission worker {} stopped", self.id);
    }

    fn set_busy(&self, since: Option<Instant>) {
        *self.busy_since.lock().unwrap_or_else(PoisonError::into_inner) = since;
    }

    fn busy_for(&self) -> Option<Duration> {
        self.busy_since
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .map(|since| since.elapsed())
    }

    pub fn get_stats(&self) -> WorkerStats {
        WorkerStats {
            id: self.id,
            is_running: self.is_running.load(Ordering::Relaxed),
            processed_count: self.processed_count.load(Ordering::Relaxed),
            error_count: self.error_count.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkerStats {
    pub id: usize,
    pub is_running: bool,
    pub processed_count: usize,
    pub error_count: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub waiting: usize,
    pub running: usize,
    pub capacity: usize,
}

struct QueueShared {
    receiver: Mutex<mpsc::UnboundedReceiver<QueuedJob>>,
    waiting: AtomicUsize,
    running: AtomicUsize,
    closed: AtomicBool,
    metrics: Arc<Metrics>,
}

impl QueueShared {
    fn publish(&self) {
        self.metrics.set_queue(
            self.waiting.load(Ordering::SeqCst),
            self.running.load(Ordering::SeqCst),
        );
    }
}

pub struct AdmissionQueue {
    capacity: usize,
    sender: StdMutex<Option<mpsc::UnboundedSender<QueuedJob>>>,
    shared: Arc<QueueShared>,
    workers: Vec<Arc<AdmissionWorker>>,
}

impl AdmissionQueue {
    /// Start `capacity` workers. A capacity of zero is treated as one.
    pub fn new(capacity: usize, metrics: Arc<Metrics>) -> Self {
        let capacity = capacity.max(1);
        let (sender, receiver) = mpsc::unbounded_channel();

        let shared = Arc::new(QueueShared {
            receiver: Mutex::new(receiver),
            waiting: AtomicUsize::new(0),
            running: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
            metrics,
        });

        let workers: Vec<Arc<AdmissionWorker>> =
            (0..capacity).map(|id| Arc::new(AdmissionWorker::new(id))).collect();

        for worker in &workers {
            let worker = worker.clone();
            let shared = shared.clone();
            tokio::spawn(worker.run(shared));
        }

        info!("Admission queue started with capacity {}", capacity);

        Self {
            capacity,
            sender: StdMutex::new(Some(sender)),
            shared,
            workers,
        }
    }

    /// Run `job` once a slot is free and return its result.
    ///
    /// A job whose caller has stopped waiting by the time a slot frees up is
    /// skipped. A job that panics releases its slot and reports `Internal`.
    pub async fn submit<F, Fut, T>(&self, job: F) -> Result<T, MeasureError>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, MeasureError>> + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let queued: QueuedJob = Box::new(move || {
            async move {
                if tx.is_closed() {
                    return true;
                }
                let result = job().await;
                let succeeded = result.is_ok();
                let _ = tx.send(result);
                succeeded
            }
            .boxed()
        });

        {
            let sender = self.sender.lock().unwrap_or_else(PoisonError::into_inner);
            let Some(sender) = sender.as_ref() else {
                return Err(MeasureError::ShuttingDown);
            };
            self.shared.waiting.fetch_add(1, Ordering::SeqCst);
            if sender.send(queued).is_err() {
                self.shared.waiting.fetch_sub(1, Ordering::SeqCst);
                return Err(MeasureError::ShuttingDown);
            }
        }
        self.shared.publish();

        match rx.await {
            Ok(result) => result,
            Err(_) if self.is_closed() => Err(MeasureError::ShuttingDown),
            Err(_) => Err(MeasureError::Internal("queued job did not complete".to_string())),
        }
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats {
            waiting: self.shared.waiting.load(Ordering::SeqCst),
            running: self.shared.running.load(Ordering::SeqCst),
            capacity: self.capacity,
        }
    }

    /// How long the oldest running job has held its slot.
    pub fn longest_running(&self) -> Option<Duration> {
        self.workers.iter().filter_map(|w| w.busy_for()).max()
    }

    pub fn get_worker_stats(&self) -> Vec<WorkerStats> {
        self.workers.iter().map(|w| w.get_stats()).collect()
    }

    pub fn total_processed(&self) -> usize {
        self.workers
            .iter()
            .map(|w| w.processed_count.load(Ordering::Relaxed))
            .sum()
    }

    pub fn total_errors(&self) -> usize {
        self.workers
            .iter()
            .map(|w| w.error_count.load(Ordering::Relaxed))
            .sum()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    /// Refuse new jobs and drop queued ones. Running jobs finish.
    pub fn close(&self) {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let dropped = self.shared.waiting.load(Ordering::SeqCst);
        if dropped > 0 {
            warn!("Admission queue closed with {} job(s) waiting", dropped);
        } else {
            info!("Admission queue closed");
        }
    }
}

impl Drop for AdmissionQueue {
    fn drop(&mut self) {
        self.close();
    }
}

/// Progress of a batch of measurements, reported by the CLI.
pub struct ProgressTracker {
    total: usize,
    completed: AtomicUsize,
    errors: AtomicUsize,
    start_time: std::time::Instant,
}

impl ProgressTracker {
    pub fn new(total: usize) -> Self {
        Self {
            total,
            completed: AtomicUsize::new(0),
            errors: AtomicUsize::new(0),
            start_time: std::time::Instant::now(),
        }
    }

    pub fn record_completion(&self, success: bool) {
        self.completed.fetch_add(1, Ordering::Relaxed);
        if !success {
            self.errors.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn get_progress(&self) -> ProgressInfo {
        let completed = self.completed.load(Ordering::Relaxed);
        let errors = self.errors.load(Ordering::Relaxed);
        let elapsed = self.start_time.elapsed();
        let rate = if elapsed.as_secs_f64() > 0.0 {
            completed as f64 / elapsed.as_secs_f64()
        } else {
            0.0
        };
        let eta = (completed > 0 && rate > 0.0).then(|| {
            Duration::from_secs_f64(self.total.saturating_sub(completed) as f64 / rate)
        });

        ProgressInfo {
            total: self.total,
            completed,
            errors,
            success: completed.saturating_sub(errors),
            elapsed,
            rate,
            eta,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.completed.load(Ordering::Relaxed) >= self.total
    }
}

#[derive(Debug, Clone)]
pub struct ProgressInfo {
    pub total: usize,
    pub completed: usize,
    pub errors: usize,
    pub success: usize,
    pub elapsed: Duration,
    pub rate: f64,
    pub eta: Option<Duration>,
}
