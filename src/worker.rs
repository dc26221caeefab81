//! Queue subscriptions.
//!
//! A [`Worker`] is the subscribe half of the internal pub/sub primitive: it
//! polls one queue, claims up to `batch_size` jobs per round trip, and hands
//! each claimed batch to its handler — one invocation at a time, so a single
//! subscription never overlaps itself. The publish half is just
//! [`JobStore::send`](crate::queue::JobStore::send) with a delayed
//! `start_after`; there is no separate mechanism.
//!
//! By default a worker acknowledges on behalf of its handler: batches whose
//! handler future resolves are completed, batches whose handler errors are
//! failed (entering the retry path). Consumers that acknowledge explicitly —
//! the maintenance supervisor does — disable this with
//! [`Worker::with_auto_complete`].

use crate::{
    Result,
    job::{Job, JobId},
    queue::JobStore,
};
use std::{sync::Arc, time::Duration};
use tokio::{
    sync::mpsc,
    task::JoinHandle,
    time::sleep,
};
use tracing::{debug, error, info, warn};

/// Handler invoked with each claimed batch.
pub type BatchHandler = Arc<
    dyn Fn(Vec<Job>) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<()>> + Send>>
        + Send
        + Sync,
>;

/// A single-slot subscription to one queue.
///
/// # Examples
///
/// ```rust,ignore
/// use millstone::{Worker, worker::BatchHandler};
/// use std::sync::Arc;
///
/// let handler: BatchHandler = Arc::new(|jobs| {
///     Box::pin(async move {
///         for job in jobs {
///             println!("processing {}", job.id);
///         }
///         Ok(())
///     })
/// });
/// let worker = Worker::new(store, "email", handler).with_batch_size(5);
/// let handle = worker.spawn();
/// ```
pub struct Worker<S: JobStore> {
    store: Arc<S>,
    queue_name: String,
    handler: BatchHandler,
    batch_size: u32,
    poll_interval: Duration,
    auto_complete: bool,
}

impl<S: JobStore + 'static> Worker<S> {
    pub fn new(store: Arc<S>, queue_name: impl Into<String>, handler: BatchHandler) -> Self {
        Self {
            store,
            queue_name: queue_name.into(),
            handler,
            batch_size: 1,
            poll_interval: Duration::from_secs(1),
            auto_complete: true,
        }
    }

    pub fn with_batch_size(mut self, batch_size: u32) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_auto_complete(mut self, auto_complete: bool) -> Self {
        self.auto_complete = auto_complete;
        self
    }

    /// Run until a shutdown signal arrives. An in-flight batch always runs to
    /// completion; the signal is honored between batches.
    pub async fn run(&self, mut shutdown_rx: mpsc::Receiver<()>) -> Result<()> {
        info!("Worker started for queue: {}", self.queue_name);

        loop {
            match self.poll_once().await {
                Ok(true) => {
                    if shutdown_rx.try_recv().is_ok() {
                        break;
                    }
                }
                Ok(false) => {
                    tokio::select! {
                        _ = shutdown_rx.recv() => break,
                        _ = sleep(self.poll_interval) => {}
                    }
                }
                Err(e) => {
                    error!("Error polling queue {}: {}", self.queue_name, e);
                    tokio::select! {
                        _ = shutdown_rx.recv() => break,
                        _ = sleep(self.poll_interval) => {}
                    }
                }
            }
        }

        info!("Worker shutting down for queue: {}", self.queue_name);
        Ok(())
    }

    /// Spawn the worker onto the runtime, returning a handle that can stop it.
    pub fn spawn(self) -> WorkerHandle {
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        let join = tokio::spawn(async move { self.run(shutdown_rx).await });
        WorkerHandle { shutdown_tx, join }
    }

    /// One fetch round trip. Returns whether a batch was claimed.
    async fn poll_once(&self) -> Result<bool> {
        let jobs = self.store.fetch(&self.queue_name, self.batch_size).await?;
        if jobs.is_empty() {
            return Ok(false);
        }

        let ids: Vec<JobId> = jobs.iter().map(|j| j.id).collect();
        debug!("Processing {} job(s) from queue {}", ids.len(), self.queue_name);

        match (self.handler)(jobs).await {
            Ok(()) => {
                if self.auto_complete {
                    self.store.complete(&ids, None).await?;
                }
            }
            Err(e) => {
                warn!("Handler failed for queue {}: {}", self.queue_name, e);
                if self.auto_complete {
                    let output = serde_json::json!({"message": e.to_string()});
                    self.store.fail(&ids, Some(output)).await?;
                }
            }
        }
        Ok(true)
    }
}

/// Handle to a spawned [`Worker`].
pub struct WorkerHandle {
    shutdown_tx: mpsc::Sender<()>,
    join: JoinHandle<Result<()>>,
}

impl WorkerHandle {
    /// Signal shutdown without waiting for the worker to exit.
    pub fn signal(&self) {
        let _ = self.shutdown_tx.try_send(());
    }

    /// Signal shutdown and wait for the worker to exit. The in-flight batch,
    /// if any, completes first.
    pub async fn stop(self) -> Result<()> {
        let _ = self.shutdown_tx.send(()).await;
        match self.join.await {
            Ok(result) => result,
            Err(e) => Err(crate::MillstoneError::Worker {
                message: format!("worker task panicked: {e}"),
            }),
        }
    }
}

/// A set of workers started and stopped together.
pub struct WorkerPool<S: JobStore> {
    workers: Vec<Worker<S>>,
    handles: Vec<WorkerHandle>,
}

impl<S: JobStore + 'static> WorkerPool<S> {
    pub fn new() -> Self {
        Self {
            workers: Vec::new(),
            handles: Vec::new(),
        }
    }

    pub fn add_worker(&mut self, worker: Worker<S>) {
        self.workers.push(worker);
    }

    /// Spawn all added workers.
    pub fn start(&mut self) {
        for worker in self.workers.drain(..) {
            self.handles.push(worker.spawn());
        }
    }

    /// Stop every running worker and wait for them to exit.
    pub async fn shutdown(&mut self) -> Result<()> {
        for handle in &self.handles {
            handle.signal();
        }
        for handle in self.handles.drain(..) {
            handle.stop().await?;
        }
        Ok(())
    }
}

impl<S: JobStore + 'static> Default for WorkerPool<S> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::JobState;
    use crate::queue::memory::MemoryQueue;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting_handler(counter: Arc<AtomicUsize>) -> BatchHandler {
        Arc::new(move |jobs: Vec<Job>| {
            let counter = counter.clone();
            Box::pin(async move {
                counter.fetch_add(jobs.len(), Ordering::SeqCst);
                Ok(())
            })
        })
    }

    #[tokio::test]
    async fn test_worker_processes_and_completes_jobs() {
        let store = Arc::new(MemoryQueue::new());
        let id = store
            .send(Job::new("q", json!({"n": 1})))
            .await
            .unwrap()
            .unwrap();

        let seen = Arc::new(AtomicUsize::new(0));
        let worker = Worker::new(store.clone(), "q", counting_handler(seen.clone()))
            .with_poll_interval(Duration::from_millis(10));
        let handle = worker.spawn();

        for _ in 0..100 {
            if seen.load(Ordering::SeqCst) == 1 {
                break;
            }
            sleep(Duration::from_millis(10)).await;
        }
        handle.stop().await.unwrap();

        assert_eq!(seen.load(Ordering::SeqCst), 1);
        let job = store.get_job(id).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Completed);
    }

    #[tokio::test]
    async fn test_worker_fails_batch_on_handler_error() {
        let store = Arc::new(MemoryQueue::new());
        let id = store
            .send(
                Job::new("q", json!(null))
                    .with_retry_limit(0)
                    .with_retry_delay(Duration::from_secs(1)),
            )
            .await
            .unwrap()
            .unwrap();

        let handler: BatchHandler = Arc::new(|_| {
            Box::pin(async { Err(crate::MillstoneError::handler("nope")) })
        });
        let worker =
            Worker::new(store.clone(), "q", handler).with_poll_interval(Duration::from_millis(10));
        let handle = worker.spawn();

        for _ in 0..100 {
            if let Some(job) = store.get_job(id).await.unwrap() {
                if job.state == JobState::Failed {
                    break;
                }
            }
            sleep(Duration::from_millis(10)).await;
        }
        handle.stop().await.unwrap();

        let job = store.get_job(id).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Failed);
        assert_eq!(job.output.unwrap()["message"], "Handler error: nope");
    }

    #[tokio::test]
    async fn test_worker_batches_jobs() {
        let store = Arc::new(MemoryQueue::new());
        for n in 0..6 {
            store.send(Job::new("q", json!({"n": n}))).await.unwrap();
        }

        let batches = Arc::new(AtomicUsize::new(0));
        let seen = Arc::new(AtomicUsize::new(0));
        let b = batches.clone();
        let s = seen.clone();
        let handler: BatchHandler = Arc::new(move |jobs: Vec<Job>| {
            let b = b.clone();
            let s = s.clone();
            Box::pin(async move {
                assert!(jobs.len() <= 3);
                b.fetch_add(1, Ordering::SeqCst);
                s.fetch_add(jobs.len(), Ordering::SeqCst);
                Ok(())
            })
        });

        let worker = Worker::new(store.clone(), "q", handler)
            .with_batch_size(3)
            .with_poll_interval(Duration::from_millis(10));
        let handle = worker.spawn();

        for _ in 0..100 {
            if seen.load(Ordering::SeqCst) == 6 {
                break;
            }
            sleep(Duration::from_millis(10)).await;
        }
        handle.stop().await.unwrap();

        assert_eq!(seen.load(Ordering::SeqCst), 6);
        assert_eq!(batches.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_worker_pool_shutdown() {
        let store = Arc::new(MemoryQueue::new());
        let seen = Arc::new(AtomicUsize::new(0));

        let mut pool = WorkerPool::new();
        for queue in ["a", "b"] {
            pool.add_worker(
                Worker::new(store.clone(), queue, counting_handler(seen.clone()))
                    .with_poll_interval(Duration::from_millis(10)),
            );
        }
        pool.start();

        store.send(Job::new("a", json!(null))).await.unwrap();
        store.send(Job::new("b", json!(null))).await.unwrap();

        for _ in 0..100 {
            if seen.load(Ordering::SeqCst) == 2 {
                break;
            }
            sleep(Duration::from_millis(10)).await;
        }
        pool.shutdown().await.unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 2);
    }
}
