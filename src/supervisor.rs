//! Self-scheduling maintenance supervisor.
//!
//! The supervisor keeps the queue healthy without any external timer service:
//! "run maintenance" is itself a job on a reserved internal queue. Each tick
//! runs the expire, archive, and purge sweeps, acknowledges the consumed
//! self-message, and publishes the next one with the configured delay. Because
//! job claims are atomic and exclusive, at most one process in a cooperating
//! fleet executes a given tick, and a crashed supervisor's pending self-message
//! is simply claimed by another instance — the cadence recovers on its own.
//!
//! A second reserved queue drives periodic state monitoring the same way; it
//! is optional and independently configured.
//!
//! Faults never stop the loops: a failing sweep is reported on the `error`
//! event channel and the next self-message is still published, so a persistent
//! problem surfaces repeatedly instead of silently halting housekeeping.

use crate::{
    MillstoneError, Result,
    config::SupervisorConfig,
    events::{EventEmitter, EventKind, QueueEvent},
    job::{Job, JobId},
    queue::JobStore,
    worker::{BatchHandler, Worker, WorkerHandle},
};
use std::sync::{
    Arc, Mutex,
    atomic::{AtomicBool, Ordering},
};
use tracing::{debug, warn};

/// Reserved queue carrying maintenance self-messages.
pub const MAINTENANCE_QUEUE: &str = "__millstone__maintenance";

/// Reserved queue carrying state-monitor self-messages.
pub const MONITOR_STATES_QUEUE: &str = "__millstone__monitor_states";

/// Self-messages are drained in batches so a backlog collapses into one tick.
const MAINTENANCE_BATCH_SIZE: u32 = 10;

/// Maintenance supervisor over a [`JobStore`].
///
/// Each instance owns its stop flag, event emitter, and subscriptions, so
/// several supervisors are safely constructible and independently stoppable —
/// within one process or across a fleet. Clones share the same instance.
///
/// # Examples
///
/// ```rust,ignore
/// use millstone::{Supervisor, SupervisorConfig, EventKind, QueueEvent};
///
/// let supervisor = Supervisor::new(store, SupervisorConfig::default());
/// supervisor.on(EventKind::Archived, |event| {
///     if let QueueEvent::Archived(count) = event {
///         println!("archived {count} jobs");
///     }
/// });
/// supervisor.supervise().await?;
/// // ... later:
/// supervisor.stop().await;
/// ```
pub struct Supervisor<S: JobStore> {
    store: Arc<S>,
    config: SupervisorConfig,
    events: Arc<EventEmitter>,
    stopped: Arc<AtomicBool>,
    workers: Arc<Mutex<Vec<WorkerHandle>>>,
}

impl<S: JobStore> Clone for Supervisor<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            config: self.config.clone(),
            events: self.events.clone(),
            stopped: self.stopped.clone(),
            workers: self.workers.clone(),
        }
    }
}

impl<S: JobStore + 'static> Supervisor<S> {
    pub fn new(store: Arc<S>, config: SupervisorConfig) -> Self {
        Self {
            store,
            config,
            events: Arc::new(EventEmitter::new()),
            stopped: Arc::new(AtomicBool::new(false)),
            workers: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Register an event handler; see [`EventEmitter::on`].
    pub fn on<F>(&self, kind: EventKind, handler: F)
    where
        F: Fn(&QueueEvent) + Send + Sync + 'static,
    {
        self.events.on(kind, handler);
    }

    pub fn emitter(&self) -> Arc<EventEmitter> {
        self.events.clone()
    }

    /// Start the maintenance loop, and the state-monitor loop when configured.
    ///
    /// Publishes the first delayed self-message unless one is already pending
    /// (another instance may have scheduled it), then subscribes a single-slot
    /// consumer to each reserved queue.
    pub async fn supervise(&self) -> Result<()> {
        if !self.has_pending(MAINTENANCE_QUEUE).await? {
            self.publish_maintenance().await?;
        }
        self.subscribe(MAINTENANCE_QUEUE, {
            let supervisor = self.clone();
            Arc::new(move |jobs| {
                let supervisor = supervisor.clone();
                Box::pin(async move {
                    supervisor.on_maintenance(jobs).await;
                    Ok(())
                })
            })
        });

        if self.config.monitor_state_interval.is_some() {
            if !self.has_pending(MONITOR_STATES_QUEUE).await? {
                self.publish_monitor_states().await?;
            }
            self.subscribe(MONITOR_STATES_QUEUE, {
                let supervisor = self.clone();
                Arc::new(move |jobs| {
                    let supervisor = supervisor.clone();
                    Box::pin(async move {
                        supervisor.on_monitor_states(jobs).await;
                        Ok(())
                    })
                })
            });
        }

        Ok(())
    }

    /// Stop scheduling further ticks. Idempotent; an in-flight tick still
    /// completes, it just no longer republishes.
    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        let handles: Vec<WorkerHandle> = {
            let mut workers = self.workers.lock().unwrap_or_else(|e| e.into_inner());
            workers.drain(..).collect()
        };
        for handle in handles {
            handle.signal();
        }
        debug!("Supervisor stopped");
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    fn subscribe(&self, queue_name: &str, handler: BatchHandler) {
        let worker = Worker::new(self.store.clone(), queue_name, handler)
            .with_batch_size(MAINTENANCE_BATCH_SIZE)
            .with_poll_interval(self.config.poll_interval)
            .with_auto_complete(false);
        let mut workers = self.workers.lock().unwrap_or_else(|e| e.into_inner());
        workers.push(worker.spawn());
    }

    /// Whether a live self-message already sits on the given internal queue.
    async fn has_pending(&self, queue_name: &str) -> Result<bool> {
        let snapshot = self.store.count_states().await?;
        Ok(snapshot
            .queues
            .get(queue_name)
            .map(|c| c.created + c.retry + c.active > 0)
            .unwrap_or(false))
    }

    async fn publish_maintenance(&self) -> Result<()> {
        self.store
            .send(
                Job::new(MAINTENANCE_QUEUE, serde_json::Value::Null)
                    .with_delay(self.config.maintenance_interval),
            )
            .await?;
        Ok(())
    }

    async fn publish_monitor_states(&self) -> Result<()> {
        let interval = self
            .config
            .monitor_state_interval
            .ok_or_else(|| MillstoneError::Supervisor {
                message: "state monitoring is not configured".to_string(),
            })?;
        self.store
            .send(Job::new(MONITOR_STATES_QUEUE, serde_json::Value::Null).with_delay(interval))
            .await?;
        Ok(())
    }

    /// One maintenance tick: expire, archive, purge, in that order — expire
    /// frees active slots before archive/purge operate on terminal rows.
    async fn on_maintenance(&self, jobs: Vec<Job>) {
        let tick = async {
            let expired = self.store.expire().await?;
            self.events.emit_if_positive(QueueEvent::Expired(expired));

            let archived = self.store.archive(self.config.archive_interval).await?;
            self.events.emit_if_positive(QueueEvent::Archived(archived));

            let deleted = self.store.purge(self.config.delete_interval).await?;
            self.events.emit_if_positive(QueueEvent::Deleted(deleted));

            debug!(expired, archived, deleted, "maintenance tick");

            let ids: Vec<JobId> = jobs.iter().map(|j| j.id).collect();
            self.store.complete(&ids, None).await?;
            Ok::<_, MillstoneError>(())
        };

        if let Err(e) = tick.await {
            warn!("Maintenance tick failed: {e}");
            self.events.emit(QueueEvent::Error(Arc::new(e)));
        }

        if !self.stopped.load(Ordering::SeqCst) {
            if let Err(e) = self.publish_maintenance().await {
                self.events.emit(QueueEvent::Error(Arc::new(e)));
            }
        }
    }

    /// One monitor tick: snapshot state counts and publish them.
    async fn on_monitor_states(&self, jobs: Vec<Job>) {
        let tick = async {
            let snapshot = self.store.count_states().await?;
            self.events.emit(QueueEvent::MonitorStates(snapshot));

            let ids: Vec<JobId> = jobs.iter().map(|j| j.id).collect();
            self.store.complete(&ids, None).await?;
            Ok::<_, MillstoneError>(())
        };

        if let Err(e) = tick.await {
            warn!("State monitor tick failed: {e}");
            self.events.emit(QueueEvent::Error(Arc::new(e)));
        }

        if !self.stopped.load(Ordering::SeqCst) {
            if let Err(e) = self.publish_monitor_states().await {
                self.events.emit(QueueEvent::Error(Arc::new(e)));
            }
        }
    }
}
