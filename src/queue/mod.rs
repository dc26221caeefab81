//! The store contract and its backends.
//!
//! [`JobStore`] is the abstract interface the queue engine and the supervisor
//! consume: one method per atomic store operation. Backends must implement
//! every mutation as a single atomic statement — the claim in [`fetch`]
//! (row-lock with skip semantics) and the move in [`archive`] in particular
//! must never decompose into separate read-then-write round trips, because the
//! store's locking is the only mutual exclusion in the system.
//!
//! Two backends ship with the crate: a PostgreSQL implementation behind the
//! `postgres` feature, and an in-memory implementation for tests behind the
//! `test` feature.
//!
//! [`fetch`]: JobStore::fetch
//! [`archive`]: JobStore::archive

use crate::{
    Result,
    archive::ArchivedJob,
    job::{Job, JobId},
    stats::StateSnapshot,
};
use async_trait::async_trait;
use std::time::Duration;

#[cfg(feature = "postgres")]
pub mod postgres;

#[cfg(any(test, feature = "test"))]
pub mod memory;

/// Queue name of the companion queue receiving completion notifications for
/// jobs sent with a completion notice.
pub fn completed_queue_name(queue_name: &str) -> String {
    format!("__completed__{queue_name}")
}

/// Abstract interface over the backing relational store.
///
/// Every method is one store round trip; affected-row counts and rows are the
/// return values. All job-state writes flow through this trait — no caller
/// keeps an in-process cache of job rows, which is what makes the engine safe
/// across any number of cooperating processes.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Create the job and archive tables (idempotent). In-memory stores
    /// implement this as a no-op.
    async fn create_tables(&self) -> Result<()>;

    /// Conditionally insert one job.
    ///
    /// Returns `Ok(None)` when the dedup constraint on
    /// `(queue, singleton_key, singleton_on)` suppresses the insert. A
    /// suppressed send is part of the dedup contract, not a failure.
    async fn insert_job(&self, job: &Job) -> Result<Option<JobId>>;

    /// Send a job, honoring its debounce option: when the job was built with
    /// [`Job::debounced`](crate::Job::debounced) and the current bucket is
    /// occupied, the insert is retried once into the next bucket.
    async fn send(&self, job: Job) -> Result<Option<JobId>> {
        if let Some(id) = self.insert_job(&job).await? {
            return Ok(Some(id));
        }
        if let Some(next) = job.next_slot() {
            return self.insert_job(&next).await;
        }
        Ok(None)
    }

    /// Atomically claim up to `batch_size` eligible jobs.
    ///
    /// Eligible means `created`, or `retry` whose delay has elapsed, with
    /// `start_after <= now`; ordering is priority descending, then
    /// `start_after` ascending, then id. Rows concurrently locked by another
    /// fetch are skipped, and the returned rows are transitioned to `active`
    /// with `started_on = now` in the same statement. No two concurrent
    /// fetches, in any process, may return the same job id.
    async fn fetch(&self, queue_name: &str, batch_size: u32) -> Result<Vec<Job>>;

    /// Transition `active -> completed`, recording `output`. Ids not currently
    /// `active` are silently ignored; the returned count covers only the rows
    /// actually transitioned. Jobs sent with a completion notice enqueue a
    /// notification job on [`completed_queue_name`].
    async fn complete(&self, ids: &[JobId], output: Option<serde_json::Value>) -> Result<u64>;

    /// Transition `active` jobs per the retry budget: below `retry_limit`, to
    /// `retry` with an incremented count and a recomputed `start_after`; at
    /// the limit, to terminal `failed`.
    async fn fail(&self, ids: &[JobId], output: Option<serde_json::Value>) -> Result<u64>;

    /// Transition any non-terminal state to `cancelled`.
    async fn cancel(&self, ids: &[JobId]) -> Result<u64>;

    /// Sweep `active` jobs whose `started_on + expire_in` has passed into
    /// `retry` or terminal `expired`, per the same budget rule as [`fail`].
    ///
    /// [`fail`]: JobStore::fail
    async fn expire(&self) -> Result<u64>;

    /// Atomically move terminal rows older than `retention` past their
    /// terminal timestamp — and any row whose `keep_until` has lapsed — into
    /// the archive table.
    async fn archive(&self, retention: Duration) -> Result<u64>;

    /// Delete archive rows archived more than `retention` ago.
    async fn purge(&self, retention: Duration) -> Result<u64>;

    /// Per-queue and global job counts keyed by state. Queues with no rows are
    /// omitted.
    async fn count_states(&self) -> Result<StateSnapshot>;

    async fn get_job(&self, id: JobId) -> Result<Option<Job>>;

    async fn get_archived_job(&self, id: JobId) -> Result<Option<ArchivedJob>>;
}
