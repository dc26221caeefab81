//! In-memory store for tests and development.
//!
//! `MemoryQueue` implements [`JobStore`] entirely in memory behind one mutex,
//! so every operation is atomic exactly like a single-statement backend. A
//! [`MockClock`] can be attached to drive time-dependent behavior (delayed
//! eligibility, expiry, archival windows) deterministically.

use crate::{
    Result,
    archive::ArchivedJob,
    job::{Job, JobId, JobState},
    queue::{JobStore, completed_queue_name},
    retry,
    stats::StateSnapshot,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Controllable clock for deterministic tests.
///
/// Starts at the real current time and only moves when advanced.
#[derive(Clone, Debug)]
pub struct MockClock {
    current: Arc<Mutex<DateTime<Utc>>>,
}

impl MockClock {
    pub fn new() -> Self {
        Self {
            current: Arc::new(Mutex::new(Utc::now())),
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        *self.current.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn advance(&self, duration: chrono::Duration) {
        let mut now = self.current.lock().unwrap_or_else(|e| e.into_inner());
        *now += duration;
    }
}

impl Default for MockClock {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone, Debug)]
enum ClockSource {
    System,
    Mock(MockClock),
}

#[derive(Default)]
struct Inner {
    jobs: HashMap<JobId, Job>,
    archive: HashMap<JobId, ArchivedJob>,
}

/// In-memory [`JobStore`] implementation.
#[derive(Clone)]
pub struct MemoryQueue {
    inner: Arc<Mutex<Inner>>,
    clock: ClockSource,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner::default())),
            clock: ClockSource::System,
        }
    }

    pub fn with_clock(clock: MockClock) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner::default())),
            clock: ClockSource::Mock(clock),
        }
    }

    fn now(&self) -> DateTime<Utc> {
        match &self.clock {
            ClockSource::System => Utc::now(),
            ClockSource::Mock(clock) => clock.now(),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for MemoryQueue {
    fn default() -> Self {
        Self::new()
    }
}

fn chrono_duration(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::MAX)
}

/// Whether an existing row blocks an insert carrying the same singleton scope.
fn singleton_conflict(existing: &Job, incoming: &Job) -> bool {
    if existing.queue_name != incoming.queue_name
        || existing.singleton_key != incoming.singleton_key
    {
        return false;
    }
    match (incoming.singleton_on, existing.singleton_on) {
        // Keyed singleton without a window: one live job at a time.
        (None, None) => !existing.state.is_terminal(),
        // Bucketed: completed rows still occupy the bucket (throttle).
        (Some(slot), Some(occupied)) => {
            slot == occupied
                && (!existing.state.is_terminal() || existing.state == JobState::Completed)
        }
        _ => false,
    }
}

#[async_trait]
impl JobStore for MemoryQueue {
    async fn create_tables(&self) -> Result<()> {
        Ok(())
    }

    async fn insert_job(&self, job: &Job) -> Result<Option<JobId>> {
        let mut inner = self.lock();
        if job.singleton_key.is_some()
            && inner.jobs.values().any(|j| singleton_conflict(j, job))
        {
            return Ok(None);
        }
        if inner.jobs.contains_key(&job.id) {
            return Ok(None);
        }
        inner.jobs.insert(job.id, job.clone());
        Ok(Some(job.id))
    }

    async fn fetch(&self, queue_name: &str, batch_size: u32) -> Result<Vec<Job>> {
        let now = self.now();
        let mut inner = self.lock();

        let mut eligible: Vec<(i32, DateTime<Utc>, JobId)> = inner
            .jobs
            .values()
            .filter(|j| {
                j.queue_name == queue_name
                    && matches!(j.state, JobState::Created | JobState::Retry)
                    && j.start_after <= now
            })
            .map(|j| (j.priority, j.start_after, j.id))
            .collect();
        eligible.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)).then(a.2.cmp(&b.2)));
        eligible.truncate(batch_size as usize);

        let mut claimed = Vec::with_capacity(eligible.len());
        for (_, _, id) in eligible {
            if let Some(job) = inner.jobs.get_mut(&id) {
                job.state = JobState::Active;
                job.started_on = Some(now);
                claimed.push(job.clone());
            }
        }
        Ok(claimed)
    }

    async fn complete(&self, ids: &[JobId], output: Option<serde_json::Value>) -> Result<u64> {
        let now = self.now();
        let mut inner = self.lock();
        let mut count = 0;
        let mut notifications = Vec::new();

        for id in ids {
            if let Some(job) = inner.jobs.get_mut(id) {
                if job.state != JobState::Active {
                    continue;
                }
                job.state = JobState::Completed;
                job.completed_on = Some(now);
                job.output = output.clone();
                count += 1;

                if job.on_complete {
                    let payload = serde_json::json!({
                        "request": {
                            "id": job.id,
                            "queue": job.queue_name.clone(),
                            "payload": job.payload.clone(),
                        },
                        "response": output.clone(),
                        "state": "completed",
                    });
                    notifications.push(Job::new(completed_queue_name(&job.queue_name), payload));
                }
            }
        }
        for notice in notifications {
            inner.jobs.insert(notice.id, notice);
        }
        Ok(count)
    }

    async fn fail(&self, ids: &[JobId], output: Option<serde_json::Value>) -> Result<u64> {
        let now = self.now();
        let mut inner = self.lock();
        let mut count = 0;

        for id in ids {
            if let Some(job) = inner.jobs.get_mut(id) {
                if job.state != JobState::Active {
                    continue;
                }
                if job.retry_count < job.retry_limit {
                    job.retry_count += 1;
                    job.state = JobState::Retry;
                    job.started_on = None;
                    job.completed_on = None;
                    let delay =
                        retry::retry_delay(job.retry_delay, job.retry_count, job.retry_backoff);
                    job.start_after = now + chrono_duration(delay);
                } else {
                    job.state = JobState::Failed;
                    job.completed_on = Some(now);
                }
                job.output = output.clone();
                count += 1;
            }
        }
        Ok(count)
    }

    async fn cancel(&self, ids: &[JobId]) -> Result<u64> {
        let now = self.now();
        let mut inner = self.lock();
        let mut count = 0;

        for id in ids {
            if let Some(job) = inner.jobs.get_mut(id) {
                if job.state.is_terminal() {
                    continue;
                }
                job.state = JobState::Cancelled;
                job.completed_on = Some(now);
                job.started_on = None;
                count += 1;
            }
        }
        Ok(count)
    }

    async fn expire(&self) -> Result<u64> {
        let now = self.now();
        let mut inner = self.lock();
        let mut count = 0;

        for job in inner.jobs.values_mut() {
            if job.state != JobState::Active {
                continue;
            }
            let Some(started_on) = job.started_on else {
                continue;
            };
            if started_on + chrono_duration(job.expire_in) >= now {
                continue;
            }
            if job.retry_count < job.retry_limit {
                job.retry_count += 1;
                job.state = JobState::Retry;
                job.started_on = None;
                let delay = retry::retry_delay(job.retry_delay, job.retry_count, job.retry_backoff);
                job.start_after = now + chrono_duration(delay);
            } else {
                job.state = JobState::Expired;
                job.completed_on = Some(now);
            }
            count += 1;
        }
        Ok(count)
    }

    async fn archive(&self, retention: Duration) -> Result<u64> {
        let now = self.now();
        let cutoff = now - chrono_duration(retention);
        let mut inner = self.lock();

        let doomed: Vec<JobId> = inner
            .jobs
            .values()
            .filter(|j| {
                let aged_out = j.state.is_terminal()
                    && j.completed_on.map(|t| t < cutoff).unwrap_or(false);
                aged_out || j.keep_until < now
            })
            .map(|j| j.id)
            .collect();

        let count = doomed.len() as u64;
        for id in doomed {
            if let Some(job) = inner.jobs.remove(&id) {
                inner.archive.insert(
                    id,
                    ArchivedJob {
                        job,
                        archived_on: now,
                    },
                );
            }
        }
        Ok(count)
    }

    async fn purge(&self, retention: Duration) -> Result<u64> {
        let cutoff = self.now() - chrono_duration(retention);
        let mut inner = self.lock();
        let before = inner.archive.len();
        inner.archive.retain(|_, a| a.archived_on >= cutoff);
        Ok((before - inner.archive.len()) as u64)
    }

    async fn count_states(&self) -> Result<StateSnapshot> {
        let inner = self.lock();
        let mut snapshot = StateSnapshot::default();
        for job in inner.jobs.values() {
            snapshot.bump(&job.queue_name, job.state);
        }
        Ok(snapshot)
    }

    async fn get_job(&self, id: JobId) -> Result<Option<Job>> {
        Ok(self.lock().jobs.get(&id).cloned())
    }

    async fn get_archived_job(&self, id: JobId) -> Result<Option<ArchivedJob>> {
        Ok(self.lock().archive.get(&id).cloned())
    }
}
