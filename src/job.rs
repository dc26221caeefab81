//! Job definitions and the lifecycle state machine.
//!
//! A [`Job`] is one unit of work: a queue name, an opaque JSON payload, and the
//! scheduling/retry metadata that drives it through the state machine:
//!
//! ```text
//! created ──> active ──> { completed, failed, retry, expired }
//! retry   ──> active
//! any non-terminal ──> cancelled
//! ```
//!
//! Terminal states (`completed`, `expired`, `cancelled`, `failed`) have no
//! outgoing transitions; terminal rows are eventually moved to the archive
//! table by the maintenance supervisor.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

pub type JobId = Uuid;

/// Lifecycle state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Created,
    Retry,
    Active,
    Completed,
    Expired,
    Cancelled,
    Failed,
}

impl JobState {
    pub const ALL: [JobState; 7] = [
        JobState::Created,
        JobState::Retry,
        JobState::Active,
        JobState::Completed,
        JobState::Expired,
        JobState::Cancelled,
        JobState::Failed,
    ];

    /// Terminal states have no outgoing transitions except archival.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Completed | JobState::Expired | JobState::Cancelled | JobState::Failed
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Created => "created",
            JobState::Retry => "retry",
            JobState::Active => "active",
            JobState::Completed => "completed",
            JobState::Expired => "expired",
            JobState::Cancelled => "cancelled",
            JobState::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<JobState> {
        match s {
            "created" => Some(JobState::Created),
            "retry" => Some(JobState::Retry),
            "active" => Some(JobState::Active),
            "completed" => Some(JobState::Completed),
            "expired" => Some(JobState::Expired),
            "cancelled" => Some(JobState::Cancelled),
            "failed" => Some(JobState::Failed),
            _ => None,
        }
    }
}

/// One unit of work with identity, payload, state, and scheduling metadata.
///
/// Jobs are built with [`Job::new`] and the `with_*` builder methods, then
/// handed to a store via [`JobStore::send`](crate::queue::JobStore::send).
///
/// # Examples
///
/// ```rust
/// use millstone::Job;
/// use serde_json::json;
/// use std::time::Duration;
///
/// let job = Job::new("email", json!({"to": "user@example.com"}))
///     .with_priority(5)
///     .with_retry_limit(4)
///     .with_retry_delay(Duration::from_secs(10))
///     .with_exponential_backoff();
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub queue_name: String,
    pub payload: serde_json::Value,
    pub state: JobState,
    /// Higher priority is served first.
    pub priority: i32,
    pub retry_limit: i32,
    pub retry_count: i32,
    pub retry_delay: Duration,
    /// When set, retry delays grow exponentially with jitter instead of linearly.
    pub retry_backoff: bool,
    /// The job is not eligible for fetch before this instant.
    pub start_after: DateTime<Utc>,
    pub started_on: Option<DateTime<Utc>>,
    /// Dedup scope; see [`Job::with_singleton_key`].
    pub singleton_key: Option<String>,
    /// Dedup time bucket; set when a singleton window is configured.
    pub singleton_on: Option<DateTime<Utc>>,
    /// Maximum active duration before the expire sweep forces a retry/expiry.
    pub expire_in: Duration,
    pub created_on: DateTime<Utc>,
    /// Terminal timestamp, set when the job reaches a terminal state.
    pub completed_on: Option<DateTime<Utc>>,
    /// Hard TTL: the archive sweep discards the row past this instant
    /// regardless of state.
    pub keep_until: DateTime<Utc>,
    /// When set, completion enqueues a notification job on the companion
    /// `__completed__<queue>` queue.
    pub on_complete: bool,
    pub output: Option<serde_json::Value>,

    // Send-time options, not persisted.
    #[serde(skip)]
    pub(crate) singleton_window: Option<Duration>,
    #[serde(skip)]
    pub(crate) singleton_next_slot: bool,
}

impl Job {
    /// Create a job with default scheduling metadata (see
    /// [`JobDefaults`](crate::config::JobDefaults) for the documented values).
    pub fn new(queue_name: impl Into<String>, payload: serde_json::Value) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::now_v7(),
            queue_name: queue_name.into(),
            payload,
            state: JobState::Created,
            priority: 0,
            retry_limit: 2,
            retry_count: 0,
            retry_delay: Duration::from_secs(30),
            retry_backoff: false,
            start_after: now,
            started_on: None,
            singleton_key: None,
            singleton_on: None,
            expire_in: Duration::from_secs(15 * 60),
            created_on: now,
            completed_on: None,
            keep_until: now + chrono::Duration::days(14),
            on_complete: false,
            output: None,
            singleton_window: None,
            singleton_next_slot: false,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Delay eligibility by `delay` from now.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.start_after = Utc::now() + delay;
        self
    }

    pub fn with_start_after(mut self, start_after: DateTime<Utc>) -> Self {
        self.start_after = start_after;
        self
    }

    pub fn with_retry_limit(mut self, retry_limit: i32) -> Self {
        self.retry_limit = retry_limit;
        self
    }

    pub fn with_retry_delay(mut self, retry_delay: Duration) -> Self {
        self.retry_delay = retry_delay;
        self
    }

    pub fn with_exponential_backoff(mut self) -> Self {
        self.retry_backoff = true;
        self
    }

    pub fn with_expire_in(mut self, expire_in: Duration) -> Self {
        self.expire_in = expire_in;
        self
    }

    pub fn with_keep_until(mut self, keep_until: DateTime<Utc>) -> Self {
        self.keep_until = keep_until;
        self
    }

    /// Keep the row for `retention` from now before the archive sweep may
    /// discard it.
    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.keep_until = Utc::now() + retention;
        self
    }

    /// Suppress duplicate sends sharing this key. Without a window, at most one
    /// live (not yet terminal) job per `(queue, key)` exists at a time.
    pub fn with_singleton_key(mut self, key: impl Into<String>) -> Self {
        self.singleton_key = Some(key.into());
        self
    }

    /// Throttle: at most one job per `(queue, key)` within each `window`-sized
    /// time bucket. Conflicting sends are suppressed, not errors.
    pub fn with_singleton_window(mut self, window: Duration) -> Self {
        self.singleton_on = Some(bucket_start(Utc::now(), window));
        self.singleton_window = Some(window);
        self
    }

    /// Debounce: like [`Job::with_singleton_window`], but a send that collides
    /// with the current bucket is retried once into the next bucket instead of
    /// being suppressed outright.
    pub fn debounced(mut self, window: Duration) -> Self {
        self = self.with_singleton_window(window);
        self.singleton_next_slot = true;
        self
    }

    pub fn with_completion_notice(mut self) -> Self {
        self.on_complete = true;
        self
    }

    /// The same job re-targeted at the next singleton bucket, or `None` when
    /// this was not a debounce send.
    pub(crate) fn next_slot(&self) -> Option<Job> {
        if !self.singleton_next_slot {
            return None;
        }
        let window = self.singleton_window?;
        let slot = self.singleton_on?;
        let next = slot + chrono::Duration::from_std(window).ok()?;
        let mut job = self.clone();
        job.singleton_on = Some(next);
        job.start_after = job.start_after.max(next);
        job.singleton_next_slot = false;
        Some(job)
    }
}

/// Start of the dedup time bucket containing `now` for the given window.
pub(crate) fn bucket_start(now: DateTime<Utc>, window: Duration) -> DateTime<Utc> {
    let secs = window.as_secs().max(1) as i64;
    let start = now.timestamp() - now.timestamp().rem_euclid(secs);
    DateTime::from_timestamp(start, 0).unwrap_or(now)
}
