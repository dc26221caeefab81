//! Configuration surfaces for the queue and its maintenance supervisor.
//!
//! These are plain structs with `Default` impls and builder-style setters.
//! Loading them from files or flags is the host application's concern.

use crate::job::Job;
use std::time::Duration;

/// Timing configuration for a [`Supervisor`](crate::supervisor::Supervisor).
///
/// # Examples
///
/// ```rust
/// use millstone::SupervisorConfig;
/// use std::time::Duration;
///
/// let config = SupervisorConfig::default()
///     .with_maintenance_interval(Duration::from_secs(30))
///     .with_monitor_state_interval(Duration::from_secs(60))
///     .with_archive_interval(Duration::from_secs(3600));
/// ```
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Delay between maintenance ticks (expire/archive/purge sweeps).
    pub maintenance_interval: Duration,
    /// Delay between state-monitor ticks; `None` disables state monitoring.
    pub monitor_state_interval: Option<Duration>,
    /// How long terminal rows stay in the live table before the archive sweep
    /// moves them.
    pub archive_interval: Duration,
    /// How long archived rows are retained before the purge sweep deletes them.
    pub delete_interval: Duration,
    /// Polling interval for the supervisor's internal queue subscriptions.
    pub poll_interval: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            maintenance_interval: Duration::from_secs(60),
            monitor_state_interval: None,
            archive_interval: Duration::from_secs(60 * 60),
            delete_interval: Duration::from_secs(7 * 24 * 60 * 60),
            poll_interval: Duration::from_secs(1),
        }
    }
}

impl SupervisorConfig {
    pub fn with_maintenance_interval(mut self, interval: Duration) -> Self {
        self.maintenance_interval = interval;
        self
    }

    pub fn with_monitor_state_interval(mut self, interval: Duration) -> Self {
        self.monitor_state_interval = Some(interval);
        self
    }

    pub fn without_state_monitoring(mut self) -> Self {
        self.monitor_state_interval = None;
        self
    }

    pub fn with_archive_interval(mut self, interval: Duration) -> Self {
        self.archive_interval = interval;
        self
    }

    pub fn with_delete_interval(mut self, interval: Duration) -> Self {
        self.delete_interval = interval;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

/// Default scheduling metadata applied to new jobs.
///
/// [`Job::new`](crate::Job::new) uses these same values; a `JobDefaults`
/// instance lets an application stamp its own policy onto every job it
/// produces:
///
/// ```rust
/// use millstone::JobDefaults;
/// use serde_json::json;
/// use std::time::Duration;
///
/// let defaults = JobDefaults::default()
///     .with_retry_limit(5)
///     .with_retry_backoff(true);
/// let job = defaults.job("email", json!({"to": "user@example.com"}));
/// assert_eq!(job.retry_limit, 5);
/// ```
#[derive(Debug, Clone)]
pub struct JobDefaults {
    pub retry_limit: i32,
    pub retry_delay: Duration,
    pub retry_backoff: bool,
    pub expire_in: Duration,
    /// Retention window feeding `keep_until`.
    pub retention: Duration,
}

impl Default for JobDefaults {
    fn default() -> Self {
        Self {
            retry_limit: 2,
            retry_delay: Duration::from_secs(30),
            retry_backoff: false,
            expire_in: Duration::from_secs(15 * 60),
            retention: Duration::from_secs(14 * 24 * 60 * 60),
        }
    }
}

impl JobDefaults {
    pub fn with_retry_limit(mut self, retry_limit: i32) -> Self {
        self.retry_limit = retry_limit;
        self
    }

    pub fn with_retry_delay(mut self, retry_delay: Duration) -> Self {
        self.retry_delay = retry_delay;
        self
    }

    pub fn with_retry_backoff(mut self, backoff: bool) -> Self {
        self.retry_backoff = backoff;
        self
    }

    pub fn with_expire_in(mut self, expire_in: Duration) -> Self {
        self.expire_in = expire_in;
        self
    }

    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }

    /// Build a job carrying these defaults.
    pub fn job(&self, queue_name: impl Into<String>, payload: serde_json::Value) -> Job {
        let mut job = Job::new(queue_name, payload)
            .with_retry_limit(self.retry_limit)
            .with_retry_delay(self.retry_delay)
            .with_expire_in(self.expire_in)
            .with_retention(self.retention);
        job.retry_backoff = self.retry_backoff;
        job
    }
}
