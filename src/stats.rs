//! State snapshots: per-state job counts, globally and per queue.

use crate::job::JobState;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Job counts keyed by state. `all` is the rollup across states.
///
/// Counts are `u64`: the backing store reports 64-bit integers and high-volume
/// queues overflow anything narrower.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateCounts {
    pub created: u64,
    pub retry: u64,
    pub active: u64,
    pub completed: u64,
    pub expired: u64,
    pub cancelled: u64,
    pub failed: u64,
    pub all: u64,
}

impl StateCounts {
    pub fn get(&self, state: JobState) -> u64 {
        match state {
            JobState::Created => self.created,
            JobState::Retry => self.retry,
            JobState::Active => self.active,
            JobState::Completed => self.completed,
            JobState::Expired => self.expired,
            JobState::Cancelled => self.cancelled,
            JobState::Failed => self.failed,
        }
    }

    fn slot(&mut self, state: JobState) -> &mut u64 {
        match state {
            JobState::Created => &mut self.created,
            JobState::Retry => &mut self.retry,
            JobState::Active => &mut self.active,
            JobState::Completed => &mut self.completed,
            JobState::Expired => &mut self.expired,
            JobState::Cancelled => &mut self.cancelled,
            JobState::Failed => &mut self.failed,
        }
    }

    /// Count one job, bumping both the state slot and the rollup.
    pub fn bump(&mut self, state: JobState) {
        *self.slot(state) += 1;
        self.all += 1;
    }

    /// Overwrite one slot from an aggregate row; `None` is the rollup.
    pub fn set(&mut self, state: Option<JobState>, size: u64) {
        match state {
            Some(state) => *self.slot(state) = size,
            None => self.all = size,
        }
    }
}

/// Point-in-time counts of jobs per state, globally and per queue.
///
/// Ephemeral: computed on demand from the job table, never persisted. Queues
/// with no rows are omitted from `queues`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StateSnapshot {
    #[serde(flatten)]
    pub counts: StateCounts,
    pub queues: HashMap<String, StateCounts>,
}

impl StateSnapshot {
    /// Fold in one aggregate row. `queue = None` targets the global counts,
    /// `state = None` the `all` rollup.
    pub fn record(&mut self, queue: Option<&str>, state: Option<JobState>, size: u64) {
        let counts = match queue {
            Some(name) => self.queues.entry(name.to_string()).or_default(),
            None => &mut self.counts,
        };
        counts.set(state, size);
    }

    /// Count one live job row (used by stores that aggregate in process).
    pub fn bump(&mut self, queue: &str, state: JobState) {
        self.counts.bump(state);
        self.queues.entry(queue.to_string()).or_default().bump(state);
    }
}
