//! Archived job records.
//!
//! The maintenance supervisor's archive sweep moves terminal rows (and rows
//! whose `keep_until` has lapsed) out of the live table into the archive
//! table; the purge sweep deletes them from the archive after a second, longer
//! retention window.

use crate::job::Job;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A job moved out of the live table, exactly as it last was, plus the
/// archival timestamp.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchivedJob {
    #[serde(flatten)]
    pub job: Job,
    pub archived_on: DateTime<Utc>,
}
