//! PostgreSQL-backed store.
//!
//! Every mutation is a single statement. Claims rely on
//! `FOR UPDATE SKIP LOCKED` so concurrent fetches across processes partition
//! the eligible set; dedup relies on partial unique indexes plus
//! `ON CONFLICT DO NOTHING`; the archive sweep is a `DELETE ... RETURNING`
//! feeding an `INSERT` in one statement. The retry-budget arithmetic lives in
//! `CASE` expressions so fail/expire decisions are race-free under concurrent
//! mutation.

use crate::{
    MillstoneError, Result,
    archive::ArchivedJob,
    job::{Job, JobId, JobState},
    queue::JobStore,
    stats::StateSnapshot,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPool;
use std::time::Duration;

/// Job store over a PostgreSQL connection pool.
///
/// # Examples
///
/// ```rust,no_run
/// use millstone::{Job, queue::JobStore, queue::postgres::PostgresQueue};
/// use serde_json::json;
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let pool = sqlx::PgPool::connect("postgresql://localhost/millstone").await?;
/// let store = PostgresQueue::new(pool);
/// store.create_tables().await?;
///
/// let job_id = store.send(Job::new("email", json!({"to": "user@example.com"}))).await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct PostgresQueue {
    pool: PgPool,
}

impl PostgresQueue {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

const JOB_COLUMNS: &str = "id, queue_name, payload, state, priority, retry_limit, retry_count, \
     retry_delay, retry_backoff, start_after, started_on, singleton_key, singleton_on, \
     expire_in, created_on, completed_on, keep_until, on_complete, output";

#[derive(sqlx::FromRow)]
struct JobRow {
    id: uuid::Uuid,
    queue_name: String,
    payload: serde_json::Value,
    state: String,
    priority: i32,
    retry_limit: i32,
    retry_count: i32,
    retry_delay: i64,
    retry_backoff: bool,
    start_after: DateTime<Utc>,
    started_on: Option<DateTime<Utc>>,
    singleton_key: Option<String>,
    singleton_on: Option<DateTime<Utc>>,
    expire_in: i64,
    created_on: DateTime<Utc>,
    completed_on: Option<DateTime<Utc>>,
    keep_until: DateTime<Utc>,
    on_complete: bool,
    output: Option<serde_json::Value>,
}

impl JobRow {
    fn into_job(self) -> Result<Job> {
        let state = JobState::parse(&self.state).ok_or_else(|| MillstoneError::Queue {
            message: format!("unknown job state in store: {}", self.state),
        })?;
        Ok(Job {
            id: self.id,
            queue_name: self.queue_name,
            payload: self.payload,
            state,
            priority: self.priority,
            retry_limit: self.retry_limit,
            retry_count: self.retry_count,
            retry_delay: Duration::from_secs(self.retry_delay.max(0) as u64),
            retry_backoff: self.retry_backoff,
            start_after: self.start_after,
            started_on: self.started_on,
            singleton_key: self.singleton_key,
            singleton_on: self.singleton_on,
            expire_in: Duration::from_secs(self.expire_in.max(0) as u64),
            created_on: self.created_on,
            completed_on: self.completed_on,
            keep_until: self.keep_until,
            on_complete: self.on_complete,
            output: self.output,
            singleton_window: None,
            singleton_next_slot: false,
        })
    }
}

#[derive(sqlx::FromRow)]
struct ArchivedJobRow {
    #[sqlx(flatten)]
    job: JobRow,
    archived_on: DateTime<Utc>,
}

#[async_trait]
impl JobStore for PostgresQueue {
    async fn create_tables(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS millstone_jobs (
                id UUID PRIMARY KEY,
                queue_name TEXT NOT NULL,
                payload JSONB NOT NULL,
                state TEXT NOT NULL DEFAULT 'created',
                priority INTEGER NOT NULL DEFAULT 0,
                retry_limit INTEGER NOT NULL DEFAULT 0,
                retry_count INTEGER NOT NULL DEFAULT 0,
                retry_delay BIGINT NOT NULL DEFAULT 0,
                retry_backoff BOOLEAN NOT NULL DEFAULT FALSE,
                start_after TIMESTAMPTZ NOT NULL DEFAULT now(),
                started_on TIMESTAMPTZ,
                singleton_key TEXT,
                singleton_on TIMESTAMPTZ,
                expire_in BIGINT NOT NULL DEFAULT 900,
                created_on TIMESTAMPTZ NOT NULL DEFAULT now(),
                completed_on TIMESTAMPTZ,
                keep_until TIMESTAMPTZ NOT NULL DEFAULT now() + interval '14 days',
                on_complete BOOLEAN NOT NULL DEFAULT FALSE,
                output JSONB
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS millstone_jobs_fetch_idx
            ON millstone_jobs (queue_name, priority DESC, start_after, id)
            WHERE state IN ('created', 'retry')
            "#,
        )
        .execute(&self.pool)
        .await?;

        // One live job per (queue, key) when no time bucket is used.
        sqlx::query(
            r#"
            CREATE UNIQUE INDEX IF NOT EXISTS millstone_jobs_singleton_key_idx
            ON millstone_jobs (queue_name, singleton_key)
            WHERE singleton_key IS NOT NULL
              AND singleton_on IS NULL
              AND state IN ('created', 'retry', 'active')
            "#,
        )
        .execute(&self.pool)
        .await?;

        // One job per (queue, key, bucket); completed rows still occupy the
        // bucket so throttled sends stay rate-limited.
        sqlx::query(
            r#"
            CREATE UNIQUE INDEX IF NOT EXISTS millstone_jobs_singleton_on_idx
            ON millstone_jobs (queue_name, singleton_key, singleton_on)
            WHERE singleton_key IS NOT NULL
              AND singleton_on IS NOT NULL
              AND state NOT IN ('expired', 'cancelled', 'failed')
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS millstone_archive (
                id UUID PRIMARY KEY,
                queue_name TEXT NOT NULL,
                payload JSONB NOT NULL,
                state TEXT NOT NULL,
                priority INTEGER NOT NULL,
                retry_limit INTEGER NOT NULL,
                retry_count INTEGER NOT NULL,
                retry_delay BIGINT NOT NULL,
                retry_backoff BOOLEAN NOT NULL,
                start_after TIMESTAMPTZ NOT NULL,
                started_on TIMESTAMPTZ,
                singleton_key TEXT,
                singleton_on TIMESTAMPTZ,
                expire_in BIGINT NOT NULL,
                created_on TIMESTAMPTZ NOT NULL,
                completed_on TIMESTAMPTZ,
                keep_until TIMESTAMPTZ NOT NULL,
                on_complete BOOLEAN NOT NULL,
                output JSONB,
                archived_on TIMESTAMPTZ NOT NULL DEFAULT now()
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS millstone_archive_archived_on_idx
            ON millstone_archive (archived_on)
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn insert_job(&self, job: &Job) -> Result<Option<JobId>> {
        let inserted = sqlx::query(
            r#"
            INSERT INTO millstone_jobs (
                id, queue_name, payload, state, priority, retry_limit, retry_count,
                retry_delay, retry_backoff, start_after, singleton_key, singleton_on,
                expire_in, created_on, keep_until, on_complete
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(job.id)
        .bind(&job.queue_name)
        .bind(&job.payload)
        .bind(job.state.as_str())
        .bind(job.priority)
        .bind(job.retry_limit)
        .bind(job.retry_count)
        .bind(job.retry_delay.as_secs() as i64)
        .bind(job.retry_backoff)
        .bind(job.start_after)
        .bind(&job.singleton_key)
        .bind(job.singleton_on)
        .bind(job.expire_in.as_secs() as i64)
        .bind(job.created_on)
        .bind(job.keep_until)
        .bind(job.on_complete)
        .execute(&self.pool)
        .await?
        .rows_affected();

        Ok((inserted > 0).then_some(job.id))
    }

    async fn fetch(&self, queue_name: &str, batch_size: u32) -> Result<Vec<Job>> {
        let rows = sqlx::query_as::<_, JobRow>(
            r#"
            WITH eligible AS (
                SELECT id FROM millstone_jobs
                WHERE queue_name = $1
                  AND state IN ('created', 'retry')
                  AND start_after <= now()
                ORDER BY priority DESC, start_after ASC, id ASC
                FOR UPDATE SKIP LOCKED
                LIMIT $2
            )
            UPDATE millstone_jobs j
            SET state = 'active', started_on = now()
            FROM eligible
            WHERE j.id = eligible.id
            RETURNING j.*
            "#,
        )
        .bind(queue_name)
        .bind(batch_size as i64)
        .fetch_all(&self.pool)
        .await?;

        let mut jobs = rows
            .into_iter()
            .map(JobRow::into_job)
            .collect::<Result<Vec<_>>>()?;
        // UPDATE ... RETURNING does not preserve the claim ordering.
        jobs.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then(a.start_after.cmp(&b.start_after))
                .then(a.id.cmp(&b.id))
        });
        Ok(jobs)
    }

    async fn complete(&self, ids: &[JobId], output: Option<serde_json::Value>) -> Result<u64> {
        let count: i64 = sqlx::query_scalar(
            r#"
            WITH done AS (
                UPDATE millstone_jobs
                SET state = 'completed', completed_on = now(), output = $2
                WHERE id = ANY($1) AND state = 'active'
                RETURNING id, queue_name, payload, on_complete
            ), notified AS (
                INSERT INTO millstone_jobs (
                    id, queue_name, payload, state, priority, retry_limit, retry_count,
                    retry_delay, retry_backoff, start_after, expire_in, created_on,
                    keep_until, on_complete
                )
                SELECT gen_random_uuid(),
                       '__completed__' || queue_name,
                       jsonb_build_object(
                           'request', jsonb_build_object('id', id, 'queue', queue_name, 'payload', payload),
                           'response', $2::jsonb,
                           'state', 'completed'
                       ),
                       'created', 0, 2, 0, 30, FALSE, now(), 900, now(),
                       now() + interval '14 days', FALSE
                FROM done
                WHERE on_complete
            )
            SELECT count(*) FROM done
            "#,
        )
        .bind(ids)
        .bind(output)
        .fetch_one(&self.pool)
        .await?;

        Ok(count.max(0) as u64)
    }

    async fn fail(&self, ids: &[JobId], output: Option<serde_json::Value>) -> Result<u64> {
        let affected = sqlx::query(
            r#"
            UPDATE millstone_jobs
            SET state = CASE WHEN retry_count < retry_limit THEN 'retry' ELSE 'failed' END,
                retry_count = CASE WHEN retry_count < retry_limit THEN retry_count + 1 ELSE retry_count END,
                completed_on = CASE WHEN retry_count < retry_limit THEN NULL ELSE now() END,
                started_on = CASE WHEN retry_count < retry_limit THEN NULL ELSE started_on END,
                start_after = CASE
                    WHEN retry_count >= retry_limit THEN start_after
                    WHEN NOT retry_backoff THEN now() + make_interval(secs => retry_delay * (retry_count + 1))
                    ELSE now() + make_interval(secs =>
                        retry_delay * 2 ^ LEAST(retry_count + 1, 16) / 2
                        + retry_delay * 2 ^ LEAST(retry_count + 1, 16) / 2 * random())
                END,
                output = $2
            WHERE id = ANY($1) AND state = 'active'
            "#,
        )
        .bind(ids)
        .bind(output)
        .execute(&self.pool)
        .await?
        .rows_affected();

        Ok(affected)
    }

    async fn cancel(&self, ids: &[JobId]) -> Result<u64> {
        let affected = sqlx::query(
            r#"
            UPDATE millstone_jobs
            SET state = 'cancelled', completed_on = now(), started_on = NULL
            WHERE id = ANY($1) AND state IN ('created', 'retry', 'active')
            "#,
        )
        .bind(ids)
        .execute(&self.pool)
        .await?
        .rows_affected();

        Ok(affected)
    }

    async fn expire(&self) -> Result<u64> {
        let affected = sqlx::query(
            r#"
            UPDATE millstone_jobs
            SET state = CASE WHEN retry_count < retry_limit THEN 'retry' ELSE 'expired' END,
                retry_count = CASE WHEN retry_count < retry_limit THEN retry_count + 1 ELSE retry_count END,
                completed_on = CASE WHEN retry_count < retry_limit THEN NULL ELSE now() END,
                started_on = CASE WHEN retry_count < retry_limit THEN NULL ELSE started_on END,
                start_after = CASE
                    WHEN retry_count >= retry_limit THEN start_after
                    WHEN NOT retry_backoff THEN now() + make_interval(secs => retry_delay * (retry_count + 1))
                    ELSE now() + make_interval(secs =>
                        retry_delay * 2 ^ LEAST(retry_count + 1, 16) / 2
                        + retry_delay * 2 ^ LEAST(retry_count + 1, 16) / 2 * random())
                END
            WHERE state = 'active'
              AND started_on + make_interval(secs => expire_in) < now()
            "#,
        )
        .execute(&self.pool)
        .await?
        .rows_affected();

        Ok(affected)
    }

    async fn archive(&self, retention: Duration) -> Result<u64> {
        let moved = sqlx::query(
            r#"
            WITH moved AS (
                DELETE FROM millstone_jobs
                WHERE (state IN ('completed', 'expired', 'cancelled', 'failed')
                       AND completed_on < now() - make_interval(secs => $1))
                   OR keep_until < now()
                RETURNING id, queue_name, payload, state, priority, retry_limit, retry_count,
                          retry_delay, retry_backoff, start_after, started_on, singleton_key,
                          singleton_on, expire_in, created_on, completed_on, keep_until,
                          on_complete, output
            )
            INSERT INTO millstone_archive (
                id, queue_name, payload, state, priority, retry_limit, retry_count,
                retry_delay, retry_backoff, start_after, started_on, singleton_key,
                singleton_on, expire_in, created_on, completed_on, keep_until,
                on_complete, output, archived_on
            )
            SELECT id, queue_name, payload, state, priority, retry_limit, retry_count,
                   retry_delay, retry_backoff, start_after, started_on, singleton_key,
                   singleton_on, expire_in, created_on, completed_on, keep_until,
                   on_complete, output, now()
            FROM moved
            "#,
        )
        .bind(retention.as_secs_f64())
        .execute(&self.pool)
        .await?
        .rows_affected();

        Ok(moved)
    }

    async fn purge(&self, retention: Duration) -> Result<u64> {
        let deleted =
            sqlx::query("DELETE FROM millstone_archive WHERE archived_on < now() - make_interval(secs => $1)")
                .bind(retention.as_secs_f64())
                .execute(&self.pool)
                .await?
                .rows_affected();

        Ok(deleted)
    }

    async fn count_states(&self) -> Result<StateSnapshot> {
        let rows: Vec<(Option<String>, Option<String>, i64)> = sqlx::query_as(
            r#"
            SELECT queue_name, state, count(*) AS size
            FROM millstone_jobs
            GROUP BY GROUPING SETS ((queue_name, state), (queue_name), (state), ())
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut snapshot = StateSnapshot::default();
        for (queue_name, state, size) in rows {
            let state = match state.as_deref() {
                Some(s) => Some(JobState::parse(s).ok_or_else(|| MillstoneError::Queue {
                    message: format!("unknown job state in store: {s}"),
                })?),
                None => None,
            };
            snapshot.record(queue_name.as_deref(), state, size.max(0) as u64);
        }
        Ok(snapshot)
    }

    async fn get_job(&self, id: JobId) -> Result<Option<Job>> {
        let row = sqlx::query_as::<_, JobRow>(&format!(
            "SELECT {JOB_COLUMNS} FROM millstone_jobs WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(JobRow::into_job).transpose()
    }

    async fn get_archived_job(&self, id: JobId) -> Result<Option<ArchivedJob>> {
        let row = sqlx::query_as::<_, ArchivedJobRow>(&format!(
            "SELECT {JOB_COLUMNS}, archived_on FROM millstone_archive WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| {
            Ok(ArchivedJob {
                job: r.job.into_job()?,
                archived_on: r.archived_on,
            })
        })
        .transpose()
    }
}
