//! # Millstone
//!
//! A durable, database-driven job queue for Rust. The backing relational
//! store is the single source of truth for job state, concurrency control,
//! and crash recovery: claims are single atomic statements with row-lock skip
//! semantics, so any number of consumer processes can fetch from the same
//! queue without ever executing a job twice concurrently.
//!
//! ## Features
//!
//! - **Atomic claims**: `FOR UPDATE SKIP LOCKED` batch fetch; no two
//!   consumers, in any process, receive the same job
//! - **Deduplication**: singleton keys with debounce and throttle windows;
//!   conflicting sends are suppressed, not errors
//! - **Retry with backoff**: linear or exponential-with-jitter delays,
//!   computed race-free inside the store transition
//! - **Self-scheduling maintenance**: expiry, archival, and purge sweeps
//!   driven by the queue itself — no external cron service, safe across a
//!   fleet of cooperating processes
//! - **Observability**: an event emitter for sweep results and faults, plus
//!   `tracing` instrumentation throughout
//! - **Async/await**: built on Tokio and sqlx
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! # #[cfg(feature = "postgres")]
//! # async fn demo() -> std::result::Result<(), Box<dyn std::error::Error>> {
//! use millstone::{Job, PostgresQueue, Supervisor, SupervisorConfig, Worker};
//! use millstone::{queue::JobStore, worker::BatchHandler};
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! let pool = sqlx::PgPool::connect("postgresql://localhost/millstone").await?;
//! let store = Arc::new(PostgresQueue::new(pool));
//! store.create_tables().await?;
//!
//! // Housekeeping: expire/archive/purge sweeps schedule themselves.
//! let supervisor = Supervisor::new(store.clone(), SupervisorConfig::default());
//! supervisor.supervise().await?;
//!
//! // Produce.
//! store.send(Job::new("email", json!({"to": "user@example.com"}))).await?;
//!
//! // Consume.
//! let handler: BatchHandler = Arc::new(|jobs| {
//!     Box::pin(async move {
//!         for job in jobs {
//!             println!("processing {}: {:?}", job.id, job.payload);
//!         }
//!         Ok(())
//!     })
//! });
//! let worker = Worker::new(store.clone(), "email", handler).with_batch_size(10);
//! let handle = worker.spawn();
//!
//! // ... on shutdown:
//! handle.stop().await?;
//! supervisor.stop().await;
//! # Ok(())
//! # }
//! # fn main() {}
//! ```
//!
//! ## Delivery semantics
//!
//! At-least-once: a consumer that crashes mid-job leaves it `active` until the
//! expire sweep returns it to the queue, so handlers must be idempotent or
//! tolerate rare duplicate execution after crash recovery. Duplicate *sends*
//! are suppressed with explicit dedup keys (see [`Job::with_singleton_key`]).
//!
//! ## Feature Flags
//!
//! - `postgres` — PostgreSQL store backend
//! - `test` — in-memory store backend with a controllable clock

pub mod archive;
pub mod config;
pub mod error;
pub mod events;
pub mod job;
pub mod queue;
pub mod retry;
pub mod stats;
pub mod supervisor;
pub mod worker;

pub use archive::ArchivedJob;
pub use config::{JobDefaults, SupervisorConfig};
pub use error::MillstoneError;
pub use events::{EventEmitter, EventKind, QueueEvent};
pub use job::{Job, JobId, JobState};
pub use queue::JobStore;
pub use stats::{StateCounts, StateSnapshot};
pub use supervisor::{MAINTENANCE_QUEUE, MONITOR_STATES_QUEUE, Supervisor};
pub use worker::{BatchHandler, Worker, WorkerHandle, WorkerPool};

#[cfg(feature = "postgres")]
pub use queue::postgres::PostgresQueue;

/// Convenient type alias for Results with [`MillstoneError`] as the error type.
pub type Result<T> = std::result::Result<T, MillstoneError>;
