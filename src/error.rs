use thiserror::Error;

#[derive(Error, Debug)]
pub enum MillstoneError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Job not found: {id}")]
    JobNotFound { id: String },

    #[error("Queue error: {message}")]
    Queue { message: String },

    #[error("Worker error: {message}")]
    Worker { message: String },

    #[error("Supervisor error: {message}")]
    Supervisor { message: String },

    #[error("Handler error: {0}")]
    Handler(String),
}

impl MillstoneError {
    /// Wrap an arbitrary handler failure so it can travel through the worker loop.
    pub fn handler<E: std::fmt::Display>(err: E) -> Self {
        MillstoneError::Handler(err.to_string())
    }
}
