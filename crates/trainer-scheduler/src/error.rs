use thiserror::Error;

use trainer_core::CoreError;

/// Errors that can occur within the scheduler subsystem.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Underlying SQLite / rusqlite error. Always surfaced to the caller of
    /// `schedule()` / `cancel()`; the engine never falls back to memory.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// The provided trigger is invalid or unsupported.
    #[error("Invalid schedule: {0}")]
    InvalidSchedule(String),

    /// The trigger has no occurrence after now, so the job could never fire.
    #[error("Trigger for job {id} has no future occurrence")]
    TriggerExhausted { id: String },

    /// No job with the given ID exists in the store.
    #[error("Job not found: {id}")]
    JobNotFound { id: String },

    /// The weekly entry or the engine wiring is unusable.
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Core(#[from] CoreError),
}

pub type Result<T> = std::result::Result<T, SchedulerError>;
