use std::path::PathBuf;

use thiserror::Error;
use uuid::Uuid;

use crate::models::JobPhase;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("IO error reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse source file: {0}")]
    Source(String),

    #[error("Configuration error: {message}")]
    Configuration { message: String },

    #[error("Invalid segment '{segment}': {reason}")]
    InvalidSegment { segment: String, reason: String },

    #[error("Unknown metric '{0}'")]
    UnknownMetric(String),

    #[error("Segment comparison needs at least 2 segments, got {0}")]
    TooFewSegments(usize),

    #[error("Benchmark {0} not found")]
    BenchmarkNotFound(Uuid),

    #[error("Import job {0} not found")]
    JobNotFound(Uuid),

    #[error("Job {job_id} belongs to benchmark {actual}, not {requested}")]
    JobMismatch {
        job_id: Uuid,
        requested: Uuid,
        actual: Uuid,
    },

    #[error("Invalid phase transition {from} -> {to}")]
    InvalidTransition { from: JobPhase, to: JobPhase },

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
}

impl EngineError {
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            EngineError::Database(
                sqlx::Error::Io(_)
                    | sqlx::Error::PoolTimedOut
                    | sqlx::Error::PoolClosed
                    | sqlx::Error::WorkerCrashed
            )
        )
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
