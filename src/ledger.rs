//! The job ledger: one import's phase, progress, counters and errors.
//!
//! The ledger never accumulates counts locally. Processed rows are read back
//! from the store after each write so duplicated or overlapping chunk
//! invocations converge on the same numbers.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{EngineError, Result};
use crate::models::{BenchmarkStatus, ImportJob, JobPhase, RowError};
use crate::store::{BenchmarkStore, JobUpdate};

pub const IMPORT_PROGRESS_CEILING: i32 = 90;

/// `min(15 + round(75 × processed/total), 90)` while importing.
pub fn import_progress(processed: i64, total: i64) -> i32 {
    let floor = JobPhase::Importing.anchor_progress();
    if total <= 0 {
        return IMPORT_PROGRESS_CEILING;
    }
    let ratio = processed.max(0) as f64 / total as f64;
    let progress = floor + (75.0 * ratio).round() as i32;
    progress.min(IMPORT_PROGRESS_CEILING)
}

#[derive(Clone)]
pub struct JobLedger {
    store: Arc<dyn BenchmarkStore>,
    max_recorded_errors: usize,
}

impl JobLedger {
    pub fn new(store: Arc<dyn BenchmarkStore>, max_recorded_errors: usize) -> Self {
        Self {
            store,
            max_recorded_errors,
        }
    }

    pub async fn load(&self, job_id: Uuid, benchmark_id: Uuid) -> Result<ImportJob> {
        let job = self.store.get_job(job_id).await?;
        if job.benchmark_id != benchmark_id {
            return Err(EngineError::JobMismatch {
                job_id,
                requested: benchmark_id,
                actual: job.benchmark_id,
            });
        }
        Ok(job)
    }

    /// Moves the job forward to `phase`. Re-entering the current phase or one
    /// already passed is a no-op; leaving a terminal phase is an error.
    pub async fn advance(&self, job: &mut ImportJob, phase: JobPhase) -> Result<()> {
        if job.phase.is_terminal() && job.phase != phase {
            return Err(EngineError::InvalidTransition {
                from: job.phase,
                to: phase,
            });
        }
        let already_there = job.phase == phase && job.started_at.is_some();
        if already_there || !job.phase.can_advance_to(phase) {
            debug!(job_id = %job.id, current = %job.phase, requested = %phase, "phase already reached");
            return Ok(());
        }

        self.store
            .update_job(
                job.id,
                JobUpdate {
                    phase: Some(phase),
                    progress: Some(phase.anchor_progress()),
                    mark_started: phase == JobPhase::Downloading,
                    mark_completed: phase == JobPhase::Completed,
                    ..JobUpdate::default()
                },
            )
            .await?;
        debug!(job_id = %job.id, from = %job.phase, to = %phase, "job phase advanced");
        job.phase = phase;
        job.progress = job.progress.max(phase.anchor_progress());
        if phase == JobPhase::Downloading {
            job.started_at.get_or_insert_with(Utc::now);
        }
        Ok(())
    }

    pub async fn set_total_rows(&self, job: &mut ImportJob, total_rows: usize) -> Result<()> {
        self.store
            .update_job(
                job.id,
                JobUpdate {
                    total_rows: Some(total_rows as i64),
                    ..JobUpdate::default()
                },
            )
            .await?;
        job.total_rows = total_rows as i64;
        Ok(())
    }

    pub async fn record_progress(&self, job: &mut ImportJob, total_rows: usize) -> Result<i64> {
        let processed = self.store.count_data_points(job.benchmark_id).await?;
        let progress = import_progress(processed, total_rows as i64);
        self.store
            .update_job(
                job.id,
                JobUpdate {
                    processed_rows: Some(processed),
                    progress: Some(progress),
                    ..JobUpdate::default()
                },
            )
            .await?;
        job.processed_rows = processed;
        job.progress = job.progress.max(progress);
        Ok(processed)
    }

    pub async fn record_row_errors(&self, job: &ImportJob, errors: &[RowError]) -> Result<()> {
        if errors.is_empty() {
            return Ok(());
        }
        warn!(job_id = %job.id, count = errors.len(), "row-level errors recorded");
        self.store
            .append_job_errors(job.id, errors, self.max_recorded_errors)
            .await
    }

    pub async fn complete(&self, job: &mut ImportJob, row_count: i64) -> Result<()> {
        self.store
            .set_benchmark_status(job.benchmark_id, BenchmarkStatus::Completed, Some(row_count))
            .await?;
        self.store
            .update_job(
                job.id,
                JobUpdate {
                    processed_rows: Some(row_count),
                    ..JobUpdate::default()
                },
            )
            .await?;
        self.advance(job, JobPhase::Completed).await?;
        info!(job_id = %job.id, benchmark_id = %job.benchmark_id, row_count, "import completed");
        Ok(())
    }

    pub async fn fail(&self, job: &mut ImportJob, message: &str) -> Result<()> {
        if job.phase.is_terminal() {
            return Ok(());
        }
        self.store
            .update_job(
                job.id,
                JobUpdate {
                    phase: Some(JobPhase::Failed),
                    error_message: Some(message.to_string()),
                    mark_completed: true,
                    ..JobUpdate::default()
                },
            )
            .await?;
        self.store
            .set_benchmark_status(job.benchmark_id, BenchmarkStatus::Failed, None)
            .await?;
        job.phase = JobPhase::Failed;
        job.error_message = Some(message.to_string());
        warn!(job_id = %job.id, benchmark_id = %job.benchmark_id, error = message, "import failed");
        Ok(())
    }
}
