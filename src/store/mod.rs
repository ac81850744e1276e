//! Persistence seam for benchmarks, import jobs and data points.
//!
//! Two guarantees every implementation must keep, because chunk invocations
//! may overlap or repeat:
//! - `insert_data_points` is a set union on `(benchmark_id, source_row)`;
//!   duplicates are skipped, never errors.
//! - job progress never decreases, and terminal phases are never left.

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::Result;
use crate::metrics::Metric;
use crate::models::{Benchmark, BenchmarkKind, BenchmarkStatus, DataPoint, ImportJob, JobPhase, RowError};
use crate::segment::SegmentFilter;

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

/// Partial update of a job ledger row. `None` leaves a column untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobUpdate {
    pub phase: Option<JobPhase>,
    pub progress: Option<i32>,
    pub total_rows: Option<i64>,
    pub processed_rows: Option<i64>,
    pub error_message: Option<String>,
    pub mark_started: bool,
    pub mark_completed: bool,
}

#[async_trait]
pub trait BenchmarkStore: Send + Sync {
    async fn create_benchmark(&self, name: &str, kind: BenchmarkKind) -> Result<Benchmark>;

    async fn get_benchmark(&self, id: Uuid) -> Result<Benchmark>;

    async fn list_benchmarks(&self) -> Result<Vec<Benchmark>>;

    async fn set_benchmark_status(
        &self,
        id: Uuid,
        status: BenchmarkStatus,
        row_count: Option<i64>,
    ) -> Result<()>;

    async fn delete_benchmark(&self, id: Uuid) -> Result<bool>;

    async fn create_job(&self, benchmark_id: Uuid, file_location: &str) -> Result<ImportJob>;

    async fn get_job(&self, id: Uuid) -> Result<ImportJob>;

    async fn update_job(&self, id: Uuid, update: JobUpdate) -> Result<()>;

    /// Appends row errors, keeping at most `max_recorded` in the list while
    /// `error_count` tracks the full total.
    async fn append_job_errors(&self, id: Uuid, errors: &[RowError], max_recorded: usize)
        -> Result<()>;

    async fn request_cancel(&self, id: Uuid) -> Result<()>;

    async fn insert_data_points(&self, points: &[DataPoint]) -> Result<u64>;

    async fn count_data_points(&self, benchmark_id: Uuid) -> Result<i64>;

    async fn metric_values(
        &self,
        benchmark_id: Uuid,
        filter: &SegmentFilter,
        metric: Metric,
    ) -> Result<Vec<f64>>;

    async fn metric_pairs(
        &self,
        benchmark_id: Uuid,
        filter: &SegmentFilter,
        x: Metric,
        y: Metric,
    ) -> Result<Vec<(f64, f64)>>;
}
