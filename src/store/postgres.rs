use async_trait::async_trait;
use sqlx::postgres::PgRow;
use sqlx::types::Json;
use sqlx::{PgPool, Postgres, QueryBuilder, Row};
use uuid::Uuid;

use super::{BenchmarkStore, JobUpdate};
use crate::error::{EngineError, Result};
use crate::metrics::Metric;
use crate::models::{
    Benchmark, BenchmarkKind, BenchmarkStatus, DataPoint, ImportJob, JobPhase, RowError,
};
use crate::segment::{Condition, FilterValue, SegmentFilter};

const DEMOGRAPHIC_COLUMNS: &str = "country, region, sector, job_function, role, age, gender, \
     education, generation, year, month, quarter, survey_date";

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }
}

fn decode_err(message: String) -> EngineError {
    EngineError::Database(sqlx::Error::Decode(message.into()))
}

fn benchmark_from_row(row: &PgRow) -> Result<Benchmark> {
    let kind: String = row.try_get("kind")?;
    let status: String = row.try_get("status")?;
    Ok(Benchmark {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        kind: kind.parse().map_err(decode_err)?,
        status: status.parse().map_err(decode_err)?,
        row_count: row.try_get("row_count")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn job_from_row(row: &PgRow) -> Result<ImportJob> {
    let phase: String = row.try_get("phase")?;
    let errors: Json<Vec<RowError>> = row.try_get("errors")?;
    Ok(ImportJob {
        id: row.try_get("id")?,
        benchmark_id: row.try_get("benchmark_id")?,
        file_location: row.try_get("file_location")?,
        phase: phase.parse().map_err(decode_err)?,
        progress: row.try_get("progress")?,
        total_rows: row.try_get("total_rows")?,
        processed_rows: row.try_get("processed_rows")?,
        errors: errors.0,
        error_count: row.try_get("error_count")?,
        error_message: row.try_get("error_message")?,
        cancel_requested: row.try_get("cancel_requested")?,
        started_at: row.try_get("started_at")?,
        completed_at: row.try_get("completed_at")?,
    })
}

fn push_conditions(query: &mut QueryBuilder<'_, Postgres>, conditions: Vec<Condition>) {
    for condition in conditions {
        match condition {
            Condition::Equals { field, value } => {
                query.push(format!(" AND {} = ", field.column()));
                match value {
                    FilterValue::Text(text) => query.push_bind(text),
                    FilterValue::Int(int) => query.push_bind(int),
                };
            }
            Condition::AnyOf { field, values } => {
                query.push(format!(" AND {} = ANY(", field.column()));
                query.push_bind(values);
                query.push(")");
            }
            Condition::DateRange { start, end } => {
                query.push(" AND survey_date >= ");
                query.push_bind(start);
                query.push(" AND survey_date < ");
                query.push_bind(end);
            }
        }
    }
}

#[async_trait]
impl BenchmarkStore for PgStore {
    async fn create_benchmark(&self, name: &str, kind: BenchmarkKind) -> Result<Benchmark> {
        let row = sqlx::query(
            r#"
            INSERT INTO benchmark_engine.benchmarks (id, name, kind, status)
            VALUES ($1, $2, $3, $4)
            RETURNING id, name, kind, status, row_count, created_at, updated_at
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(name)
        .bind(kind.as_str())
        .bind(BenchmarkStatus::Processing.as_str())
        .fetch_one(&self.pool)
        .await?;
        benchmark_from_row(&row)
    }

    async fn get_benchmark(&self, id: Uuid) -> Result<Benchmark> {
        let row = sqlx::query(
            "SELECT id, name, kind, status, row_count, created_at, updated_at \
             FROM benchmark_engine.benchmarks WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(EngineError::BenchmarkNotFound(id))?;
        benchmark_from_row(&row)
    }

    async fn list_benchmarks(&self) -> Result<Vec<Benchmark>> {
        let rows = sqlx::query(
            "SELECT id, name, kind, status, row_count, created_at, updated_at \
             FROM benchmark_engine.benchmarks ORDER BY created_at DESC",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(benchmark_from_row).collect()
    }

    async fn set_benchmark_status(
        &self,
        id: Uuid,
        status: BenchmarkStatus,
        row_count: Option<i64>,
    ) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE benchmark_engine.benchmarks
            SET status = $2, row_count = COALESCE($3, row_count), updated_at = now()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(status.as_str())
        .bind(row_count)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(EngineError::BenchmarkNotFound(id));
        }
        Ok(())
    }

    async fn delete_benchmark(&self, id: Uuid) -> Result<bool> {
        let result = sqlx::query("DELETE FROM benchmark_engine.benchmarks WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn create_job(&self, benchmark_id: Uuid, file_location: &str) -> Result<ImportJob> {
        let row = sqlx::query(
            r#"
            INSERT INTO benchmark_engine.import_jobs (id, benchmark_id, file_location)
            VALUES ($1, $2, $3)
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(benchmark_id)
        .bind(file_location)
        .fetch_one(&self.pool)
        .await?;
        job_from_row(&row)
    }

    async fn get_job(&self, id: Uuid) -> Result<ImportJob> {
        let row = sqlx::query("SELECT * FROM benchmark_engine.import_jobs WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(EngineError::JobNotFound(id))?;
        job_from_row(&row)
    }

    async fn update_job(&self, id: Uuid, update: JobUpdate) -> Result<()> {
        // Terminal phases are sinks and progress is monotonic, so a stale or
        // duplicated chunk cannot move the ledger backwards.
        let result = sqlx::query(
            r#"
            UPDATE benchmark_engine.import_jobs
            SET phase = COALESCE($2, phase),
                progress = GREATEST(progress, COALESCE($3, progress)),
                total_rows = COALESCE($4, total_rows),
                processed_rows = COALESCE($5, processed_rows),
                error_message = COALESCE($6, error_message),
                started_at = CASE WHEN $7 THEN COALESCE(started_at, now()) ELSE started_at END,
                completed_at = CASE WHEN $8 THEN now() ELSE completed_at END
            WHERE id = $1 AND phase NOT IN ('completed', 'failed')
            "#,
        )
        .bind(id)
        .bind(update.phase.map(JobPhase::as_str))
        .bind(update.progress)
        .bind(update.total_rows)
        .bind(update.processed_rows)
        .bind(update.error_message)
        .bind(update.mark_started)
        .bind(update.mark_completed)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            // Either missing or already terminal; only the former is an error.
            self.get_job(id).await?;
        }
        Ok(())
    }

    async fn append_job_errors(
        &self,
        id: Uuid,
        errors: &[RowError],
        max_recorded: usize,
    ) -> Result<()> {
        if errors.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await?;
        let Json(mut recorded): Json<Vec<RowError>> = sqlx::query(
            "SELECT errors FROM benchmark_engine.import_jobs WHERE id = $1 FOR UPDATE",
        )
        .bind(id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or(EngineError::JobNotFound(id))?
        .try_get("errors")?;

        let room = max_recorded.saturating_sub(recorded.len());
        recorded.extend(errors.iter().take(room).cloned());

        sqlx::query(
            r#"
            UPDATE benchmark_engine.import_jobs
            SET errors = $2, error_count = error_count + $3
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(Json(&recorded))
        .bind(errors.len() as i64)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn request_cancel(&self, id: Uuid) -> Result<()> {
        let result = sqlx::query(
            "UPDATE benchmark_engine.import_jobs SET cancel_requested = true WHERE id = $1",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(EngineError::JobNotFound(id));
        }
        Ok(())
    }

    async fn insert_data_points(&self, points: &[DataPoint]) -> Result<u64> {
        if points.is_empty() {
            return Ok(0);
        }
        let metric_columns: Vec<&str> = Metric::ALL.iter().map(|m| m.column()).collect();
        let mut query: QueryBuilder<Postgres> = QueryBuilder::new(format!(
            "INSERT INTO benchmark_engine.data_points (benchmark_id, source_row, {}, {}) ",
            DEMOGRAPHIC_COLUMNS,
            metric_columns.join(", ")
        ));
        query.push_values(points, |mut row, point| {
            let d = &point.demographics;
            row.push_bind(point.benchmark_id)
                .push_bind(point.source_row)
                .push_bind(d.country.clone())
                .push_bind(d.region.clone())
                .push_bind(d.sector.clone())
                .push_bind(d.job_function.clone())
                .push_bind(d.role.clone())
                .push_bind(d.age.clone())
                .push_bind(d.gender.clone())
                .push_bind(d.education.clone())
                .push_bind(d.generation.clone())
                .push_bind(d.year)
                .push_bind(d.month)
                .push_bind(d.quarter)
                .push_bind(d.survey_date);
            for (_, value) in point.metrics.iter() {
                row.push_bind(value);
            }
        });
        query.push(" ON CONFLICT (benchmark_id, source_row) DO NOTHING");

        let result = query.build().execute(&self.pool).await?;
        Ok(result.rows_affected())
    }

    async fn count_data_points(&self, benchmark_id: Uuid) -> Result<i64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM benchmark_engine.data_points WHERE benchmark_id = $1",
        )
        .bind(benchmark_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    async fn metric_values(
        &self,
        benchmark_id: Uuid,
        filter: &SegmentFilter,
        metric: Metric,
    ) -> Result<Vec<f64>> {
        let conditions = filter.conditions()?;
        let column = metric.column();
        let mut query: QueryBuilder<Postgres> = QueryBuilder::new(format!(
            "SELECT {column} FROM benchmark_engine.data_points WHERE benchmark_id = "
        ));
        query.push_bind(benchmark_id);
        query.push(format!(" AND {column} IS NOT NULL"));
        push_conditions(&mut query, conditions);

        let values = query
            .build_query_scalar::<f64>()
            .fetch_all(&self.pool)
            .await?;
        Ok(values)
    }

    async fn metric_pairs(
        &self,
        benchmark_id: Uuid,
        filter: &SegmentFilter,
        x: Metric,
        y: Metric,
    ) -> Result<Vec<(f64, f64)>> {
        let conditions = filter.conditions()?;
        let (x, y) = (x.column(), y.column());
        let mut query: QueryBuilder<Postgres> = QueryBuilder::new(format!(
            "SELECT {x}, {y} FROM benchmark_engine.data_points WHERE benchmark_id = "
        ));
        query.push_bind(benchmark_id);
        query.push(format!(" AND {x} IS NOT NULL AND {y} IS NOT NULL"));
        push_conditions(&mut query, conditions);

        let pairs = query
            .build_query_as::<(f64, f64)>()
            .fetch_all(&self.pool)
            .await?;
        Ok(pairs)
    }
}
