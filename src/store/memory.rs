use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use super::{BenchmarkStore, JobUpdate};
use crate::error::{EngineError, Result};
use crate::metrics::Metric;
use crate::models::{
    Benchmark, BenchmarkKind, BenchmarkStatus, DataPoint, ImportJob, JobPhase, RowError,
};
use crate::segment::{Condition, SegmentFilter};

#[derive(Debug, Default)]
struct Inner {
    benchmarks: HashMap<Uuid, Benchmark>,
    jobs: HashMap<Uuid, ImportJob>,
    points: BTreeMap<(Uuid, i64), DataPoint>,
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn matching<'a>(
        inner: &'a Inner,
        benchmark_id: Uuid,
        conditions: &'a [Condition],
    ) -> impl Iterator<Item = &'a DataPoint> + 'a {
        inner
            .points
            .range((benchmark_id, i64::MIN)..=(benchmark_id, i64::MAX))
            .map(|(_, point)| point)
            .filter(move |point| conditions.iter().all(|c| c.matches(point)))
    }
}

#[async_trait]
impl BenchmarkStore for MemoryStore {
    async fn create_benchmark(&self, name: &str, kind: BenchmarkKind) -> Result<Benchmark> {
        let now = Utc::now();
        let benchmark = Benchmark {
            id: Uuid::new_v4(),
            name: name.to_string(),
            kind,
            status: BenchmarkStatus::Processing,
            row_count: 0,
            created_at: now,
            updated_at: now,
        };
        self.lock().benchmarks.insert(benchmark.id, benchmark.clone());
        Ok(benchmark)
    }

    async fn get_benchmark(&self, id: Uuid) -> Result<Benchmark> {
        self.lock()
            .benchmarks
            .get(&id)
            .cloned()
            .ok_or(EngineError::BenchmarkNotFound(id))
    }

    async fn list_benchmarks(&self) -> Result<Vec<Benchmark>> {
        let mut benchmarks: Vec<Benchmark> = self.lock().benchmarks.values().cloned().collect();
        benchmarks.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(benchmarks)
    }

    async fn set_benchmark_status(
        &self,
        id: Uuid,
        status: BenchmarkStatus,
        row_count: Option<i64>,
    ) -> Result<()> {
        let mut inner = self.lock();
        let benchmark = inner
            .benchmarks
            .get_mut(&id)
            .ok_or(EngineError::BenchmarkNotFound(id))?;
        benchmark.status = status;
        if let Some(count) = row_count {
            benchmark.row_count = count;
        }
        benchmark.updated_at = Utc::now();
        Ok(())
    }

    async fn delete_benchmark(&self, id: Uuid) -> Result<bool> {
        let mut inner = self.lock();
        let existed = inner.benchmarks.remove(&id).is_some();
        inner.jobs.retain(|_, job| job.benchmark_id != id);
        inner.points.retain(|(benchmark_id, _), _| *benchmark_id != id);
        Ok(existed)
    }

    async fn create_job(&self, benchmark_id: Uuid, file_location: &str) -> Result<ImportJob> {
        let mut inner = self.lock();
        if !inner.benchmarks.contains_key(&benchmark_id) {
            return Err(EngineError::BenchmarkNotFound(benchmark_id));
        }
        let job = ImportJob {
            id: Uuid::new_v4(),
            benchmark_id,
            file_location: file_location.to_string(),
            phase: JobPhase::Downloading,
            progress: 0,
            total_rows: 0,
            processed_rows: 0,
            errors: Vec::new(),
            error_count: 0,
            error_message: None,
            cancel_requested: false,
            started_at: None,
            completed_at: None,
        };
        inner.jobs.insert(job.id, job.clone());
        Ok(job)
    }

    async fn get_job(&self, id: Uuid) -> Result<ImportJob> {
        self.lock()
            .jobs
            .get(&id)
            .cloned()
            .ok_or(EngineError::JobNotFound(id))
    }

    async fn update_job(&self, id: Uuid, update: JobUpdate) -> Result<()> {
        let mut inner = self.lock();
        let job = inner.jobs.get_mut(&id).ok_or(EngineError::JobNotFound(id))?;
        if job.phase.is_terminal() {
            return Ok(());
        }
        if let Some(phase) = update.phase {
            job.phase = phase;
        }
        if let Some(progress) = update.progress {
            job.progress = job.progress.max(progress);
        }
        if let Some(total) = update.total_rows {
            job.total_rows = total;
        }
        if let Some(processed) = update.processed_rows {
            job.processed_rows = processed;
        }
        if let Some(message) = update.error_message {
            job.error_message = Some(message);
        }
        if update.mark_started && job.started_at.is_none() {
            job.started_at = Some(Utc::now());
        }
        if update.mark_completed {
            job.completed_at = Some(Utc::now());
        }
        Ok(())
    }

    async fn append_job_errors(
        &self,
        id: Uuid,
        errors: &[RowError],
        max_recorded: usize,
    ) -> Result<()> {
        let mut inner = self.lock();
        let job = inner.jobs.get_mut(&id).ok_or(EngineError::JobNotFound(id))?;
        let room = max_recorded.saturating_sub(job.errors.len());
        job.errors.extend(errors.iter().take(room).cloned());
        job.error_count += errors.len() as i64;
        Ok(())
    }

    async fn request_cancel(&self, id: Uuid) -> Result<()> {
        let mut inner = self.lock();
        let job = inner.jobs.get_mut(&id).ok_or(EngineError::JobNotFound(id))?;
        job.cancel_requested = true;
        Ok(())
    }

    async fn insert_data_points(&self, points: &[DataPoint]) -> Result<u64> {
        let mut inner = self.lock();
        let mut inserted = 0;
        for point in points {
            if !inner.benchmarks.contains_key(&point.benchmark_id) {
                return Err(EngineError::BenchmarkNotFound(point.benchmark_id));
            }
            let key = (point.benchmark_id, point.source_row);
            if !inner.points.contains_key(&key) {
                inner.points.insert(key, point.clone());
                inserted += 1;
            }
        }
        Ok(inserted)
    }

    async fn count_data_points(&self, benchmark_id: Uuid) -> Result<i64> {
        let inner = self.lock();
        Ok(Self::matching(&inner, benchmark_id, &[]).count() as i64)
    }

    async fn metric_values(
        &self,
        benchmark_id: Uuid,
        filter: &SegmentFilter,
        metric: Metric,
    ) -> Result<Vec<f64>> {
        let conditions = filter.conditions()?;
        let inner = self.lock();
        Ok(Self::matching(&inner, benchmark_id, &conditions)
            .filter_map(|point| point.metrics.get(metric))
            .collect())
    }

    async fn metric_pairs(
        &self,
        benchmark_id: Uuid,
        filter: &SegmentFilter,
        x: Metric,
        y: Metric,
    ) -> Result<Vec<(f64, f64)>> {
        let conditions = filter.conditions()?;
        let inner = self.lock();
        Ok(Self::matching(&inner, benchmark_id, &conditions)
            .filter_map(|point| point.metrics.get(x).zip(point.metrics.get(y)))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::MetricValues;
    use crate::models::Demographics;

    fn point(benchmark_id: Uuid, row: i64, region: &str, know: f64) -> DataPoint {
        let mut metrics = MetricValues::default();
        metrics.set(Metric::Know, Some(know));
        DataPoint {
            benchmark_id,
            source_row: row,
            demographics: Demographics {
                region: Some(region.to_string()),
                ..Demographics::default()
            },
            metrics,
        }
    }

    #[tokio::test]
    async fn duplicate_inserts_are_skipped() {
        let store = MemoryStore::new();
        let benchmark = store.create_benchmark("norms", BenchmarkKind::External).await.unwrap();
        let batch: Vec<_> = (0..5).map(|i| point(benchmark.id, i, "EU", 100.0)).collect();

        assert_eq!(store.insert_data_points(&batch).await.unwrap(), 5);
        assert_eq!(store.insert_data_points(&batch).await.unwrap(), 0);
        let overlap: Vec<_> = (3..8).map(|i| point(benchmark.id, i, "EU", 90.0)).collect();
        assert_eq!(store.insert_data_points(&overlap).await.unwrap(), 3);
        assert_eq!(store.count_data_points(benchmark.id).await.unwrap(), 8);

        // First write wins; data points are never updated.
        let values = store
            .metric_values(benchmark.id, &SegmentFilter::default(), Metric::Know)
            .await
            .unwrap();
        assert_eq!(values.iter().filter(|v| **v == 100.0).count(), 5);
    }

    #[tokio::test]
    async fn progress_is_monotonic_and_terminal_phases_stick() {
        let store = MemoryStore::new();
        let benchmark = store.create_benchmark("norms", BenchmarkKind::External).await.unwrap();
        let job = store.create_job(benchmark.id, "norms.csv").await.unwrap();

        let set = |progress| JobUpdate {
            progress: Some(progress),
            ..JobUpdate::default()
        };
        store.update_job(job.id, set(40)).await.unwrap();
        store.update_job(job.id, set(20)).await.unwrap();
        assert_eq!(store.get_job(job.id).await.unwrap().progress, 40);

        store
            .update_job(
                job.id,
                JobUpdate {
                    phase: Some(JobPhase::Failed),
                    ..JobUpdate::default()
                },
            )
            .await
            .unwrap();
        store
            .update_job(
                job.id,
                JobUpdate {
                    phase: Some(JobPhase::Importing),
                    progress: Some(80),
                    ..JobUpdate::default()
                },
            )
            .await
            .unwrap();
        let job = store.get_job(job.id).await.unwrap();
        assert_eq!((job.phase, job.progress), (JobPhase::Failed, 40));
    }

    #[tokio::test]
    async fn error_list_is_capped_but_counted() {
        let store = MemoryStore::new();
        let benchmark = store.create_benchmark("norms", BenchmarkKind::External).await.unwrap();
        let job = store.create_job(benchmark.id, "norms.csv").await.unwrap();
        let errors: Vec<_> = (0..5)
            .map(|row| RowError {
                row,
                message: "bad".into(),
            })
            .collect();
        store.append_job_errors(job.id, &errors, 3).await.unwrap();
        store.append_job_errors(job.id, &errors, 3).await.unwrap();
        let job = store.get_job(job.id).await.unwrap();
        assert_eq!(job.errors.len(), 3);
        assert_eq!(job.error_count, 10);
    }

    #[tokio::test]
    async fn delete_cascades() {
        let store = MemoryStore::new();
        let keep = store.create_benchmark("keep", BenchmarkKind::Internal).await.unwrap();
        let doomed = store.create_benchmark("doomed", BenchmarkKind::External).await.unwrap();
        let job = store.create_job(doomed.id, "x.csv").await.unwrap();
        store
            .insert_data_points(&[point(keep.id, 0, "EU", 1.0), point(doomed.id, 0, "EU", 2.0)])
            .await
            .unwrap();

        assert!(store.delete_benchmark(doomed.id).await.unwrap());
        assert!(!store.delete_benchmark(doomed.id).await.unwrap());
        assert!(store.get_job(job.id).await.is_err());
        assert_eq!(store.count_data_points(doomed.id).await.unwrap(), 0);
        assert_eq!(store.count_data_points(keep.id).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn filters_apply_to_reads() {
        let store = MemoryStore::new();
        let benchmark = store.create_benchmark("norms", BenchmarkKind::External).await.unwrap();
        store
            .insert_data_points(&[
                point(benchmark.id, 0, "EU", 80.0),
                point(benchmark.id, 1, "LatAm", 88.0),
                point(benchmark.id, 2, "EU", 82.0),
            ])
            .await
            .unwrap();
        let eu: SegmentFilter = "region=EU".parse().unwrap();
        let mut values = store.metric_values(benchmark.id, &eu, Metric::Know).await.unwrap();
        values.sort_by(f64::total_cmp);
        assert_eq!(values, vec![80.0, 82.0]);
        let pairs = store
            .metric_pairs(benchmark.id, &eu, Metric::Know, Metric::Wellbeing)
            .await
            .unwrap();
        assert!(pairs.is_empty());
    }
}
