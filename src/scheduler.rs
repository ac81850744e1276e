use std::collections::VecDeque;
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::ledger::JobLedger;
use crate::models::{ImportJob, JobPhase};
use crate::persist::BatchPersister;
use crate::source::{FileFormat, RowCache, RowSource, SourceRow};
use crate::store::BenchmarkStore;

/// Trigger payload: which job, which file, where to resume.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkRequest {
    pub benchmark_id: Uuid,
    pub job_id: Uuid,
    pub file_location: String,
    pub start_row: usize,
}

impl ChunkRequest {
    pub fn first(job: &ImportJob) -> Self {
        Self {
            benchmark_id: job.benchmark_id,
            job_id: job.id,
            file_location: job.file_location.clone(),
            start_row: 0,
        }
    }

    fn next(&self, start_row: usize) -> Self {
        Self {
            start_row,
            ..self.clone()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ChunkResponse {
    #[serde(rename_all = "camelCase")]
    InProgress {
        next_start_row: usize,
        processed_rows: i64,
        total_rows: usize,
        progress: i32,
    },
    #[serde(rename_all = "camelCase")]
    Completed { row_count: i64 },
    Failed { message: String },
}

pub struct ChunkScheduler {
    store: Arc<dyn BenchmarkStore>,
    source: Arc<dyn RowSource>,
    cache: RowCache,
    ledger: JobLedger,
    persister: BatchPersister,
    config: EngineConfig,
}

impl ChunkScheduler {
    pub fn new(
        store: Arc<dyn BenchmarkStore>,
        source: Arc<dyn RowSource>,
        config: EngineConfig,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            ledger: JobLedger::new(store.clone(), config.max_recorded_errors),
            persister: BatchPersister::new(store.clone(), config.batch_size),
            cache: RowCache::default(),
            store,
            source,
            config,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// `Err` only for transient store failures; the job is left live so the
    /// same request can be retried. Use [`run_with_retry`] for a final answer.
    pub async fn process_chunk(&self, request: &ChunkRequest) -> Result<ChunkResponse> {
        let mut job = self.ledger.load(request.job_id, request.benchmark_id).await?;

        if let Some(response) = self.terminal_response(&job).await? {
            info!(job_id = %job.id, phase = %job.phase, "chunk trigger for finished job ignored");
            return Ok(response);
        }

        if job.cancel_requested {
            return self.fail(&mut job, "import cancelled").await;
        }

        match self.run_window(&mut job, request).await {
            Ok(response) => Ok(response),
            Err(err) if err.is_transient() && !job.phase.is_terminal() => {
                warn!(job_id = %job.id, start_row = request.start_row, error = %err, "chunk interrupted");
                Err(err)
            }
            Err(err) => self.fail(&mut job, &err.to_string()).await,
        }
    }

    async fn run_window(
        &self,
        job: &mut ImportJob,
        request: &ChunkRequest,
    ) -> Result<ChunkResponse> {
        let first = request.start_row == 0;
        if first {
            self.ledger.advance(job, JobPhase::Downloading).await?;
        }

        let rows = self.rows_for(job, request, first).await?;
        let total = rows.len();
        if first {
            self.ledger.set_total_rows(job, total).await?;
            self.ledger.advance(job, JobPhase::Importing).await?;
        }

        let start = request.start_row.min(total);
        let end = start.saturating_add(self.config.chunk_size).min(total);
        let outcome = self
            .persister
            .persist(job.benchmark_id, &rows[start..end], start)
            .await?;
        self.ledger.record_row_errors(job, &outcome.row_errors).await?;
        let processed = self.ledger.record_progress(job, total).await?;

        info!(
            job_id = %job.id,
            start_row = start,
            end_row = end,
            total_rows = total,
            inserted = outcome.inserted,
            processed_rows = processed,
            progress = job.progress,
            "chunk processed"
        );

        if end < total {
            return Ok(ChunkResponse::InProgress {
                next_start_row: end,
                processed_rows: processed,
                total_rows: total,
                progress: job.progress,
            });
        }
        self.finalize(job).await
    }

    async fn rows_for(
        &self,
        job: &mut ImportJob,
        request: &ChunkRequest,
        first: bool,
    ) -> Result<Arc<Vec<SourceRow>>> {
        if let Some(rows) = self.cache.get(job.id) {
            return Ok(rows);
        }

        let path = Path::new(&request.file_location);
        let format = FileFormat::from_path(path)?;
        let bytes = tokio::fs::read(path).await.map_err(|source| EngineError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        if first {
            self.ledger.advance(job, JobPhase::Parsing).await?;
        }

        let source = self.source.clone();
        let rows = tokio::task::spawn_blocking(move || source.read_rows(&bytes, format))
            .await
            .map_err(|err| EngineError::Source(format!("parser task failed: {err}")))??;
        let rows = Arc::new(rows);
        self.cache.insert(job.id, rows.clone());
        Ok(rows)
    }

    async fn finalize(&self, job: &mut ImportJob) -> Result<ChunkResponse> {
        self.ledger.advance(job, JobPhase::Statistics).await?;
        let row_count = self.store.count_data_points(job.benchmark_id).await?;
        self.ledger.complete(job, row_count).await?;
        self.cache.evict(job.id);
        Ok(ChunkResponse::Completed { row_count })
    }

    async fn abandon(&self, request: &ChunkRequest, message: &str) {
        let outcome = match self.ledger.load(request.job_id, request.benchmark_id).await {
            Ok(mut job) => self.fail(&mut job, message).await.map(|_| ()),
            Err(err) => Err(err),
        };
        if let Err(err) = outcome {
            error!(job_id = %request.job_id, error = %err, "could not record abandoned job");
        }
    }

    async fn fail(&self, job: &mut ImportJob, message: &str) -> Result<ChunkResponse> {
        error!(job_id = %job.id, error = message, "import job failed");
        self.ledger.fail(job, message).await?;
        self.cache.evict(job.id);
        Ok(ChunkResponse::Failed {
            message: message.to_string(),
        })
    }

    async fn terminal_response(&self, job: &ImportJob) -> Result<Option<ChunkResponse>> {
        Ok(match job.phase {
            JobPhase::Completed => {
                let benchmark = self.store.get_benchmark(job.benchmark_id).await?;
                Some(ChunkResponse::Completed {
                    row_count: benchmark.row_count,
                })
            }
            JobPhase::Failed => Some(ChunkResponse::Failed {
                message: job
                    .error_message
                    .clone()
                    .unwrap_or_else(|| "import failed".to_string()),
            }),
            _ => None,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct JobOutcome {
    pub job_id: Uuid,
    pub response: ChunkResponse,
}

/// Background continuation. The worker exits once every handle is dropped and
/// no job it accepted is still in progress.
#[derive(Clone)]
pub struct ChunkQueue {
    sender: mpsc::UnboundedSender<ChunkRequest>,
    outcomes: broadcast::Sender<JobOutcome>,
}

impl ChunkQueue {
    pub fn start(scheduler: Arc<ChunkScheduler>) -> (ChunkQueue, JoinHandle<()>) {
        let (sender, mut receiver) = mpsc::unbounded_channel::<ChunkRequest>();
        let (outcomes, _) = broadcast::channel(64);
        let queue = ChunkQueue {
            sender,
            outcomes: outcomes.clone(),
        };

        let handle = tokio::spawn(async move {
            let mut pending = VecDeque::new();
            loop {
                while let Ok(request) = receiver.try_recv() {
                    pending.push_back(request);
                }
                let request = match pending.pop_front() {
                    Some(request) => request,
                    None => match receiver.recv().await {
                        Some(request) => request,
                        None => break,
                    },
                };
                match run_with_retry(&scheduler, &request).await {
                    ChunkResponse::InProgress { next_start_row, .. } => {
                        pending.push_back(request.next(next_start_row));
                    }
                    terminal => {
                        let _ = outcomes.send(JobOutcome {
                            job_id: request.job_id,
                            response: terminal,
                        });
                    }
                }
            }
        });

        (queue, handle)
    }

    pub fn enqueue(&self, request: ChunkRequest) -> Result<()> {
        self.sender
            .send(request)
            .map_err(|_| EngineError::Configuration {
                message: "chunk queue is no longer running".into(),
            })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobOutcome> {
        self.outcomes.subscribe()
    }
}

/// Retries transient failures with backoff, then marks the job failed.
pub async fn run_with_retry(scheduler: &ChunkScheduler, request: &ChunkRequest) -> ChunkResponse {
    let max_attempts = scheduler.config().max_attempts;
    let mut attempt = 1;
    loop {
        tokio::time::sleep(scheduler.config().backoff(attempt)).await;
        match scheduler.process_chunk(request).await {
            Ok(response) => return response,
            Err(err) if err.is_transient() && attempt < max_attempts => {
                warn!(
                    job_id = %request.job_id,
                    start_row = request.start_row,
                    attempt,
                    error = %err,
                    "chunk attempt failed, retrying"
                );
                attempt += 1;
            }
            Err(err) => {
                error!(job_id = %request.job_id, start_row = request.start_row, error = %err, "chunk abandoned");
                scheduler.abandon(request, &err.to_string()).await;
                return ChunkResponse::Failed {
                    message: err.to_string(),
                };
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::Metric;
    use crate::models::{Benchmark, BenchmarkKind, BenchmarkStatus, DataPoint, RowError};
    use crate::segment::SegmentFilter;
    use crate::source::FileRowSource;
    use crate::store::{JobUpdate, MemoryStore};
    use async_trait::async_trait;
    use std::io::Write;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tempfile::NamedTempFile;

    /// 120 rows; every fifth row (4, 9, 14, ...) has no core metric.
    fn survey_file() -> NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(".csv").tempfile().unwrap();
        writeln!(file, "Country,Region,Age,K,C,G,Wellbeing").unwrap();
        for i in 0..120 {
            let region = if i % 2 == 0 { "EU" } else { "LatAm" };
            if i % 5 == 4 {
                writeln!(file, "Spain,{region},31,,,,77").unwrap();
            } else {
                writeln!(file, "Spain,{region},{},{},{},{},80", 20 + i % 40, 90 + i % 20, 95, 100).unwrap();
            }
        }
        file.flush().unwrap();
        file
    }

    fn config() -> EngineConfig {
        EngineConfig {
            chunk_size: 50,
            batch_size: 20,
            max_attempts: 2,
            retry_backoff_ms: 1,
            ..EngineConfig::default()
        }
    }

    async fn setup_with<S: BenchmarkStore + 'static>(
        store: Arc<S>,
        location: &str,
    ) -> (Arc<ChunkScheduler>, ChunkRequest) {
        let scheduler =
            ChunkScheduler::new(store.clone(), Arc::new(FileRowSource), config()).unwrap();
        let benchmark = store
            .create_benchmark("Global SEI Norms 2024", BenchmarkKind::External)
            .await
            .unwrap();
        let job = store.create_job(benchmark.id, location).await.unwrap();
        (Arc::new(scheduler), ChunkRequest::first(&job))
    }

    async fn setup(location: &str) -> (Arc<MemoryStore>, Arc<ChunkScheduler>, ChunkRequest) {
        let store = Arc::new(MemoryStore::new());
        let (scheduler, request) = setup_with(store.clone(), location).await;
        (store, scheduler, request)
    }

    /// Memory store whose data-point inserts time out a set number of times.
    struct FlakyStore {
        inner: MemoryStore,
        failures_left: AtomicUsize,
        insert_calls: AtomicUsize,
    }

    impl FlakyStore {
        fn failing(times: usize) -> Arc<Self> {
            Arc::new(Self {
                inner: MemoryStore::new(),
                failures_left: AtomicUsize::new(times),
                insert_calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl BenchmarkStore for FlakyStore {
        async fn create_benchmark(&self, name: &str, kind: BenchmarkKind) -> Result<Benchmark> {
            self.inner.create_benchmark(name, kind).await
        }
        async fn get_benchmark(&self, id: Uuid) -> Result<Benchmark> {
            self.inner.get_benchmark(id).await
        }
        async fn list_benchmarks(&self) -> Result<Vec<Benchmark>> {
            self.inner.list_benchmarks().await
        }
        async fn set_benchmark_status(
            &self,
            id: Uuid,
            status: BenchmarkStatus,
            row_count: Option<i64>,
        ) -> Result<()> {
            self.inner.set_benchmark_status(id, status, row_count).await
        }
        async fn delete_benchmark(&self, id: Uuid) -> Result<bool> {
            self.inner.delete_benchmark(id).await
        }
        async fn create_job(&self, benchmark_id: Uuid, file_location: &str) -> Result<ImportJob> {
            self.inner.create_job(benchmark_id, file_location).await
        }
        async fn get_job(&self, id: Uuid) -> Result<ImportJob> {
            self.inner.get_job(id).await
        }
        async fn update_job(&self, id: Uuid, update: JobUpdate) -> Result<()> {
            self.inner.update_job(id, update).await
        }
        async fn append_job_errors(
            &self,
            id: Uuid,
            errors: &[RowError],
            max_recorded: usize,
        ) -> Result<()> {
            self.inner.append_job_errors(id, errors, max_recorded).await
        }
        async fn request_cancel(&self, id: Uuid) -> Result<()> {
            self.inner.request_cancel(id).await
        }
        async fn insert_data_points(&self, points: &[DataPoint]) -> Result<u64> {
            self.insert_calls.fetch_add(1, Ordering::SeqCst);
            let failing = self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
                .is_ok();
            if failing {
                return Err(EngineError::Database(sqlx::Error::PoolTimedOut));
            }
            self.inner.insert_data_points(points).await
        }
        async fn count_data_points(&self, benchmark_id: Uuid) -> Result<i64> {
            self.inner.count_data_points(benchmark_id).await
        }
        async fn metric_values(
            &self,
            benchmark_id: Uuid,
            filter: &SegmentFilter,
            metric: Metric,
        ) -> Result<Vec<f64>> {
            self.inner.metric_values(benchmark_id, filter, metric).await
        }
        async fn metric_pairs(
            &self,
            benchmark_id: Uuid,
            filter: &SegmentFilter,
            x: Metric,
            y: Metric,
        ) -> Result<Vec<(f64, f64)>> {
            self.inner.metric_pairs(benchmark_id, filter, x, y).await
        }
    }

    #[tokio::test]
    async fn walks_a_file_in_windows() {
        let file = survey_file();
        let (store, scheduler, request) = setup(file.path().to_str().unwrap()).await;

        let first = scheduler.process_chunk(&request).await.unwrap();
        match first {
            ChunkResponse::InProgress {
                next_start_row,
                processed_rows,
                total_rows,
                progress,
            } => {
                assert_eq!(next_start_row, 50);
                assert_eq!(processed_rows, 40);
                assert_eq!(total_rows, 120);
                assert_eq!(progress, 15 + 25);
            }
            other => panic!("unexpected {other:?}"),
        }
        let job = store.get_job(request.job_id).await.unwrap();
        assert_eq!(job.phase, JobPhase::Importing);
        assert_eq!(job.total_rows, 120);

        let second = scheduler.process_chunk(&request.next(50)).await.unwrap();
        assert!(matches!(
            second,
            ChunkResponse::InProgress { next_start_row: 100, processed_rows: 80, .. }
        ));

        let third = scheduler.process_chunk(&request.next(100)).await.unwrap();
        assert_eq!(third, ChunkResponse::Completed { row_count: 96 });

        let job = store.get_job(request.job_id).await.unwrap();
        assert_eq!((job.phase, job.progress), (JobPhase::Completed, 100));
        assert!(job.completed_at.is_some());
        let benchmark = store.get_benchmark(request.benchmark_id).await.unwrap();
        assert_eq!(benchmark.status, BenchmarkStatus::Completed);
        assert_eq!(benchmark.row_count, 96);
    }

    #[tokio::test]
    async fn repeated_triggers_are_idempotent() {
        let file = survey_file();
        let (store, scheduler, request) = setup(file.path().to_str().unwrap()).await;

        scheduler.process_chunk(&request).await.unwrap();
        let again = scheduler.process_chunk(&request).await.unwrap();
        assert!(matches!(again, ChunkResponse::InProgress { processed_rows: 40, .. }));
        assert_eq!(store.count_data_points(request.benchmark_id).await.unwrap(), 40);

        // Progress never moves backwards on re-entry.
        let job = store.get_job(request.job_id).await.unwrap();
        assert_eq!(job.progress, 40);

        scheduler.process_chunk(&request.next(50)).await.unwrap();
        scheduler.process_chunk(&request.next(100)).await.unwrap();
        let finished = scheduler.process_chunk(&request.next(100)).await.unwrap();
        assert_eq!(finished, ChunkResponse::Completed { row_count: 96 });
    }

    #[tokio::test]
    async fn missing_file_fails_job_and_benchmark() {
        let (store, scheduler, request) = setup("/nonexistent/norms.csv").await;

        let response = scheduler.process_chunk(&request).await.unwrap();
        assert!(matches!(response, ChunkResponse::Failed { .. }));
        let job = store.get_job(request.job_id).await.unwrap();
        assert_eq!(job.phase, JobPhase::Failed);
        assert!(job.error_message.is_some());
        let benchmark = store.get_benchmark(request.benchmark_id).await.unwrap();
        assert_eq!(benchmark.status, BenchmarkStatus::Failed);

        // A failed job is terminal; a later trigger does not resume it.
        let retry = scheduler.process_chunk(&request).await.unwrap();
        assert!(matches!(retry, ChunkResponse::Failed { .. }));
    }

    #[tokio::test]
    async fn cancellation_is_observed_at_the_next_chunk() {
        let file = survey_file();
        let (store, scheduler, request) = setup(file.path().to_str().unwrap()).await;

        scheduler.process_chunk(&request).await.unwrap();
        store.request_cancel(request.job_id).await.unwrap();
        let response = scheduler.process_chunk(&request.next(50)).await.unwrap();
        assert_eq!(
            response,
            ChunkResponse::Failed {
                message: "import cancelled".into()
            }
        );
        assert_eq!(store.count_data_points(request.benchmark_id).await.unwrap(), 40);
    }

    #[tokio::test]
    async fn queue_drives_job_to_completion() {
        let file = survey_file();
        let (store, scheduler, request) = setup(file.path().to_str().unwrap()).await;
        let (queue, _handle) = ChunkQueue::start(scheduler);
        let mut outcomes = queue.subscribe();

        queue.enqueue(request.clone()).unwrap();
        let outcome = outcomes.recv().await.unwrap();
        assert_eq!(outcome.job_id, request.job_id);
        assert_eq!(outcome.response, ChunkResponse::Completed { row_count: 96 });
        assert_eq!(store.get_job(request.job_id).await.unwrap().progress, 100);
    }

    #[tokio::test]
    async fn transient_store_failure_is_retried() {
        let file = survey_file();
        let store = FlakyStore::failing(1);
        let (scheduler, request) = setup_with(store.clone(), file.path().to_str().unwrap()).await;

        let response = run_with_retry(&scheduler, &request).await;
        assert!(matches!(
            response,
            ChunkResponse::InProgress { next_start_row: 50, processed_rows: 40, .. }
        ));
        assert_eq!(store.count_data_points(request.benchmark_id).await.unwrap(), 40);
        assert!(store.insert_calls.load(Ordering::SeqCst) > 1);
    }

    #[tokio::test]
    async fn single_trigger_fails_job_once_retries_run_out() {
        let file = survey_file();
        let store = FlakyStore::failing(usize::MAX);
        let (scheduler, request) = setup_with(store.clone(), file.path().to_str().unwrap()).await;

        let direct = scheduler.process_chunk(&request).await;
        assert!(direct.is_err_and(|err| err.is_transient()));

        let response = run_with_retry(&scheduler, &request).await;
        assert!(matches!(response, ChunkResponse::Failed { .. }));
        assert_eq!(store.insert_calls.load(Ordering::SeqCst), 1 + config().max_attempts as usize);

        let job = store.get_job(request.job_id).await.unwrap();
        assert_eq!(job.phase, JobPhase::Failed);
        let benchmark = store.get_benchmark(request.benchmark_id).await.unwrap();
        assert_eq!(benchmark.status, BenchmarkStatus::Failed);
    }

    #[tokio::test]
    async fn queue_reports_abandoned_job_as_failed() {
        let file = survey_file();
        let store = FlakyStore::failing(usize::MAX);
        let (scheduler, request) = setup_with(store.clone(), file.path().to_str().unwrap()).await;
        let (queue, _handle) = ChunkQueue::start(scheduler);
        let mut outcomes = queue.subscribe();

        queue.enqueue(request.clone()).unwrap();
        let outcome = outcomes.recv().await.unwrap();
        assert!(matches!(outcome.response, ChunkResponse::Failed { .. }));
        assert_eq!(store.get_job(request.job_id).await.unwrap().phase, JobPhase::Failed);
    }

    #[tokio::test]
    async fn queue_worker_stops_when_handles_are_dropped() {
        let file = survey_file();
        let (_store, scheduler, request) = setup(file.path().to_str().unwrap()).await;
        let (queue, handle) = ChunkQueue::start(scheduler);
        let mut outcomes = queue.subscribe();

        queue.enqueue(request).unwrap();
        drop(queue);
        let outcome = outcomes.recv().await.unwrap();
        assert_eq!(outcome.response, ChunkResponse::Completed { row_count: 96 });
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
    }

    #[test]
    fn responses_use_the_trigger_wire_format() {
        let json = serde_json::to_value(ChunkResponse::InProgress {
            next_start_row: 50,
            processed_rows: 40,
            total_rows: 120,
            progress: 40,
        })
        .unwrap();
        assert_eq!(json["status"], "in_progress");
        assert_eq!(json["nextStartRow"], 50);

        let request: ChunkRequest = serde_json::from_value(serde_json::json!({
            "benchmarkId": Uuid::nil(),
            "jobId": Uuid::nil(),
            "fileLocation": "norms.csv",
            "startRow": 100
        }))
        .unwrap();
        assert_eq!(request.start_row, 100);
    }
}
