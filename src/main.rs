use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use sqlx::postgres::PgPoolOptions;
use tracing::info;
use uuid::Uuid;

mod compare;
mod config;
mod correlation;
mod error;
mod ledger;
mod metrics;
mod models;
mod normalize;
mod persist;
mod report;
mod scheduler;
mod segment;
mod source;
mod stats;
mod store;

use crate::compare::{SegmentComparator, DEFAULT_TOP_N};
use crate::config::EngineConfig;
use crate::metrics::Metric;
use crate::models::{BenchmarkKind, BenchmarkStatus, ImportJob};
use crate::scheduler::{run_with_retry, ChunkQueue, ChunkRequest, ChunkResponse, ChunkScheduler};
use crate::segment::{Segment, SegmentFilter};
use crate::source::{FileFormat, FileRowSource};
use crate::stats::StatisticsEngine;
use crate::store::{BenchmarkStore, MemoryStore, PgStore};

#[derive(Parser)]
#[command(name = "benchmark-engine")]
#[command(about = "Benchmark ingestion and statistical analysis for EQ assessment datasets", long_about = None)]
struct Cli {
    /// Postgres connection string
    #[arg(long, global = true, env = "DATABASE_URL", hide_env_values = true)]
    database_url: Option<String>,

    #[arg(long, global = true, env = "BENCHMARK_MAX_CONNECTIONS", default_value_t = 5)]
    max_connections: u32,

    #[command(flatten)]
    engine: EngineConfig,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the whole pipeline on a local file in memory, without a database
    Profile(ProfileArgs),
    #[command(flatten)]
    Database(DatabaseCommand),
}

#[derive(clap::Args)]
struct ProfileArgs {
    #[arg(long)]
    file: PathBuf,
    #[arg(long = "segment")]
    segments: Vec<Segment>,
    #[arg(long, value_delimiter = ',')]
    metrics: Vec<Metric>,
}

#[derive(Subcommand)]
enum DatabaseCommand {
    /// Create or upgrade the database schema
    InitDb,
    /// Import a CSV or spreadsheet export end to end
    Import {
        #[arg(long)]
        name: String,
        #[arg(long, value_enum, default_value_t = BenchmarkKind::External)]
        kind: BenchmarkKind,
        #[arg(long)]
        file: PathBuf,
        /// Only register the job and print the first chunk trigger
        #[arg(long)]
        detach: bool,
    },
    /// Process a single chunk and print the trigger response as JSON
    Chunk {
        #[arg(long)]
        benchmark_id: Uuid,
        #[arg(long)]
        job_id: Uuid,
        #[arg(long)]
        file: String,
        #[arg(long, default_value_t = 0)]
        start_row: usize,
    },
    /// Show an import job's ledger
    Job {
        #[arg(long)]
        job_id: Uuid,
        #[arg(long)]
        json: bool,
    },
    /// Ask a running import to stop at its next chunk boundary
    Cancel {
        #[arg(long)]
        job_id: Uuid,
    },
    /// List benchmarks
    Benchmarks,
    /// Mark a benchmark archived
    Archive {
        #[arg(long)]
        benchmark_id: Uuid,
    },
    /// Delete a benchmark with its jobs and data points
    Delete {
        #[arg(long)]
        benchmark_id: Uuid,
    },
    /// Per-metric statistics for one segment filter
    Stats {
        #[arg(long)]
        benchmark_id: Uuid,
        /// Filter such as `region=EU,age_range=25-29`
        #[arg(long, default_value = "")]
        filter: SegmentFilter,
        #[arg(long, value_delimiter = ',')]
        metrics: Vec<Metric>,
        #[arg(long)]
        json: bool,
    },
    /// Compare two or more segments; the first is the baseline
    Compare {
        #[arg(long)]
        benchmark_id: Uuid,
        /// `NAME:key=value,...`, repeat for each segment
        #[arg(long = "segment", required = true)]
        segments: Vec<Segment>,
        #[arg(long, value_delimiter = ',')]
        metrics: Vec<Metric>,
        #[arg(long, default_value_t = DEFAULT_TOP_N)]
        top: usize,
        #[arg(long)]
        out: Option<PathBuf>,
        #[arg(long)]
        json: bool,
    },
    /// Correlate one metric with outcome metrics
    Correlate {
        #[arg(long)]
        benchmark_id: Uuid,
        #[arg(long, default_value = "EQ")]
        metric: Metric,
        #[arg(long, value_delimiter = ',')]
        outcomes: Vec<Metric>,
        #[arg(long, default_value = "")]
        filter: SegmentFilter,
    },
}

fn init_tracing() {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("benchmark_engine=info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr)
                .compact(),
        )
        .init();
}

async fn connect(database_url: Option<&str>, max_connections: u32) -> anyhow::Result<Arc<PgStore>> {
    let database_url =
        database_url.context("DATABASE_URL must be set to a production Postgres instance")?;
    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(database_url)
        .await
        .context("failed to connect to Postgres")?;
    Ok(Arc::new(PgStore::new(pool)))
}

fn build_scheduler(
    store: Arc<dyn BenchmarkStore>,
    config: &EngineConfig,
) -> anyhow::Result<Arc<ChunkScheduler>> {
    let scheduler = ChunkScheduler::new(store, Arc::new(FileRowSource), config.clone())
        .context("invalid engine configuration")?;
    Ok(Arc::new(scheduler))
}

fn file_location(file: &Path) -> anyhow::Result<String> {
    FileFormat::from_path(file)?;
    let absolute = std::fs::canonicalize(file)
        .with_context(|| format!("cannot read {}", file.display()))?;
    Ok(absolute.display().to_string())
}

async fn register(
    store: &dyn BenchmarkStore,
    name: &str,
    kind: BenchmarkKind,
    file: &Path,
) -> anyhow::Result<ImportJob> {
    let location = file_location(file)?;
    let benchmark = store.create_benchmark(name, kind).await?;
    let job = store.create_job(benchmark.id, &location).await?;
    info!(benchmark_id = %benchmark.id, job_id = %job.id, file = %location, "import registered");
    Ok(job)
}

/// Hands the first chunk to a background queue and waits for the job to end.
async fn drive_import(scheduler: Arc<ChunkScheduler>, job: &ImportJob) -> anyhow::Result<ChunkResponse> {
    let (queue, _worker) = ChunkQueue::start(scheduler);
    let mut outcomes = queue.subscribe();
    queue.enqueue(ChunkRequest::first(job))?;
    loop {
        let outcome = outcomes.recv().await.context("chunk queue stopped")?;
        if outcome.job_id == job.id {
            return Ok(outcome.response);
        }
    }
}

fn print_outcome(response: &ChunkResponse) -> anyhow::Result<()> {
    match response {
        ChunkResponse::Completed { row_count } => {
            println!("Import completed with {row_count} data points.");
            Ok(())
        }
        ChunkResponse::Failed { message } => bail!("import failed: {message}"),
        ChunkResponse::InProgress { .. } => bail!("import stopped before finishing"),
    }
}

async fn print_segments(
    engine: &StatisticsEngine,
    benchmark_id: Uuid,
    segments: Vec<Segment>,
    metrics: &[Metric],
) -> anyhow::Result<()> {
    let benchmark = engine.store().get_benchmark(benchmark_id).await?;
    if segments.len() >= 2 {
        let comparison = SegmentComparator::new(engine.clone())
            .compare(benchmark_id, &segments, metrics)
            .await?;
        print!("{}", report::build_comparison_report(&benchmark, &comparison));
        return Ok(());
    }
    let filter = segments.into_iter().next().map(|s| s.filter).unwrap_or_default();
    let metrics = if metrics.is_empty() { &Metric::ALL[..] } else { metrics };
    let statistics = engine.compute(benchmark_id, &filter, metrics).await?;
    print!("{}", report::statistics_table(&statistics));
    Ok(())
}

async fn profile(args: ProfileArgs, config: &EngineConfig) -> anyhow::Result<()> {
    let store = Arc::new(MemoryStore::new());
    let name = args.file.display().to_string();
    let job = register(store.as_ref(), &name, BenchmarkKind::Internal, &args.file).await?;
    let response = drive_import(build_scheduler(store.clone(), config)?, &job).await?;
    print_outcome(&response)?;
    let engine = StatisticsEngine::new(store);
    print_segments(&engine, job.benchmark_id, args.segments, &args.metrics).await
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();
    let cli = Cli::parse();
    cli.engine.validate()?;

    let command = match cli.command {
        Commands::Profile(args) => return profile(args, &cli.engine).await,
        Commands::Database(command) => command,
    };
    let store = connect(cli.database_url.as_deref(), cli.max_connections).await?;

    match command {
        DatabaseCommand::InitDb => {
            store.migrate().await?;
            println!("Schema ready.");
        }
        DatabaseCommand::Import {
            name,
            kind,
            file,
            detach,
        } => {
            let job = register(store.as_ref(), &name, kind, &file).await?;
            if detach {
                println!("{}", serde_json::to_string_pretty(&ChunkRequest::first(&job))?);
                return Ok(());
            }
            let response = drive_import(build_scheduler(store.clone(), &cli.engine)?, &job).await?;
            println!("Benchmark {} / job {}", job.benchmark_id, job.id);
            print_outcome(&response)?;
        }
        DatabaseCommand::Chunk {
            benchmark_id,
            job_id,
            file,
            start_row,
        } => {
            let scheduler = build_scheduler(store.clone(), &cli.engine)?;
            let request = ChunkRequest {
                benchmark_id,
                job_id,
                file_location: file,
                start_row,
            };
            let response = run_with_retry(&scheduler, &request).await;
            println!("{}", serde_json::to_string_pretty(&response)?);
        }
        DatabaseCommand::Job { job_id, json } => {
            let job = store.get_job(job_id).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&job)?);
            } else {
                print!("{}", report::job_summary(&job));
            }
        }
        DatabaseCommand::Cancel { job_id } => {
            store.request_cancel(job_id).await?;
            println!("Cancellation requested for job {job_id}.");
        }
        DatabaseCommand::Benchmarks => {
            let benchmarks = store.list_benchmarks().await?;
            if benchmarks.is_empty() {
                println!("No benchmarks found.");
            }
            for benchmark in benchmarks {
                println!(
                    "- {} {} [{}, {}] {} data points",
                    benchmark.id,
                    benchmark.name,
                    benchmark.kind.as_str(),
                    benchmark.status,
                    benchmark.row_count
                );
            }
        }
        DatabaseCommand::Archive { benchmark_id } => {
            store
                .set_benchmark_status(benchmark_id, BenchmarkStatus::Archived, None)
                .await?;
            println!("Benchmark {benchmark_id} archived.");
        }
        DatabaseCommand::Delete { benchmark_id } => {
            if store.delete_benchmark(benchmark_id).await? {
                println!("Benchmark {benchmark_id} deleted.");
            } else {
                println!("Benchmark {benchmark_id} not found.");
            }
        }
        DatabaseCommand::Stats {
            benchmark_id,
            filter,
            metrics,
            json,
        } => {
            let engine = StatisticsEngine::new(store.clone());
            let metrics = if metrics.is_empty() { Metric::ALL.to_vec() } else { metrics };
            let statistics = engine.compute(benchmark_id, &filter, &metrics).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&statistics)?);
            } else {
                print!("{}", report::statistics_table(&statistics));
            }
        }
        DatabaseCommand::Compare {
            benchmark_id,
            segments,
            metrics,
            top,
            out,
            json,
        } => {
            let engine = StatisticsEngine::new(store.clone());
            let comparison = SegmentComparator::new(engine)
                .with_top_n(top)
                .compare(benchmark_id, &segments, &metrics)
                .await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&comparison)?);
            } else {
                let benchmark = store.get_benchmark(benchmark_id).await?;
                let report = report::build_comparison_report(&benchmark, &comparison);
                match out {
                    Some(path) => {
                        std::fs::write(&path, report)?;
                        println!("Report written to {}.", path.display());
                    }
                    None => print!("{report}"),
                }
            }
        }
        DatabaseCommand::Correlate {
            benchmark_id,
            metric,
            outcomes,
            filter,
        } => {
            let correlations =
                correlation::correlate(store.as_ref(), benchmark_id, &filter, metric, &outcomes)
                    .await?;
            for entry in &correlations {
                println!("{}", report::correlation_line(entry));
            }
        }
    }

    Ok(())
}
