use std::time::Duration;

use clap::Args;

use crate::error::{EngineError, Result};
use crate::metrics::Metric;

pub const DEFAULT_CHUNK_SIZE: usize = 5_000;
pub const DEFAULT_BATCH_SIZE: usize = 500;
pub const DEFAULT_MAX_RECORDED_ERRORS: usize = 100;
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
pub const DEFAULT_RETRY_BACKOFF_MS: u64 = 500;

/// Postgres caps bind parameters per statement at 65535.
const MAX_BIND_PARAMS: usize = 65_535;
const COLUMNS_PER_POINT: usize = 15 + Metric::COUNT;

#[derive(Debug, Clone, Args)]
pub struct EngineConfig {
    /// Rows processed per chunk invocation
    #[arg(long, global = true, env = "BENCHMARK_CHUNK_SIZE", default_value_t = DEFAULT_CHUNK_SIZE)]
    pub chunk_size: usize,

    /// Rows per insert statement
    #[arg(long, global = true, env = "BENCHMARK_BATCH_SIZE", default_value_t = DEFAULT_BATCH_SIZE)]
    pub batch_size: usize,

    /// Row errors kept on the job ledger (the total is always counted)
    #[arg(long, global = true, env = "BENCHMARK_MAX_RECORDED_ERRORS", default_value_t = DEFAULT_MAX_RECORDED_ERRORS)]
    pub max_recorded_errors: usize,

    /// Attempts per chunk when the ledger itself cannot be reached
    #[arg(long, global = true, env = "BENCHMARK_MAX_ATTEMPTS", default_value_t = DEFAULT_MAX_ATTEMPTS)]
    pub max_attempts: u32,

    /// Base delay between attempts; doubles each retry
    #[arg(long, global = true, env = "BENCHMARK_RETRY_BACKOFF_MS", default_value_t = DEFAULT_RETRY_BACKOFF_MS)]
    pub retry_backoff_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            batch_size: DEFAULT_BATCH_SIZE,
            max_recorded_errors: DEFAULT_MAX_RECORDED_ERRORS,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            retry_backoff_ms: DEFAULT_RETRY_BACKOFF_MS,
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<()> {
        let fail = |message: String| Err(EngineError::Configuration { message });
        if self.chunk_size == 0 {
            return fail("chunk size must be greater than zero".into());
        }
        if self.batch_size == 0 || self.batch_size > self.chunk_size {
            return fail(format!(
                "batch size must be between 1 and the chunk size ({}), got {}",
                self.chunk_size, self.batch_size
            ));
        }
        if self.batch_size * COLUMNS_PER_POINT > MAX_BIND_PARAMS {
            return fail(format!(
                "batch size {} exceeds the {} rows one insert statement can bind",
                self.batch_size,
                MAX_BIND_PARAMS / COLUMNS_PER_POINT
            ));
        }
        if self.max_attempts == 0 {
            return fail("max attempts must be at least 1".into());
        }
        Ok(())
    }

    /// Delay before attempt `attempt` (1-based; the first attempt never waits).
    pub fn backoff(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }
        let factor = 1u64 << (attempt - 2).min(10);
        Duration::from_millis(self.retry_backoff_ms.saturating_mul(factor))
    }
}
