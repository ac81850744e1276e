use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::metrics::MetricValues;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BenchmarkStatus {
    Processing,
    Completed,
    Failed,
    Archived,
}

impl BenchmarkStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            BenchmarkStatus::Processing => "PROCESSING",
            BenchmarkStatus::Completed => "COMPLETED",
            BenchmarkStatus::Failed => "FAILED",
            BenchmarkStatus::Archived => "ARCHIVED",
        }
    }
}

impl FromStr for BenchmarkStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PROCESSING" => Ok(BenchmarkStatus::Processing),
            "COMPLETED" => Ok(BenchmarkStatus::Completed),
            "FAILED" => Ok(BenchmarkStatus::Failed),
            "ARCHIVED" => Ok(BenchmarkStatus::Archived),
            other => Err(format!("unknown benchmark status '{other}'")),
        }
    }
}

impl fmt::Display for BenchmarkStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum BenchmarkKind {
    External,
    Internal,
}

impl BenchmarkKind {
    pub fn as_str(self) -> &'static str {
        match self {
            BenchmarkKind::External => "external",
            BenchmarkKind::Internal => "internal",
        }
    }
}

impl FromStr for BenchmarkKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "external" => Ok(BenchmarkKind::External),
            "internal" => Ok(BenchmarkKind::Internal),
            other => Err(format!("unknown benchmark kind '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Benchmark {
    pub id: Uuid,
    pub name: String,
    pub kind: BenchmarkKind,
    pub status: BenchmarkStatus,
    pub row_count: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobPhase {
    Downloading,
    Parsing,
    Importing,
    Statistics,
    Completed,
    Failed,
}

impl JobPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            JobPhase::Downloading => "downloading",
            JobPhase::Parsing => "parsing",
            JobPhase::Importing => "importing",
            JobPhase::Statistics => "statistics",
            JobPhase::Completed => "completed",
            JobPhase::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, JobPhase::Completed | JobPhase::Failed)
    }

    pub fn anchor_progress(self) -> i32 {
        match self {
            JobPhase::Downloading => 5,
            JobPhase::Parsing => 10,
            JobPhase::Importing => 15,
            JobPhase::Statistics => 95,
            JobPhase::Completed => 100,
            JobPhase::Failed => 0,
        }
    }

    fn rank(self) -> u8 {
        match self {
            JobPhase::Downloading => 0,
            JobPhase::Parsing => 1,
            JobPhase::Importing => 2,
            JobPhase::Statistics => 3,
            JobPhase::Completed => 4,
            JobPhase::Failed => 5,
        }
    }

    /// Phases only move forward; `failed` is reachable from any live phase.
    /// Staying in the same phase is allowed so chunk re-entry is idempotent.
    pub fn can_advance_to(self, next: JobPhase) -> bool {
        if self.is_terminal() {
            return self == next;
        }
        next == JobPhase::Failed || next.rank() >= self.rank()
    }
}

impl FromStr for JobPhase {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "downloading" => Ok(JobPhase::Downloading),
            "parsing" => Ok(JobPhase::Parsing),
            "importing" => Ok(JobPhase::Importing),
            "statistics" => Ok(JobPhase::Statistics),
            "completed" => Ok(JobPhase::Completed),
            "failed" => Ok(JobPhase::Failed),
            other => Err(format!("unknown job phase '{other}'")),
        }
    }
}

impl fmt::Display for JobPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RowError {
    pub row: usize,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImportJob {
    pub id: Uuid,
    pub benchmark_id: Uuid,
    pub file_location: String,
    pub phase: JobPhase,
    pub progress: i32,
    pub total_rows: i64,
    pub processed_rows: i64,
    pub errors: Vec<RowError>,
    pub error_count: i64,
    pub error_message: Option<String>,
    pub cancel_requested: bool,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Demographics {
    pub country: Option<String>,
    pub region: Option<String>,
    pub sector: Option<String>,
    pub job_function: Option<String>,
    pub role: Option<String>,
    pub age: Option<String>,
    pub gender: Option<String>,
    pub education: Option<String>,
    pub generation: Option<String>,
    pub year: Option<i32>,
    pub month: Option<i32>,
    pub quarter: Option<i32>,
    pub survey_date: Option<NaiveDate>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DataPoint {
    pub benchmark_id: Uuid,
    pub source_row: i64,
    pub demographics: Demographics,
    pub metrics: MetricValues,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phases_only_move_forward() {
        assert!(JobPhase::Downloading.can_advance_to(JobPhase::Parsing));
        assert!(JobPhase::Importing.can_advance_to(JobPhase::Importing));
        assert!(JobPhase::Importing.can_advance_to(JobPhase::Failed));
        assert!(!JobPhase::Statistics.can_advance_to(JobPhase::Importing));
    }

    #[test]
    fn terminal_phases_are_sinks() {
        assert!(!JobPhase::Completed.can_advance_to(JobPhase::Failed));
        assert!(!JobPhase::Failed.can_advance_to(JobPhase::Importing));
        assert!(JobPhase::Failed.can_advance_to(JobPhase::Failed));
    }

    #[test]
    fn status_round_trips_through_text() {
        for status in [
            BenchmarkStatus::Processing,
            BenchmarkStatus::Completed,
            BenchmarkStatus::Failed,
            BenchmarkStatus::Archived,
        ] {
            assert_eq!(status.as_str().parse::<BenchmarkStatus>(), Ok(status));
        }
    }
}
