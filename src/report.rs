use std::fmt::Write;

use crate::compare::SegmentComparison;
use crate::correlation::Correlation;
use crate::models::{Benchmark, ImportJob};
use crate::stats::MetricStatistic;

fn fmt_opt(value: Option<f64>) -> String {
    value.map(|v| format!("{v:.2}")).unwrap_or_else(|| "-".to_string())
}

pub fn statistics_table(statistics: &[MetricStatistic]) -> String {
    let mut output = String::new();
    let _ = writeln!(output, "| metric | n | mean | median | std dev | p10 | p25 | p75 | p90 |");
    let _ = writeln!(output, "|---|---|---|---|---|---|---|---|---|");
    for stat in statistics {
        let _ = writeln!(
            output,
            "| {} | {} | {} | {} | {} | {} | {} | {} | {} |",
            stat.metric,
            stat.n,
            fmt_opt(stat.mean),
            fmt_opt(stat.median),
            fmt_opt(stat.std_dev),
            fmt_opt(stat.p10),
            fmt_opt(stat.p25),
            fmt_opt(stat.p75),
            fmt_opt(stat.p90),
        );
    }
    output
}

pub fn build_comparison_report(benchmark: &Benchmark, comparison: &SegmentComparison) -> String {
    let mut output = String::new();

    let _ = writeln!(output, "# Segment Comparison: {}", benchmark.name);
    let _ = writeln!(
        output,
        "Benchmark status {} with {} data points. Baseline segment: {}.",
        benchmark.status, benchmark.row_count, comparison.baseline
    );
    let _ = writeln!(output);
    let _ = writeln!(output, "## Most Differentiating Metrics");

    if comparison.most_differentiating.is_empty() {
        let _ = writeln!(output, "No metric has a usable baseline mean.");
    } else {
        for (rank, entry) in comparison.most_differentiating.iter().enumerate() {
            let _ = writeln!(
                output,
                "{}. {} ({}): average |Δ| {:.1}%",
                rank + 1,
                entry.metric.label(),
                entry.metric,
                entry.avg_abs_diff_percent
            );
        }
    }

    let _ = writeln!(output);
    let _ = writeln!(output, "## Mean by Segment");
    let _ = write!(output, "| metric |");
    for segment in &comparison.segments {
        let _ = write!(output, " {segment} (n) |");
    }
    let _ = writeln!(output);
    let _ = writeln!(output, "|---|{}", "---|".repeat(comparison.segments.len()));
    for row in &comparison.matrix {
        let _ = write!(output, "| {} |", row.metric);
        for cell in &row.cells {
            let _ = write!(output, " {} ({}) |", fmt_opt(cell.statistic.mean), cell.statistic.n);
        }
        let _ = writeln!(output);
    }

    let _ = writeln!(output);
    let _ = writeln!(output, "## Differences vs {}", comparison.baseline);
    if comparison.differences.is_empty() {
        let _ = writeln!(output, "No differences could be computed.");
    } else {
        for diff in &comparison.differences {
            let _ = writeln!(
                output,
                "- {} / {}: {:.2} vs {:.2} ({:+.2}, {:+.1}%)",
                diff.metric,
                diff.segment,
                diff.mean,
                diff.baseline_mean,
                diff.mean_diff,
                diff.mean_diff_percent
            );
        }
    }

    output
}

pub fn correlation_line(correlation: &Correlation) -> String {
    match (correlation.r, correlation.strength, correlation.direction) {
        (Some(r), Some(strength), Some(direction)) => format!(
            "{} vs {}: r = {:.3} ({}, {}) over {} pairs",
            correlation.metric,
            correlation.outcome,
            r,
            format!("{strength:?}").to_lowercase(),
            format!("{direction:?}").to_lowercase(),
            correlation.n
        ),
        _ => format!(
            "{} vs {}: not enough paired data ({} pairs)",
            correlation.metric, correlation.outcome, correlation.n
        ),
    }
}

pub fn job_summary(job: &ImportJob) -> String {
    let mut output = String::new();
    let _ = writeln!(output, "Job {} ({})", job.id, job.file_location);
    let _ = writeln!(output, "  phase     {} ({}%)", job.phase, job.progress);
    let _ = writeln!(
        output,
        "  rows      {} persisted of {} read",
        job.processed_rows, job.total_rows
    );
    if let Some(message) = &job.error_message {
        let _ = writeln!(output, "  failure   {message}");
    }
    if job.error_count > 0 {
        let _ = writeln!(output, "  row errors {} (showing {})", job.error_count, job.errors.len());
        for error in job.errors.iter().take(5) {
            let _ = writeln!(output, "    row {}: {}", error.row, error.message);
        }
    }
    output
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compare::{build_comparison, DEFAULT_TOP_N};
    use crate::metrics::Metric;
    use crate::models::{BenchmarkKind, BenchmarkStatus};
    use chrono::Utc;
    use uuid::Uuid;

    #[test]
    fn comparison_report_lists_differences() {
        let comparison = build_comparison(
            Uuid::nil(),
            vec![
                ("EU".into(), vec![MetricStatistic::from_values(Metric::Know, &[80.0])]),
                ("LatAm".into(), vec![MetricStatistic::from_values(Metric::Know, &[88.0])]),
            ],
            &[Metric::Know],
            DEFAULT_TOP_N,
        );
        let benchmark = Benchmark {
            id: Uuid::nil(),
            name: "Global SEI Norms 2024".into(),
            kind: BenchmarkKind::External,
            status: BenchmarkStatus::Completed,
            row_count: 2,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        let report = build_comparison_report(&benchmark, &comparison);
        assert!(report.contains("# Segment Comparison: Global SEI Norms 2024"));
        assert!(report.contains("1. Know Yourself (K): average |Δ| 10.0%"));
        assert!(report.contains("- K / LatAm: 88.00 vs 80.00 (+8.00, +10.0%)"));
    }

    #[test]
    fn empty_statistics_render_as_dashes() {
        let table = statistics_table(&[MetricStatistic::empty(Metric::Wellbeing)]);
        assert!(table.contains("| wellbeing | 0 | - | - |"));
    }
}
