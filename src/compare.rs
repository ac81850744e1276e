use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::error::{EngineError, Result};
use crate::metrics::Metric;
use crate::segment::Segment;
use crate::stats::{MetricStatistic, StatisticsEngine};

pub const DEFAULT_TOP_N: usize = 10;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricRow {
    pub metric: Metric,
    pub cells: Vec<SegmentCell>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentCell {
    pub segment: String,
    #[serde(flatten)]
    pub statistic: MetricStatistic,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeanDifference {
    pub metric: Metric,
    pub segment: String,
    pub baseline_mean: f64,
    pub mean: f64,
    pub mean_diff: f64,
    pub mean_diff_percent: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DifferentiatingMetric {
    pub metric: Metric,
    pub avg_abs_diff_percent: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentComparison {
    pub benchmark_id: Uuid,
    pub baseline: String,
    pub segments: Vec<String>,
    pub matrix: Vec<MetricRow>,
    pub differences: Vec<MeanDifference>,
    pub most_differentiating: Vec<DifferentiatingMetric>,
}

#[derive(Clone)]
pub struct SegmentComparator {
    engine: StatisticsEngine,
    top_n: usize,
}

impl SegmentComparator {
    pub fn new(engine: StatisticsEngine) -> Self {
        Self {
            engine,
            top_n: DEFAULT_TOP_N,
        }
    }

    pub fn with_top_n(mut self, top_n: usize) -> Self {
        self.top_n = top_n;
        self
    }

    /// Compares `segments[1..]` against `segments[0]`. An empty metric list
    /// means the whole catalogue.
    pub async fn compare(
        &self,
        benchmark_id: Uuid,
        segments: &[Segment],
        metrics: &[Metric],
    ) -> Result<SegmentComparison> {
        validate_segments(segments)?;
        let metrics: Vec<Metric> = if metrics.is_empty() {
            Metric::ALL.to_vec()
        } else {
            metrics.to_vec()
        };

        let mut per_segment = Vec::with_capacity(segments.len());
        for segment in segments {
            let statistics = self
                .engine
                .compute(benchmark_id, &segment.filter, &metrics)
                .await?;
            per_segment.push((segment.name.clone(), statistics));
        }

        let comparison = build_comparison(benchmark_id, per_segment, &metrics, self.top_n);
        info!(
            %benchmark_id,
            segments = comparison.segments.len(),
            metrics = metrics.len(),
            differences = comparison.differences.len(),
            "segment comparison built"
        );
        Ok(comparison)
    }
}

fn validate_segments(segments: &[Segment]) -> Result<()> {
    if segments.len() < 2 {
        return Err(EngineError::TooFewSegments(segments.len()));
    }
    let mut seen = HashSet::new();
    for segment in segments {
        if !seen.insert(segment.name.as_str()) {
            return Err(EngineError::InvalidSegment {
                segment: segment.name.clone(),
                reason: "segment names must be unique".into(),
            });
        }
        segment.filter.conditions()?;
    }
    Ok(())
}

pub fn build_comparison(
    benchmark_id: Uuid,
    per_segment: Vec<(String, Vec<MetricStatistic>)>,
    metrics: &[Metric],
    top_n: usize,
) -> SegmentComparison {
    let segments: Vec<String> = per_segment.iter().map(|(name, _)| name.clone()).collect();
    let baseline = segments.first().cloned().unwrap_or_default();

    let matrix: Vec<MetricRow> = metrics
        .iter()
        .enumerate()
        .map(|(idx, &metric)| MetricRow {
            metric,
            cells: per_segment
                .iter()
                .map(|(name, stats)| SegmentCell {
                    segment: name.clone(),
                    statistic: stats
                        .get(idx)
                        .cloned()
                        .unwrap_or_else(|| MetricStatistic::empty(metric)),
                })
                .collect(),
        })
        .collect();

    let mut differences = Vec::new();
    let mut ranking = Vec::new();
    for row in &matrix {
        let Some((base, others)) = row.cells.split_first() else {
            continue;
        };
        let Some(baseline_mean) = base.statistic.mean.filter(|m| *m != 0.0) else {
            continue;
        };

        let mut total_abs = 0.0;
        let mut count = 0usize;
        for cell in others {
            let Some(mean) = cell.statistic.mean else {
                continue;
            };
            let mean_diff = mean - baseline_mean;
            let mean_diff_percent = mean_diff / baseline_mean * 100.0;
            total_abs += mean_diff_percent.abs();
            count += 1;
            differences.push(MeanDifference {
                metric: row.metric,
                segment: cell.segment.clone(),
                baseline_mean,
                mean,
                mean_diff,
                mean_diff_percent,
            });
        }
        if count > 0 {
            ranking.push(DifferentiatingMetric {
                metric: row.metric,
                avg_abs_diff_percent: total_abs / count as f64,
            });
        }
    }

    ranking.sort_by(|a, b| b.avg_abs_diff_percent.total_cmp(&a.avg_abs_diff_percent));
    ranking.truncate(top_n);

    SegmentComparison {
        benchmark_id,
        baseline,
        segments,
        matrix,
        differences,
        most_differentiating: ranking,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::MetricValues;
    use crate::models::{BenchmarkKind, DataPoint, Demographics};
    use crate::store::{BenchmarkStore, MemoryStore};
    use std::sync::Arc;

    fn stat(metric: Metric, values: &[f64]) -> MetricStatistic {
        MetricStatistic::from_values(metric, values)
    }

    #[test]
    fn mean_difference_against_baseline() {
        let metrics = [Metric::Know];
        let comparison = build_comparison(
            Uuid::nil(),
            vec![
                ("EU".into(), vec![stat(Metric::Know, &[78.0, 82.0])]),
                ("LatAm".into(), vec![stat(Metric::Know, &[86.0, 90.0])]),
            ],
            &metrics,
            DEFAULT_TOP_N,
        );
        assert_eq!(comparison.baseline, "EU");
        assert_eq!(comparison.differences.len(), 1);
        let diff = &comparison.differences[0];
        assert_eq!(diff.segment, "LatAm");
        assert!((diff.mean_diff - 8.0).abs() < 1e-9);
        assert!((diff.mean_diff_percent - 10.0).abs() < 1e-9);
    }

    #[test]
    fn zero_or_missing_baseline_produces_no_delta() {
        let metrics = [Metric::Know, Metric::Choose];
        let comparison = build_comparison(
            Uuid::nil(),
            vec![
                ("A".into(), vec![stat(Metric::Know, &[0.0]), stat(Metric::Choose, &[])]),
                ("B".into(), vec![stat(Metric::Know, &[5.0]), stat(Metric::Choose, &[9.0])]),
            ],
            &metrics,
            DEFAULT_TOP_N,
        );
        assert!(comparison.differences.is_empty());
        assert!(comparison.most_differentiating.is_empty());
        assert_eq!(comparison.matrix.len(), 2);
    }

    #[test]
    fn ranks_by_average_absolute_percent() {
        let metrics = [Metric::Know, Metric::Choose, Metric::Give];
        let comparison = build_comparison(
            Uuid::nil(),
            vec![
                (
                    "base".into(),
                    vec![
                        stat(Metric::Know, &[100.0]),
                        stat(Metric::Choose, &[100.0]),
                        stat(Metric::Give, &[100.0]),
                    ],
                ),
                (
                    "x".into(),
                    vec![
                        stat(Metric::Know, &[105.0]),
                        stat(Metric::Choose, &[80.0]),
                        stat(Metric::Give, &[101.0]),
                    ],
                ),
                (
                    "y".into(),
                    vec![
                        stat(Metric::Know, &[95.0]),
                        stat(Metric::Choose, &[110.0]),
                        stat(Metric::Give, &[99.0]),
                    ],
                ),
            ],
            &metrics,
            2,
        );
        let ranked: Vec<_> = comparison.most_differentiating.iter().map(|d| d.metric).collect();
        assert_eq!(ranked, vec![Metric::Choose, Metric::Know]);
        assert!((comparison.most_differentiating[0].avg_abs_diff_percent - 15.0).abs() < 1e-9);
        assert!((comparison.most_differentiating[1].avg_abs_diff_percent - 5.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn fewer_than_two_segments_is_rejected_up_front() {
        // The benchmark does not exist: reaching the store would yield a
        // different error.
        let comparator = SegmentComparator::new(StatisticsEngine::new(Arc::new(MemoryStore::new())));
        let segments = vec!["EU:region=EU".parse::<Segment>().unwrap()];
        let err = comparator
            .compare(Uuid::new_v4(), &segments, &[])
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::TooFewSegments(1)));
    }

    #[tokio::test]
    async fn compares_segments_from_the_store() {
        let store = Arc::new(MemoryStore::new());
        let benchmark = store
            .create_benchmark("norms", BenchmarkKind::External)
            .await
            .unwrap();
        let points: Vec<DataPoint> = [("EU", 78.0), ("EU", 82.0), ("LatAm", 88.0)]
            .iter()
            .enumerate()
            .map(|(row, (region, know))| {
                let mut metrics = MetricValues::default();
                metrics.set(Metric::Know, Some(*know));
                DataPoint {
                    benchmark_id: benchmark.id,
                    source_row: row as i64,
                    demographics: Demographics {
                        region: Some(region.to_string()),
                        ..Demographics::default()
                    },
                    metrics,
                }
            })
            .collect();
        store.insert_data_points(&points).await.unwrap();

        let comparator = SegmentComparator::new(StatisticsEngine::new(store.clone()));
        let segments: Vec<Segment> = ["EU:region=EU", "LatAm:region=LatAm"]
            .iter()
            .map(|s| s.parse().unwrap())
            .collect();
        let comparison = comparator
            .compare(benchmark.id, &segments, &[Metric::Know, Metric::Wellbeing])
            .await
            .unwrap();

        assert_eq!(comparison.segments, vec!["EU", "LatAm"]);
        assert_eq!(comparison.matrix[1].cells[0].statistic.n, 0);
        assert_eq!(comparison.differences.len(), 1);
        assert!((comparison.differences[0].mean_diff_percent - 10.0).abs() < 1e-9);
    }
}
