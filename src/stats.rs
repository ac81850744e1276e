use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::error::Result;
use crate::metrics::Metric;
use crate::models::BenchmarkStatus;
use crate::segment::SegmentFilter;
use crate::store::BenchmarkStore;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricStatistic {
    pub metric: Metric,
    pub n: usize,
    pub mean: Option<f64>,
    pub median: Option<f64>,
    pub std_dev: Option<f64>,
    pub p10: Option<f64>,
    pub p25: Option<f64>,
    pub p75: Option<f64>,
    pub p90: Option<f64>,
}

impl MetricStatistic {
    pub fn empty(metric: Metric) -> Self {
        Self {
            metric,
            n: 0,
            mean: None,
            median: None,
            std_dev: None,
            p10: None,
            p25: None,
            p75: None,
            p90: None,
        }
    }

    pub fn from_values(metric: Metric, values: &[f64]) -> Self {
        let mut sorted: Vec<f64> = values.iter().copied().filter(|v| v.is_finite()).collect();
        if sorted.is_empty() {
            return MetricStatistic::empty(metric);
        }
        sorted.sort_by(f64::total_cmp);
        let mean = mean(&sorted);
        Self {
            metric,
            n: sorted.len(),
            mean,
            median: median(&sorted),
            std_dev: mean.and_then(|m| population_std_dev(&sorted, m)),
            p10: percentile(&sorted, 10.0),
            p25: percentile(&sorted, 25.0),
            p75: percentile(&sorted, 75.0),
            p90: percentile(&sorted, 90.0),
        }
    }
}

pub fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    Some(values.iter().sum::<f64>() / values.len() as f64)
}

pub fn median(sorted: &[f64]) -> Option<f64> {
    if sorted.is_empty() {
        return None;
    }
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        Some((sorted[mid - 1] + sorted[mid]) / 2.0)
    } else {
        Some(sorted[mid])
    }
}

pub fn population_std_dev(values: &[f64], mean: f64) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let variance =
        values.iter().map(|v| (v - mean) * (v - mean)).sum::<f64>() / values.len() as f64;
    Some(variance.max(0.0).sqrt())
}

/// Linear interpolation between order statistics at `idx = p/100 × (n−1)`.
/// Expects `sorted` in ascending order; `p` is clamped to `[0, 100]`.
pub fn percentile(sorted: &[f64], p: f64) -> Option<f64> {
    if sorted.is_empty() {
        return None;
    }
    let idx = (p.clamp(0.0, 100.0) / 100.0) * (sorted.len() - 1) as f64;
    let lower = idx.floor() as usize;
    let upper = idx.ceil() as usize;
    if lower == upper {
        return Some(sorted[lower]);
    }
    let weight = idx - lower as f64;
    Some(sorted[lower] + (sorted[upper] - sorted[lower]) * weight)
}

type CacheKey = (Uuid, SegmentFilter, Metric);

#[derive(Clone)]
pub struct StatisticsEngine {
    store: Arc<dyn BenchmarkStore>,
    cache: Arc<Mutex<HashMap<CacheKey, MetricStatistic>>>,
}

impl StatisticsEngine {
    pub fn new(store: Arc<dyn BenchmarkStore>) -> Self {
        Self {
            store,
            cache: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub async fn compute(
        &self,
        benchmark_id: Uuid,
        filter: &SegmentFilter,
        metrics: &[Metric],
    ) -> Result<Vec<MetricStatistic>> {
        let benchmark = self.store.get_benchmark(benchmark_id).await?;
        let cacheable = benchmark.status == BenchmarkStatus::Completed;
        // Validate the filter before touching the store.
        filter.conditions()?;

        let mut results = Vec::with_capacity(metrics.len());
        for &metric in metrics {
            let key = (benchmark_id, filter.clone(), metric);
            if cacheable {
                if let Some(hit) = self.cached(&key) {
                    results.push(hit);
                    continue;
                }
            }
            let values = self
                .store
                .metric_values(benchmark_id, filter, metric)
                .await?;
            let statistic = MetricStatistic::from_values(metric, &values);
            debug!(%benchmark_id, metric = %metric, n = statistic.n, "computed metric statistic");
            if cacheable {
                if let Ok(mut cache) = self.cache.lock() {
                    cache.insert(key, statistic.clone());
                }
            }
            results.push(statistic);
        }
        Ok(results)
    }

    fn cached(&self, key: &CacheKey) -> Option<MetricStatistic> {
        self.cache.lock().ok().and_then(|cache| cache.get(key).cloned())
    }

    pub fn store(&self) -> &Arc<dyn BenchmarkStore> {
        &self.store
    }
}
