use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Result;
use crate::metrics::{Metric, MetricCategory};
use crate::segment::SegmentFilter;
use crate::store::BenchmarkStore;

pub const MIN_PAIRS: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Strength {
    Negligible,
    Weak,
    Moderate,
    Strong,
}

impl Strength {
    pub fn classify(r: f64) -> Strength {
        let magnitude = r.abs();
        if magnitude < 0.1 {
            Strength::Negligible
        } else if magnitude < 0.3 {
            Strength::Weak
        } else if magnitude < 0.5 {
            Strength::Moderate
        } else {
            Strength::Strong
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Positive,
    Negative,
    None,
}

impl Direction {
    pub fn of(r: f64) -> Direction {
        if r > 0.0 {
            Direction::Positive
        } else if r < 0.0 {
            Direction::Negative
        } else {
            Direction::None
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Correlation {
    pub metric: Metric,
    pub outcome: Metric,
    pub n: usize,
    pub r: Option<f64>,
    pub strength: Option<Strength>,
    pub direction: Option<Direction>,
}

impl Correlation {
    pub fn from_pairs(metric: Metric, outcome: Metric, pairs: &[(f64, f64)]) -> Self {
        let r = pearson(pairs);
        Self {
            metric,
            outcome,
            n: pairs.len(),
            r,
            strength: r.map(Strength::classify),
            direction: r.map(Direction::of),
        }
    }
}

/// Product-moment correlation. `None` for fewer than [`MIN_PAIRS`] pairs or
/// when either side has zero variance.
pub fn pearson(pairs: &[(f64, f64)]) -> Option<f64> {
    if pairs.len() < MIN_PAIRS {
        return None;
    }
    let n = pairs.len() as f64;
    let mean_x = pairs.iter().map(|(x, _)| x).sum::<f64>() / n;
    let mean_y = pairs.iter().map(|(_, y)| y).sum::<f64>() / n;

    let (mut cov, mut var_x, mut var_y) = (0.0, 0.0, 0.0);
    for (x, y) in pairs {
        let dx = x - mean_x;
        let dy = y - mean_y;
        cov += dx * dy;
        var_x += dx * dx;
        var_y += dy * dy;
    }
    if var_x == 0.0 || var_y == 0.0 {
        return None;
    }
    Some((cov / (var_x.sqrt() * var_y.sqrt())).clamp(-1.0, 1.0))
}

pub async fn correlate(
    store: &dyn BenchmarkStore,
    benchmark_id: Uuid,
    filter: &SegmentFilter,
    metric: Metric,
    outcomes: &[Metric],
) -> Result<Vec<Correlation>> {
    store.get_benchmark(benchmark_id).await?;
    let outcomes: Vec<Metric> = if outcomes.is_empty() {
        Metric::ALL
            .into_iter()
            .filter(|m| m.category() == MetricCategory::Outcome)
            .collect()
    } else {
        outcomes.to_vec()
    };

    let mut correlations = Vec::with_capacity(outcomes.len());
    for outcome in outcomes {
        let pairs = store
            .metric_pairs(benchmark_id, filter, metric, outcome)
            .await?;
        correlations.push(Correlation::from_pairs(metric, outcome, &pairs));
    }
    Ok(correlations)
}
