//! Metric Aggregator: reduces a trial's `[runs x metric]` sample matrix down
//! to one scalar per metric, per the declared (or default) aggregation.

use std::collections::BTreeMap;

use crate::config::BackendConfig;
use crate::model::Agg;

/// Reduces each metric's sample vector with its declared aggregation
/// (default `avg` for metrics not explicitly declared), and additionally
/// emits a `<metric>_var` column for metrics declared with `var: true`.
pub fn aggregate(config: &BackendConfig, samples: &BTreeMap<String, Vec<f64>>) -> BTreeMap<String, f64> {
    let mut out = BTreeMap::new();
    for (metric, values) in samples {
        if values.is_empty() {
            continue;
        }
        let spec = config.metrics.iter().find(|m| &m.name == metric);
        let agg = spec.map(|m| m.agg).unwrap_or(Agg::Avg);
        out.insert(metric.clone(), reduce(values, agg));
        if spec.map(|m| m.var).unwrap_or(false) {
            out.insert(format!("{}_var", metric), sample_variance(values));
        }
    }
    out
}

fn reduce(values: &[f64], agg: Agg) -> f64 {
    match agg {
        Agg::Avg => values.iter().sum::<f64>() / values.len() as f64,
        Agg::Median => median(values),
        Agg::Min => values.iter().cloned().fold(f64::INFINITY, f64::min),
        Agg::Max => values.iter().cloned().fold(f64::NEG_INFINITY, f64::max),
    }
}

fn median(values: &[f64]) -> f64 {
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap());
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    } else {
        sorted[mid]
    }
}

fn sample_variance(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let mean = values.iter().sum::<f64>() / values.len() as f64;
    let sum_sq: f64 = values.iter().map(|v| (v - mean).powi(2)).sum();
    sum_sq / (values.len() - 1) as f64
}
