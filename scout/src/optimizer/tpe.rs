//! Hand-rolled tree-structured Parzen estimator. The Space Compiler only
//! ever produces finite decision variables (flags, toggles, enumerated
//! params), so TPE here splits into two regimes per variable: a
//! Laplace-smoothed categorical frequency ratio for string/bool domains,
//! and a Gaussian kernel density ratio (evaluated at each finite numeric
//! domain value) for all-numeric domains such as a thread-count or
//! `-march`-style parameter list.

use rand::rngs::StdRng;
use rand::Rng;
use statrs::distribution::{Continuous, Normal};

use crate::model::{Assignment, DecisionVariable, Objective, SearchSpace, Value};

use super::{primary_objective, sample_masked, Observation, Optimizer};

const WARMUP_TRIALS: usize = 10;
const GAMMA: f64 = 0.25;
const LAPLACE_ALPHA: f64 = 1.0;
const KDE_FLOOR: f64 = 1e-6;

pub struct TpeOptimizer {
    space: SearchSpace,
    objectives: Vec<Objective>,
    rng: StdRng,
    history: Vec<(Assignment, f64)>,
}

impl TpeOptimizer {
    pub fn new(space: SearchSpace, objectives: Vec<Objective>, rng: StdRng) -> Self {
        TpeOptimizer { space, objectives, rng, history: Vec::new() }
    }

    /// Splits observed trials by objective[0] score into the best `GAMMA`
    /// fraction ("good", l(x)) and the rest ("bad", g(x)).
    fn split(&self) -> (Vec<Assignment>, Vec<Assignment>) {
        let mut sorted: Vec<&(Assignment, f64)> = self.history.iter().collect();
        sorted.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap());
        let n_good = (((sorted.len() as f64) * GAMMA).ceil() as usize).clamp(1, sorted.len());
        let good = sorted[..n_good].iter().map(|(a, _)| a.clone()).collect();
        let bad = sorted[n_good..].iter().map(|(a, _)| a.clone()).collect();
        (good, bad)
    }
}

fn uniform_choice(rng: &mut StdRng, var: &DecisionVariable) -> Value {
    let idx = rng.gen_range(0..var.domain.len());
    var.domain[idx].clone()
}

/// Samples `var`'s value proportional to `l(x) / g(x)`: a Gaussian KDE
/// density ratio when the domain is entirely numeric, otherwise a
/// Laplace-smoothed categorical frequency ratio.
fn tpe_choice(
    rng: &mut StdRng,
    var: &DecisionVariable,
    good: &[Assignment],
    bad: &[Assignment],
) -> Value {
    let weights = if let Some(numeric_domain) = all_numeric(&var.domain) {
        numeric_weights(var, &numeric_domain, good, bad)
    } else {
        categorical_weights(var, good, bad)
    };

    let total: f64 = weights.iter().sum();
    let mut roll = rng.gen_range(0.0..total);
    for (i, w) in weights.iter().enumerate() {
        if roll < *w {
            return var.domain[i].clone();
        }
        roll -= w;
    }
    var.domain.last().unwrap().clone()
}

fn all_numeric(domain: &[Value]) -> Option<Vec<f64>> {
    domain
        .iter()
        .map(|v| match v {
            Value::Num(n) => Some(*n),
            _ => None,
        })
        .collect()
}

fn categorical_weights(var: &DecisionVariable, good: &[Assignment], bad: &[Assignment]) -> Vec<f64> {
    let k = var.domain.len() as f64;
    var.domain
        .iter()
        .map(|value| {
            let good_count =
                good.iter().filter(|a| a.active_value(&var.name) == Some(value)).count() as f64;
            let bad_count =
                bad.iter().filter(|a| a.active_value(&var.name) == Some(value)).count() as f64;
            let l = (good_count + LAPLACE_ALPHA) / (good.len() as f64 + LAPLACE_ALPHA * k);
            let g = (bad_count + LAPLACE_ALPHA) / (bad.len() as f64 + LAPLACE_ALPHA * k);
            l / g
        })
        .collect()
}

/// Observed numeric values for `var` among a set of assignments.
fn numeric_observations(var: &DecisionVariable, assignments: &[Assignment]) -> Vec<f64> {
    assignments
        .iter()
        .filter_map(|a| match a.active_value(&var.name) {
            Some(Value::Num(n)) => Some(*n),
            _ => None,
        })
        .collect()
}

/// Silverman's rule-of-thumb bandwidth; falls back to a small fixed
/// bandwidth when too few observations exist to estimate spread.
fn silverman_bandwidth(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 1.0;
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    (1.06 * variance.sqrt() * n.powf(-0.2)).max(1e-3)
}

/// Average Gaussian-kernel density of `x` under the empirical distribution
/// `values`, with a floor so an empty or single-point set never yields a
/// zero density (which would make every ratio explode or vanish).
fn kde_density(x: f64, values: &[f64], bandwidth: f64) -> f64 {
    if values.is_empty() {
        return KDE_FLOOR;
    }
    let kernel = Normal::new(0.0, bandwidth).unwrap_or_else(|_| Normal::new(0.0, 1.0).unwrap());
    let density = values.iter().map(|&v| kernel.pdf(x - v)).sum::<f64>() / values.len() as f64;
    density.max(KDE_FLOOR)
}

fn numeric_weights(
    var: &DecisionVariable,
    numeric_domain: &[f64],
    good: &[Assignment],
    bad: &[Assignment],
) -> Vec<f64> {
    let good_values = numeric_observations(var, good);
    let bad_values = numeric_observations(var, bad);
    let h_good = silverman_bandwidth(&good_values);
    let h_bad = silverman_bandwidth(&bad_values);
    numeric_domain
        .iter()
        .map(|&x| kde_density(x, &good_values, h_good) / kde_density(x, &bad_values, h_bad))
        .collect()
}

impl Optimizer for TpeOptimizer {
    fn suggest(&mut self) -> Assignment {
        let space = self.space.clone();
        if self.history.len() < WARMUP_TRIALS {
            let rng = &mut self.rng;
            return sample_masked(&space, |var| uniform_choice(rng, var));
        }
        let (good, bad) = self.split();
        let rng = &mut self.rng;
        sample_masked(&space, |var| {
            if good.is_empty() || bad.is_empty() {
                uniform_choice(rng, var)
            } else {
                tpe_choice(rng, var, &good, &bad)
            }
        })
    }

    fn report(&mut self, observation: Observation) {
        let score = if observation.feasible {
            primary_objective(&self.objectives, &observation.objective_vector)
        } else {
            let best = self.history.iter().map(|(_, s)| *s).fold(f64::INFINITY, f64::min);
            super::penalty_score(best)
        };
        self.history.push((observation.assignment, score));
    }
}
