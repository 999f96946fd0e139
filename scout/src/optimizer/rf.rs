//! Hand-rolled random-forest surrogate: an ensemble of CART regression
//! trees over ordinal-encoded decision variables, fit on (assignment,
//! objective[0]) pairs and used to rank randomly generated candidates by
//! predicted mean.

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::Rng;

use crate::model::{Assignment, DecisionVariable, Objective, SearchSpace, Value};

use super::{primary_objective, sample_masked, Observation, Optimizer};

const WARMUP_TRIALS: usize = 15;
const NUM_TREES: usize = 30;
const MAX_DEPTH: usize = 6;
const MIN_LEAF_SIZE: usize = 3;
const CANDIDATE_POOL: usize = 64;

/// A variable's assignment encoded as an ordinal index into its domain, one
/// past the end (`domain.len()`) standing in for "inactive".
type FeatureVector = Vec<usize>;

enum Tree {
    Leaf(f64),
    Split { feature: usize, value: usize, left: Box<Tree>, right: Box<Tree> },
}

impl Tree {
    fn predict(&self, features: &FeatureVector) -> f64 {
        match self {
            Tree::Leaf(v) => *v,
            Tree::Split { feature, value, left, right } => {
                if features[*feature] == *value {
                    left.predict(features)
                } else {
                    right.predict(features)
                }
            }
        }
    }
}

pub struct RfOptimizer {
    space: SearchSpace,
    objectives: Vec<Objective>,
    rng: StdRng,
    history: Vec<(Assignment, f64)>,
}

impl RfOptimizer {
    pub fn new(space: SearchSpace, objectives: Vec<Objective>, rng: StdRng) -> Self {
        RfOptimizer { space, objectives, rng, history: Vec::new() }
    }

    fn encode(&self, assignment: &Assignment) -> FeatureVector {
        self.space
            .variables
            .iter()
            .map(|var| {
                match assignment.active_value(&var.name) {
                    Some(v) => var.domain.iter().position(|d| d == v).unwrap_or(var.domain.len()),
                    None => var.domain.len(),
                }
            })
            .collect()
    }

    fn train_forest(&mut self) -> Vec<Tree> {
        let dataset: Vec<(FeatureVector, f64)> = self
            .history
            .iter()
            .map(|(a, score)| (self.encode(a), *score))
            .collect();
        let n_features = self.space.variables.len();
        let feature_subset_size = (n_features as f64).sqrt().ceil().max(1.0) as usize;

        (0..NUM_TREES)
            .map(|_| {
                let bootstrap: Vec<(FeatureVector, f64)> = (0..dataset.len())
                    .map(|_| {
                        let idx = self.rng.gen_range(0..dataset.len());
                        dataset[idx].clone()
                    })
                    .collect();
                build_tree(&bootstrap, n_features, feature_subset_size, 0, &mut self.rng)
            })
            .collect()
    }

    fn predict(forest: &[Tree], features: &FeatureVector) -> f64 {
        let sum: f64 = forest.iter().map(|t| t.predict(features)).sum();
        sum / forest.len() as f64
    }
}

fn build_tree(
    data: &[(FeatureVector, f64)],
    n_features: usize,
    subset_size: usize,
    depth: usize,
    rng: &mut StdRng,
) -> Tree {
    if data.len() <= MIN_LEAF_SIZE || depth >= MAX_DEPTH || is_constant(data) {
        return Tree::Leaf(mean(data));
    }

    let mut feature_order: Vec<usize> = (0..n_features).collect();
    feature_order.shuffle(rng);
    let candidate_features = &feature_order[..subset_size.min(n_features)];

    let mut best: Option<(usize, usize, f64, Vec<usize>, Vec<usize>)> = None;
    for &feature in candidate_features {
        let mut values: Vec<usize> = data.iter().map(|(f, _)| f[feature]).collect();
        values.sort_unstable();
        values.dedup();
        for &value in &values {
            let (left, right): (Vec<usize>, Vec<usize>) = (0..data.len())
                .partition(|&i| data[i].0[feature] == value);
            if left.is_empty() || right.is_empty() {
                continue;
            }
            let score = variance_reduction(data, &left, &right);
            if best.as_ref().map(|(_, _, best_score, ..)| score > *best_score).unwrap_or(true) {
                best = Some((feature, value, score, left, right));
            }
        }
    }

    match best {
        None => Tree::Leaf(mean(data)),
        Some((feature, value, _, left_idx, right_idx)) => {
            let left_data: Vec<_> = left_idx.iter().map(|&i| data[i].clone()).collect();
            let right_data: Vec<_> = right_idx.iter().map(|&i| data[i].clone()).collect();
            Tree::Split {
                feature,
                value,
                left: Box::new(build_tree(&left_data, n_features, subset_size, depth + 1, rng)),
                right: Box::new(build_tree(&right_data, n_features, subset_size, depth + 1, rng)),
            }
        }
    }
}

fn is_constant(data: &[(FeatureVector, f64)]) -> bool {
    data.windows(2).all(|w| (w[0].1 - w[1].1).abs() < 1e-12)
}

fn mean(data: &[(FeatureVector, f64)]) -> f64 {
    if data.is_empty() {
        return 0.0;
    }
    data.iter().map(|(_, y)| y).sum::<f64>() / data.len() as f64
}

fn variance_reduction(data: &[(FeatureVector, f64)], left: &[usize], right: &[usize]) -> f64 {
    let total_var = variance_of(data.iter().map(|(_, y)| *y));
    let left_var = variance_of(left.iter().map(|&i| data[i].1));
    let right_var = variance_of(right.iter().map(|&i| data[i].1));
    let n = data.len() as f64;
    let weighted = (left.len() as f64 / n) * left_var + (right.len() as f64 / n) * right_var;
    total_var - weighted
}

fn variance_of(values: impl Iterator<Item = f64> + Clone) -> f64 {
    let n = values.clone().count() as f64;
    if n == 0.0 {
        return 0.0;
    }
    let mean = values.clone().sum::<f64>() / n;
    values.map(|v| (v - mean).powi(2)).sum::<f64>() / n
}

fn uniform_choice(rng: &mut StdRng, var: &DecisionVariable) -> Value {
    let idx = rng.gen_range(0..var.domain.len());
    var.domain[idx].clone()
}

impl Optimizer for RfOptimizer {
    fn suggest(&mut self) -> Assignment {
        let space = self.space.clone();
        if self.history.len() < WARMUP_TRIALS {
            let rng = &mut self.rng;
            return sample_masked(&space, |var| uniform_choice(rng, var));
        }

        let forest = self.train_forest();
        let candidates: Vec<Assignment> = {
            let rng = &mut self.rng;
            (0..CANDIDATE_POOL)
                .map(|_| sample_masked(&space, |var| uniform_choice(rng, var)))
                .collect()
        };

        // Expected improvement over this forest would weigh each candidate's
        // predicted mean against the trees' disagreement (predictive
        // variance); we simplify to greedy argmin over the predicted mean
        // alone, which is pulled toward unexplored regions mainly by the
        // candidate pool being freshly resampled each call rather than by
        // an explicit uncertainty term.
        candidates
            .into_iter()
            .min_by(|a, b| {
                let fa = Self::predict(&forest, &self.encode(a));
                let fb = Self::predict(&forest, &self.encode(b));
                fa.partial_cmp(&fb).unwrap()
            })
            .expect("candidate pool is never empty")
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{DecisionKind, Goal};

    fn toy_space() -> SearchSpace {
        SearchSpace {
            variables: vec![DecisionVariable {
                name: "opt_level".into(),
                kind: DecisionKind::Choice,
                domain: vec![Value::Str("-O2".into()), Value::Str("-O3".into())],
                guard: None,
            }],
        }
    }

    #[test]
    fn warmup_trials_sample_uniformly() {
        let mut opt = RfOptimizer::new(
            toy_space(),
            vec![Objective { metric: "CPI".into(), goal: Goal::Min }],
            rand::SeedableRng::seed_from_u64(0),
        );
        for _ in 0..WARMUP_TRIALS {
            let a = opt.suggest();
            opt.report(Observation { assignment: a, objective_vector: vec![1.0], feasible: true });
        }
        assert_eq!(opt.history.len(), WARMUP_TRIALS);
    }

    #[test]
    fn variance_reduction_is_zero_for_a_useless_split() {
        let data = vec![(vec![0usize], 1.0), (vec![1usize], 1.0)];
        let left = vec![0usize];
        let right = vec![1usize];
        assert!(variance_reduction(&data, &left, &right).abs() < 1e-12);
    }

    #[test]
    fn tree_predicts_constant_leaf_for_uniform_targets() {
        let data = vec![(vec![0usize], 3.0), (vec![1usize], 3.0), (vec![0usize], 3.0), (vec![1usize], 3.0)];
        let mut rng = rand::SeedableRng::seed_from_u64(0);
        let tree = build_tree(&data, 1, 1, 0, &mut rng);
        assert_eq!(tree.predict(&vec![0]), 3.0);
    }
}
