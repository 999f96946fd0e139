//! Optimizer façade: a common `Optimizer` trait implemented by each sampler
//! backend, dispatched by `search.sampler`.

mod nsga3;
mod rf;
mod tpe;

use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::config::{Sampler, SearchConfig};
use crate::guard;
use crate::model::{AssignedValue, Assignment, DecisionVariable, Goal, Objective, SearchSpace, Value};

/// One completed trial's observation, folded back into the sampler after a
/// build+run+aggregate cycle.
#[derive(Debug, Clone)]
pub struct Observation {
    pub assignment: Assignment,
    pub objective_vector: Vec<f64>,
    pub feasible: bool,
}

/// Shared contract for the three sampler backends: `suggest` proposes the
/// next candidate, `report` folds a completed trial's outcome back into the
/// sampler's internal model.
pub trait Optimizer {
    fn suggest(&mut self) -> Assignment;
    fn report(&mut self, observation: Observation);
}

pub fn build_optimizer(
    sampler: Sampler,
    space: SearchSpace,
    objectives: Vec<Objective>,
    search: &SearchConfig,
) -> Box<dyn Optimizer> {
    let rng = StdRng::seed_from_u64(search.random_seed);
    match sampler {
        Sampler::Tpe => Box::new(tpe::TpeOptimizer::new(space, objectives, rng)),
        Sampler::Nsga3 => {
            Box::new(nsga3::Nsga3Optimizer::new(space, objectives, search.population_size, rng))
        }
        Sampler::Rf => Box::new(rf::RfOptimizer::new(space, objectives, rng)),
    }
}

/// Samples one variable at a time in the space's (already topological)
/// declaration order, evaluating each guard against the assignment built so
/// far and delegating the active-branch choice to `choose`. Shared by every
/// sampler backend so guard-masking logic lives in exactly one place rather
/// than being reimplemented by each sampler.
pub(crate) fn sample_masked(
    space: &SearchSpace,
    mut choose: impl FnMut(&DecisionVariable) -> Value,
) -> Assignment {
    let mut assignment = Assignment::new();
    for var in &space.variables {
        let active = match &var.guard {
            None => true,
            Some(guard) => guard::evaluate(guard, &assignment).unwrap_or(false),
        };
        if active {
            let value = choose(var);
            assignment.insert(var.name.clone(), AssignedValue::Active(value));
        } else {
            assignment.insert(var.name.clone(), AssignedValue::Inactive);
        }
    }
    assignment
}

/// The single scalar TPE and RF steer on: `objective_vector[0]`, sign-flipped
/// for `Goal::Max` so the result is always a "lower is better" score. Per
/// spec.md §4.5, both of these single-surrogate samplers use objective
/// index 0 only — additional objectives are recorded in the archive but not
/// steered on (that's NSGA-III's job).
pub(crate) fn primary_objective(objectives: &[Objective], objective_vector: &[f64]) -> f64 {
    let v = objective_vector[0];
    match objectives[0].goal {
        Goal::Min => v,
        Goal::Max => -v,
    }
}

/// A fixed penalty worse than any feasible score observed so far,
/// used to fold infeasible trials into a scalar optimizer's history without
/// treating them as fatal — they steer the optimizer away without aborting
/// the exploration.
const PENALTY_MARGIN: f64 = 1e6;

pub(crate) fn penalty_score(history_best: f64) -> f64 {
    if history_best.is_finite() {
        history_best + PENALTY_MARGIN
    } else {
        PENALTY_MARGIN
    }
}

/// True multi-objective (Pareto) dominance: `a` dominates `b` when every
/// minimized-orientation objective of `a` is <= the corresponding one of
/// `b`, with at least one strictly less.
pub(crate) fn dominates(objectives: &[Objective], a: &[f64], b: &[f64]) -> bool {
    let mut strictly_better = false;
    for (obj, (x, y)) in objectives.iter().zip(a.iter().zip(b.iter())) {
        let (x, y) = match obj.goal {
            Goal::Min => (*x, *y),
            Goal::Max => (-*x, -*y),
        };
        if x > y {
            return false;
        }
        if x < y {
            strictly_better = true;
        }
    }
    strictly_better
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn penalty_score_beats_any_feasible_history_on_the_same_objective() {
        let objectives = vec![Objective { metric: "CPI".into(), goal: Goal::Min }];
        let best_feasible = 1.5;
        let penalized = penalty_score(best_feasible);
        // A feasible trial at or below the best-seen score always dominates
        // a penalized one on the same single objective.
        assert!(dominates(&objectives, &[best_feasible], &[penalized]));
        assert!(!dominates(&objectives, &[penalized], &[best_feasible]));
    }

    #[test]
    fn penalty_score_falls_back_to_margin_when_history_is_empty() {
        assert_eq!(penalty_score(f64::INFINITY), PENALTY_MARGIN);
    }

    #[test]
    fn primary_objective_flips_sign_for_a_maximize_goal() {
        let objectives = vec![
            Objective { metric: "CPI".into(), goal: Goal::Max },
            Objective { metric: "vector_ratio".into(), goal: Goal::Min },
        ];
        assert_eq!(primary_objective(&objectives, &[2.0, 3.0]), -2.0);
    }

    #[test]
    fn primary_objective_ignores_objectives_past_index_zero() {
        let objectives = vec![
            Objective { metric: "CPI".into(), goal: Goal::Min },
            Objective { metric: "vector_ratio".into(), goal: Goal::Max },
        ];
        assert_eq!(primary_objective(&objectives, &[2.0, 1000.0]), 2.0);
    }

    #[test]
    fn dominates_requires_strict_improvement_on_at_least_one_objective() {
        let objectives = vec![
            Objective { metric: "a".into(), goal: Goal::Min },
            Objective { metric: "b".into(), goal: Goal::Min },
        ];
        // Identical vectors dominate neither each other...
        assert!(!dominates(&objectives, &[1.0, 1.0], &[1.0, 1.0]));
        // ...but a strict improvement on one objective with no regression
        // on the other does dominate.
        assert!(dominates(&objectives, &[0.5, 1.0], &[1.0, 1.0]));
        // A trade-off (better on one, worse on the other) dominates neither way.
        assert!(!dominates(&objectives, &[0.5, 2.0], &[1.0, 1.0]));
        assert!(!dominates(&objectives, &[1.0, 1.0], &[0.5, 2.0]));
    }
}
