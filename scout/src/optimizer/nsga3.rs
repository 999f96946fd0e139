//! Hand-rolled NSGA-III: non-dominated sorting plus reference-point
//! association and niching, generation over the Space Compiler's finite
//! discrete decision variables.

use std::collections::VecDeque;

use rand::rngs::StdRng;
use rand::Rng;

use crate::model::{Assignment, DecisionVariable, Goal, Objective, SearchSpace, Value};

use super::{dominates, sample_masked, Observation, Optimizer};

const MUTATION_RATE: f64 = 0.1;

#[derive(Clone)]
struct Individual {
    assignment: Assignment,
    objectives: Vec<f64>,
    rank: usize,
}

pub struct Nsga3Optimizer {
    space: SearchSpace,
    objectives: Vec<Objective>,
    population_size: usize,
    rng: StdRng,
    population: Vec<Individual>,
    pending: VecDeque<Assignment>,
    collecting: Vec<Individual>,
}

impl Nsga3Optimizer {
    pub fn new(
        space: SearchSpace,
        objectives: Vec<Objective>,
        population_size: usize,
        rng: StdRng,
    ) -> Self {
        Nsga3Optimizer {
            space,
            objectives,
            population_size: population_size.max(2),
            rng,
            population: Vec::new(),
            pending: VecDeque::new(),
            collecting: Vec::new(),
        }
    }

    fn refill_pending(&mut self) {
        let batch = if self.population.is_empty() {
            random_batch(&self.space, self.population_size, &mut self.rng)
        } else {
            offspring_batch(&self.space, &self.population, self.population_size, &mut self.rng)
        };
        self.pending.extend(batch);
    }

    /// Minimization-oriented objective vector (sign-flipped for `Goal::Max`).
    fn oriented(&self, raw: &[f64]) -> Vec<f64> {
        self.objectives
            .iter()
            .zip(raw)
            .map(|(obj, v)| match obj.goal {
                Goal::Min => *v,
                Goal::Max => -*v,
            })
            .collect()
    }
}

fn random_batch(space: &SearchSpace, n: usize, rng: &mut StdRng) -> Vec<Assignment> {
    (0..n)
        .map(|_| sample_masked(space, |var| uniform_choice(rng, var)))
        .collect()
}

fn offspring_batch(
    space: &SearchSpace,
    population: &[Individual],
    n: usize,
    rng: &mut StdRng,
) -> Vec<Assignment> {
    (0..n)
        .map(|_| {
            let a = tournament(population, rng);
            let b = tournament(population, rng);
            crossover_and_mutate(space, &a.assignment, &b.assignment, rng)
        })
        .collect()
}

fn tournament<'a>(population: &'a [Individual], rng: &mut StdRng) -> &'a Individual {
    let i = rng.gen_range(0..population.len());
    let j = rng.gen_range(0..population.len());
    if population[i].rank <= population[j].rank {
        &population[i]
    } else {
        &population[j]
    }
}

fn crossover_and_mutate(
    space: &SearchSpace,
    a: &Assignment,
    b: &Assignment,
    rng: &mut StdRng,
) -> Assignment {
    sample_masked(space, |var| {
        if rng.gen_bool(MUTATION_RATE) {
            return uniform_choice(rng, var);
        }
        let parent = if rng.gen_bool(0.5) { a } else { b };
        parent
            .active_value(&var.name)
            .cloned()
            .unwrap_or_else(|| uniform_choice(rng, var))
    })
}

fn uniform_choice(rng: &mut StdRng, var: &DecisionVariable) -> Value {
    let idx = rng.gen_range(0..var.domain.len());
    var.domain[idx].clone()
}

/// Standard fast non-dominated sort, returning each front as a list of
/// indices into `individuals`.
fn fast_non_dominated_sort(objectives: &[Objective], individuals: &[Vec<f64>]) -> Vec<Vec<usize>> {
    let n = individuals.len();
    let mut dominated_by: Vec<Vec<usize>> = vec![Vec::new(); n];
    let mut domination_count = vec![0usize; n];
    let mut fronts: Vec<Vec<usize>> = vec![Vec::new()];

    for i in 0..n {
        for j in 0..n {
            if i == j {
                continue;
            }
            if dominates(objectives, &individuals[i], &individuals[j]) {
                dominated_by[i].push(j);
            } else if dominates(objectives, &individuals[j], &individuals[i]) {
                domination_count[i] += 1;
            }
        }
        if domination_count[i] == 0 {
            fronts[0].push(i);
        }
    }

    let mut k = 0;
    while !fronts[k].is_empty() {
        let mut next = Vec::new();
        for &i in &fronts[k] {
            for &j in &dominated_by[i] {
                domination_count[j] -= 1;
                if domination_count[j] == 0 {
                    next.push(j);
                }
            }
        }
        k += 1;
        fronts.push(next);
    }
    fronts.pop();
    fronts
}

/// Das-Dennis structured reference points on the unit simplex, scaled to
/// `objectives.len()` dimensions with as few divisions `p` as needed to
/// reach at least `target` points.
fn reference_points(num_objectives: usize, target: usize) -> Vec<Vec<f64>> {
    if num_objectives <= 1 {
        return vec![vec![1.0]];
    }
    let mut p = 1;
    loop {
        let count = das_dennis_count(p, num_objectives);
        if count >= target || p > 20 {
            break;
        }
        p += 1;
    }
    das_dennis(p, num_objectives)
}

fn das_dennis_count(p: usize, m: usize) -> usize {
    // C(p + m - 1, m - 1)
    let n = p + m - 1;
    let k = m - 1;
    binomial(n, k)
}

fn binomial(n: usize, k: usize) -> usize {
    if k > n {
        return 0;
    }
    let k = k.min(n - k);
    let mut result = 1usize;
    for i in 0..k {
        result = result * (n - i) / (i + 1);
    }
    result
}

fn das_dennis(p: usize, m: usize) -> Vec<Vec<f64>> {
    let mut points = Vec::new();
    let mut current = vec![0usize; m];
    das_dennis_recurse(p, m, 0, p, &mut current, &mut points);
    points
        .into_iter()
        .map(|combo| combo.iter().map(|&c| c as f64 / p as f64).collect())
        .collect()
}

fn das_dennis_recurse(
    p: usize,
    m: usize,
    depth: usize,
    remaining: usize,
    current: &mut Vec<usize>,
    out: &mut Vec<Vec<usize>>,
) {
    if depth == m - 1 {
        current[depth] = remaining;
        out.push(current.clone());
        return;
    }
    for v in 0..=remaining {
        current[depth] = v;
        das_dennis_recurse(p, m, depth + 1, remaining - v, current, out);
    }
}

/// Normalizes combined-population objectives to `[0, 1]` per dimension
/// (ideal point at the minimum, nadir approximated by the per-objective
/// maximum among the supplied individuals), then associates each to its
/// nearest reference line and niches down to `capacity` survivors.
fn environmental_select(
    objectives: &[Objective],
    oriented: Vec<Vec<f64>>,
    capacity: usize,
) -> Vec<usize> {
    let fronts = fast_non_dominated_sort(objectives, &oriented);

    let mut selected = Vec::new();
    let mut last_front: Vec<usize> = Vec::new();
    for front in &fronts {
        if selected.len() + front.len() <= capacity {
            selected.extend(front.iter().cloned());
        } else {
            last_front = front.clone();
            break;
        }
    }

    if selected.len() == capacity || last_front.is_empty() {
        selected.truncate(capacity);
        return selected;
    }

    let m = objectives.len().max(1);
    let ideal: Vec<f64> = (0..m)
        .map(|d| oriented.iter().map(|v| v[d]).fold(f64::INFINITY, f64::min))
        .collect();
    let nadir: Vec<f64> = (0..m)
        .map(|d| oriented.iter().map(|v| v[d]).fold(f64::NEG_INFINITY, f64::max))
        .collect();
    let span: Vec<f64> = ideal
        .iter()
        .zip(&nadir)
        .map(|(i, n)| if (n - i).abs() < 1e-9 { 1.0 } else { n - i })
        .collect();

    let normalize = |v: &[f64]| -> Vec<f64> {
        v.iter().zip(&ideal).zip(&span).map(|((x, i), s)| (x - i) / s).collect()
    };

    let refs = reference_points(m, capacity);

    let mut niche_count = vec![0usize; refs.len()];
    for &idx in &selected {
        let (r, _) = nearest_reference(&normalize(&oriented[idx]), &refs);
        niche_count[r] += 1;
    }

    let mut remaining: Vec<(usize, usize, f64)> = last_front
        .iter()
        .map(|&idx| {
            let (r, d) = nearest_reference(&normalize(&oriented[idx]), &refs);
            (idx, r, d)
        })
        .collect();

    while selected.len() < capacity && !remaining.is_empty() {
        remaining.sort_by(|a, b| {
            let count_a = niche_count[a.1];
            let count_b = niche_count[b.1];
            count_a.cmp(&count_b).then(a.2.partial_cmp(&b.2).unwrap())
        });
        let (idx, r, _) = remaining.remove(0);
        selected.push(idx);
        niche_count[r] += 1;
    }

    selected
}

fn nearest_reference(point: &[f64], refs: &[Vec<f64>]) -> (usize, f64) {
    let mut best = (0usize, f64::INFINITY);
    for (i, r) in refs.iter().enumerate() {
        let norm_sq: f64 = r.iter().map(|x| x * x).sum();
        let norm = norm_sq.sqrt().max(1e-9);
        let dot: f64 = point.iter().zip(r).map(|(p, r)| p * r).sum();
        let t = dot / norm;
        let perp_sq: f64 = point
            .iter()
            .zip(r)
            .map(|(p, r)| {
                let proj = t * (r / norm);
                (p - proj).powi(2)
            })
            .sum();
        let dist = perp_sq.sqrt();
        if dist < best.1 {
            best = (i, dist);
        }
    }
    best
}

impl Optimizer for Nsga3Optimizer {
    fn suggest(&mut self) -> Assignment {
        if self.pending.is_empty() {
            self.refill_pending();
        }
        if let Some(a) = self.pending.pop_front() {
            return a;
        }
        let space = self.space.clone();
        let rng = &mut self.rng;
        sample_masked(&space, |var| uniform_choice(rng, var))
    }

    fn report(&mut self, observation: Observation) {
        let mut oriented = self.oriented(&observation.objective_vector);
        if !observation.feasible {
            // Infeasible trials are pushed to the worst end of every
            // objective so they never survive environmental selection
            // ahead of a feasible trial.
            for v in oriented.iter_mut() {
                *v += 1e6;
            }
        }
        self.collecting.push(Individual { assignment: observation.assignment, objectives: oriented, rank: 0 });

        if self.collecting.len() < self.population_size {
            return;
        }

        let mut combined: Vec<Individual> = self.population.drain(..).collect();
        combined.extend(self.collecting.drain(..));

        let objective_vectors: Vec<Vec<f64>> = combined.iter().map(|ind| ind.objectives.clone()).collect();
        let survivors = environmental_select(&self.objectives, objective_vectors.clone(), self.population_size);

        let fronts = fast_non_dominated_sort(&self.objectives, &objective_vectors);
        let mut rank_of = vec![usize::MAX; combined.len()];
        for (rank, front) in fronts.iter().enumerate() {
            for &idx in front {
                rank_of[idx] = rank;
            }
        }

        self.population = survivors
            .into_iter()
            .map(|idx| {
                let mut ind = combined[idx].clone();
                ind.rank = rank_of[idx];
                ind
            })
            .collect();
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
    fn survives_a_full_generation_cycle() {
        let mut opt = Nsga3Optimizer::new(
            toy_space(),
            vec![Objective { metric: "CPI".into(), goal: Goal::Min }],
            4,
            rand::SeedableRng::seed_from_u64(1),
        );
        for i in 0..4 {
            let a = opt.suggest();
            opt.report(Observation { assignment: a, objective_vector: vec![i as f64], feasible: true });
        }
        assert_eq!(opt.population.len(), 4);
        let next = opt.suggest();
        assert!(next.get("opt_level").is_some());
    }

    #[test]
    fn dominance_ranks_single_objective_like_plain_minimization() {
        let objectives = vec![Objective { metric: "CPI".into(), goal: Goal::Min }];
        assert!(dominates(&objectives, &[1.0], &[2.0]));
        assert!(!dominates(&objectives, &[2.0], &[1.0]));
    }

    #[test]
    fn reference_points_cover_at_least_the_target_count() {
        let refs = reference_points(2, 10);
        assert!(refs.len() >= 10);
    }
}
