//! Orchestrator: drives the ask/build/run/aggregate/report/archive loop.
//! The only module holding mutable state: the trial counter, the
//! optimizer, and the open archive handle.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use log::{info, warn};
use tabled::{Table, Tabled};

use crate::aggregate;
use crate::archive::Archive;
use crate::build;
use crate::config::{self, StudyDefinition};
use crate::error::ScoutError;
use crate::materialize;
use crate::model::{Assignment, Backend, BuildStatus, Objective, RunStatus, SearchSpace, TrialRecord};
use crate::optimizer::{self, dominates, Observation};
use crate::run as runner;
use crate::space;

static SHUTDOWN: AtomicBool = AtomicBool::new(false);

extern "C" fn handle_signal(_sig: i32) {
    SHUTDOWN.store(true, Ordering::SeqCst);
}

/// Installs handlers for `SIGINT`/`SIGTERM` that flip a process-wide flag
/// checked between trials, so an interrupted run finishes the current
/// trial's archive write before exiting instead of stopping mid-write.
fn install_signal_handlers() {
    unsafe {
        libc::signal(libc::SIGINT, handle_signal as usize);
        libc::signal(libc::SIGTERM, handle_signal as usize);
    }
}

pub const DEFAULT_TRIALS: usize = 100;

pub struct RunOptions {
    pub trials: usize,
    pub seed_override: Option<u64>,
    pub resume: Option<PathBuf>,
    pub dry_run: bool,
}

impl Default for RunOptions {
    fn default() -> Self {
        RunOptions { trials: DEFAULT_TRIALS, seed_override: None, resume: None, dry_run: false }
    }
}

pub fn run(config_path: &Path, opts: RunOptions) -> Result<(), ScoutError> {
    install_signal_handlers();

    let mut study = config::load_study_definition(config_path)?;
    if let Some(seed) = opts.seed_override {
        study.search.random_seed = seed;
    }

    let search_space = space::compile(&study)?;
    let metric_names = declared_metric_names(&study);

    if opts.dry_run {
        return dry_run(&study, &search_space);
    }

    let mut sampler = optimizer::build_optimizer(
        study.search.sampler,
        search_space.clone(),
        study.objectives.clone(),
        &study.search,
    );

    let (mut archive, next_trial_id) = match &opts.resume {
        Some(path) => {
            let (archive, prior) = Archive::resume(path, &search_space, &metric_names)?;
            let next_id = prior.iter().map(|r| r.trial_id).max().map(|m| m + 1).unwrap_or(0);
            for record in prior {
                let feasible = record.is_feasible();
                let objective_vector = objective_vector(&study, &record.aggregated);
                sampler.report(Observation { assignment: record.assignment, objective_vector, feasible });
            }
            (archive, next_id)
        }
        None => (Archive::create(&study.csv_log, &search_space, &metric_names)?, 0),
    };

    let mut warned_metrics: HashSet<String> = HashSet::new();
    let mut trial_id = next_trial_id;
    let end_id = next_trial_id + opts.trials as u64;
    let mut completed_records: Vec<TrialRecord> = Vec::new();

    while trial_id < end_id {
        if SHUTDOWN.load(Ordering::SeqCst) {
            info!("shutdown requested, stopping before trial {}", trial_id);
            break;
        }

        let assignment = sampler.suggest();
        let record = run_one_trial(&study, &search_space, &metric_names, trial_id, &assignment, &mut warned_metrics);
        archive.append(&record, &search_space, &metric_names)?;

        info!(
            "trial {}/{}: {} -> {:?} ({})",
            trial_id + 1,
            end_id,
            summarize_assignment(&record.assignment),
            record.objective_vector,
            if record.is_feasible() { "ok".to_string() } else { record.run_status.to_string() }
        );

        sampler.report(Observation {
            assignment: record.assignment.clone(),
            objective_vector: record.objective_vector.clone(),
            feasible: record.is_feasible(),
        });

        completed_records.push(record);
        trial_id += 1;
    }

    print_summary(&study, &completed_records);
    Ok(())
}

fn dry_run(study: &StudyDefinition, space: &SearchSpace) -> Result<(), ScoutError> {
    let mut sampler = optimizer::build_optimizer(
        study.search.sampler,
        space.clone(),
        study.objectives.clone(),
        &study.search,
    );
    let assignment = sampler.suggest();
    let (build_plan, runtime_plan) = materialize::materialize(space, &assignment, study)?;
    println!("assignment: {}", summarize_assignment(&assignment));
    println!("trial_flags: {:?}", build_plan.trial_flags);
    println!("env: {:?}", runtime_plan.env);
    println!("program_args: {:?}", runtime_plan.program_args);
    Ok(())
}

fn run_one_trial(
    study: &StudyDefinition,
    space: &SearchSpace,
    metric_names: &[String],
    trial_id: u64,
    assignment: &Assignment,
    warned_metrics: &mut HashSet<String>,
) -> TrialRecord {
    let start = Instant::now();

    let (build_plan, runtime_plan) = match materialize::materialize(space, assignment, study) {
        Ok(plans) => plans,
        Err(e) => {
            return failed_record(trial_id, assignment.clone(), BuildStatus::MaterializationError, RunStatus::NotRun, start, &e)
        }
    };

    let workdir = match tempfile::Builder::new().prefix("scout-build-").tempdir() {
        Ok(dir) => dir,
        Err(e) => {
            return failed_record(trial_id, assignment.clone(), BuildStatus::Failed, RunStatus::NotRun, start, &ScoutError::Io(e))
        }
    };

    let build_outcome = build::build(study, &build_plan, workdir.path(), build::DEFAULT_BUILD_TIMEOUT);
    if build_outcome.status != BuildStatus::Ok {
        return TrialRecord {
            trial_id,
            assignment: assignment.clone(),
            build_status: build_outcome.status,
            run_status: RunStatus::NotRun,
            raw_samples: BTreeMap::new(),
            aggregated: BTreeMap::new(),
            objective_vector: Vec::new(),
            wallclock: start.elapsed(),
            error_code: Some(build_outcome.status.to_string()),
            error_message: Some(truncate_log(&build_outcome.log)),
        };
    }

    let artifact = build_outcome.artifact.expect("Ok build status always carries an artifact");
    let backend_config = match study.backend {
        Backend::Likwid => study.likwid.as_ref().expect("validated at config load"),
        Backend::Perf => study.perf.as_ref().expect("validated at config load"),
    };

    let run_outcome = runner::measure(
        study.backend,
        backend_config,
        &artifact,
        &runtime_plan,
        study.runs,
        runner::DEFAULT_RUN_TIMEOUT,
    );
    let aggregated = aggregate::aggregate(backend_config, &run_outcome.samples);

    for objective in &study.objectives {
        if !aggregated.contains_key(&objective.metric) && warned_metrics.insert(objective.metric.clone()) {
            warn!("metric '{}' missing from trial {} output", objective.metric, trial_id);
        }
    }

    let missing_objective = study.objectives.iter().any(|o| !aggregated.contains_key(&o.metric));
    let run_status = if run_outcome.status == RunStatus::Ok && missing_objective {
        RunStatus::MetricMissing
    } else {
        run_outcome.status
    };

    TrialRecord {
        trial_id,
        assignment: assignment.clone(),
        build_status: BuildStatus::Ok,
        run_status,
        raw_samples: run_outcome.samples,
        objective_vector: objective_vector(study, &aggregated),
        aggregated,
        wallclock: start.elapsed(),
        error_code: if run_status == RunStatus::Ok { None } else { Some(run_status.to_string()) },
        error_message: if run_outcome.log.is_empty() { None } else { Some(truncate_log(&run_outcome.log)) },
    }
}

fn failed_record(
    trial_id: u64,
    assignment: Assignment,
    build_status: BuildStatus,
    run_status: RunStatus,
    start: Instant,
    err: &ScoutError,
) -> TrialRecord {
    TrialRecord {
        trial_id,
        assignment,
        build_status,
        run_status,
        raw_samples: BTreeMap::new(),
        aggregated: BTreeMap::new(),
        objective_vector: Vec::new(),
        wallclock: start.elapsed(),
        error_code: Some(err.code().to_string()),
        error_message: Some(err.short_message()),
    }
}

const MAX_LOG_LEN: usize = 240;

fn truncate_log(log: &str) -> String {
    if log.len() <= MAX_LOG_LEN {
        log.to_string()
    } else {
        let cut = (0..=MAX_LOG_LEN).rev().find(|&i| log.is_char_boundary(i)).unwrap_or(0);
        format!("{}...", &log[..cut])
    }
}

/// All archive metric columns, in declaration order: each metric's own
/// name, plus a `<metric>_var` column right after it for metrics declared
/// with `var: true` (matching the columns `aggregate::aggregate` emits).
fn declared_metric_names(study: &StudyDefinition) -> Vec<String> {
    let backend_config = match study.backend {
        Backend::Likwid => study.likwid.as_ref(),
        Backend::Perf => study.perf.as_ref(),
    };
    let mut names = Vec::new();
    if let Some(b) = backend_config {
        for m in &b.metrics {
            names.push(m.name.clone());
            if m.var {
                names.push(format!("{}_var", m.name));
            }
        }
    }
    names
}

fn objective_vector(study: &StudyDefinition, aggregated: &BTreeMap<String, f64>) -> Vec<f64> {
    study.objectives.iter().map(|o| *aggregated.get(&o.metric).unwrap_or(&0.0)).collect()
}

fn summarize_assignment(assignment: &Assignment) -> String {
    assignment
        .0
        .iter()
        .filter_map(|(name, v)| v.as_active().map(|value| format!("{}={}", name, value)))
        .collect::<Vec<_>>()
        .join(",")
}

#[derive(Tabled)]
struct SummaryRow {
    #[tabled(rename = "trial")]
    trial_id: u64,
    #[tabled(rename = "assignment")]
    assignment: String,
    #[tabled(rename = "objectives")]
    objectives: String,
}

fn print_summary(study: &StudyDefinition, records: &[TrialRecord]) {
    let feasible: Vec<&TrialRecord> = records.iter().filter(|r| r.is_feasible()).collect();
    if feasible.is_empty() {
        println!("no feasible trials completed");
        return;
    }

    let front = pareto_front(&study.objectives, &feasible);
    let rows: Vec<SummaryRow> = front
        .iter()
        .map(|r| SummaryRow {
            trial_id: r.trial_id,
            assignment: summarize_assignment(&r.assignment),
            objectives: format!("{:?}", r.objective_vector),
        })
        .collect();
    println!("{}", Table::new(rows));
}

/// The set of feasible trials not dominated by any other feasible trial.
fn pareto_front<'a>(objectives: &[Objective], records: &[&'a TrialRecord]) -> Vec<&'a TrialRecord> {
    records
        .iter()
        .filter(|candidate| {
            !records.iter().any(|other| {
                !std::ptr::eq(*other, *candidate)
                    && dominates(objectives, &other.objective_vector, &candidate.objective_vector)
            })
        })
        .cloned()
        .collect()
}
