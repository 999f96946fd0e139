//! End-to-end pipeline tests driven entirely against fake tools: a fake
//! compiler that writes a tiny shell-script "artifact", and fake `perf`/
//! `likwid-perfctr` wrappers that run that artifact and emit canned
//! measurement output. No real hardware counters or real compiler needed.

use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use tempfile::tempdir;

use scout::model::{AssignedValue, Assignment, BuildStatus, RunStatus, Value};
use scout::optimizer::{build_optimizer, Optimizer};

static ENV_LOCK: Mutex<()> = Mutex::new(());

fn fixtures_dir() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures")
}

fn fixture(name: &str) -> PathBuf {
    fixtures_dir().join(name)
}

/// Prepends `tests/fixtures` to `PATH` and sets any extra env vars for the
/// duration of `f`, restoring prior state afterward. Serialized across
/// tests with `ENV_LOCK` since `PATH`/env mutation here is process-global.
fn with_fixture_env<F: FnOnce() -> T, T>(extra_env: &[(&str, &str)], f: F) -> T {
    let _guard = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());

    let original_path = std::env::var_os("PATH");
    let mut new_path = std::ffi::OsString::from(fixtures_dir());
    if let Some(orig) = &original_path {
        new_path.push(":");
        new_path.push(orig);
    }
    std::env::set_var("PATH", &new_path);

    let mut previous = Vec::new();
    for (k, v) in extra_env {
        previous.push((*k, std::env::var(k).ok()));
        std::env::set_var(k, v);
    }

    let result = f();

    match original_path {
        Some(p) => std::env::set_var("PATH", p),
        None => std::env::remove_var("PATH"),
    }
    for (k, v) in previous {
        match v {
            Some(val) => std::env::set_var(k, val),
            None => std::env::remove_var(k),
        }
    }
    result
}

fn perf_study_json(csv_path: &Path, runs: usize) -> String {
    format!(
        r#"{{
            "backend": "perf",
            "project": {{"source": "{src}", "compiler": "{cc}"}},
            "compiler_flags": ["-O2", "-O3"],
            "objectives": [{{"metric": "CPI", "goal": "min"}}],
            "search": {{"sampler": "tpe", "population_size": 10, "random_seed": 1}},
            "perf": {{"events": ["cycles", "instructions"], "metrics": ["CPI"], "core_list": [0]}},
            "runs": {runs},
            "csv_log": "{csv}"
        }}"#,
        src = fixture("x.c").display(),
        cc = fixture("fake_cc.sh").display(),
        runs = runs,
        csv = csv_path.display(),
    )
}

/// Scenario: single-source project, one trial, perf backend. Exactly one
/// build and one `perf stat` run should produce a finite, positive CPI and a
/// well-formed archive row.
#[test]
fn single_source_one_trial_perf_backend() {
    let archive_dir = tempdir().unwrap();
    let csv_path = archive_dir.path().join("archive.csv");
    let config_json = perf_study_json(&csv_path, 1);

    let study = scout::config::parse_study_definition(&config_json).unwrap();
    let space = scout::space::compile(&study).unwrap();
    let metric_names = vec!["CPI".to_string()];

    let mut sampler =
        build_optimizer(study.search.sampler, space.clone(), study.objectives.clone(), &study.search);
    let assignment = sampler.suggest();
    let (build_plan, runtime_plan) = scout::materialize::materialize(&space, &assignment, &study).unwrap();

    let workdir = tempdir().unwrap();
    let build_outcome = scout::build::build(&study, &build_plan, workdir.path(), Duration::from_secs(10));
    assert_eq!(build_outcome.status, BuildStatus::Ok, "build log: {}", build_outcome.log);
    let artifact = build_outcome.artifact.unwrap();

    let backend_config = study.perf.as_ref().unwrap();
    let run_outcome = with_fixture_env(&[], || {
        scout::run::measure(
            study.backend,
            backend_config,
            &artifact,
            &runtime_plan,
            study.runs,
            Duration::from_secs(10),
        )
    });
    assert_eq!(run_outcome.status, RunStatus::Ok, "run log: {}", run_outcome.log);
    assert_eq!(run_outcome.samples["cycles"].len(), 1);

    let aggregated = scout::aggregate::aggregate(backend_config, &run_outcome.samples);
    let cpi = aggregated["CPI"];
    assert!(cpi.is_finite() && cpi > 0.0);

    let mut archive = scout::archive::Archive::create(&csv_path, &space, &metric_names).unwrap();
    let record = scout::model::TrialRecord {
        trial_id: 0,
        assignment,
        build_status: build_outcome.status,
        run_status: run_outcome.status,
        raw_samples: run_outcome.samples,
        aggregated: aggregated.clone(),
        objective_vector: vec![cpi],
        wallclock: Duration::from_millis(1),
        error_code: None,
        error_message: None,
    };
    archive.append(&record, &space, &metric_names).unwrap();

    let contents = std::fs::read_to_string(&csv_path).unwrap();
    let mut lines = contents.lines();
    let header = lines.next().unwrap();
    assert!(header.contains("opt_level"));
    assert!(header.contains("CPI"));
    let row = lines.next().unwrap();
    assert!(row.contains("-O2") || row.contains("-O3"));
    assert!(lines.next().is_none());
}

/// Scenario: `-flto` guarded on `opt_level: "3+"` must appear active in an
/// assignment only when `-O3` was chosen, across many samples.
#[test]
fn guard_activation_respects_when_clause() {
    let config_json = r#"{
        "backend": "perf",
        "project": {"source": "x.c", "compiler": "cc"},
        "compiler_flags": ["-O1", "-O2", "-O3"],
        "compiler_params": {
            "-flto": {"when": {"opt_level": "3+"}, "values": [true, false]}
        },
        "objectives": [{"metric": "CPI", "goal": "min"}],
        "search": {"sampler": "tpe", "population_size": 10, "random_seed": 42},
        "perf": {"events": ["cycles"], "metrics": ["CPI"], "core_list": [0]},
        "runs": 1,
        "csv_log": "out.csv"
    }"#;
    let study = scout::config::parse_study_definition(config_json).unwrap();
    let space = scout::space::compile(&study).unwrap();
    let mut sampler =
        build_optimizer(study.search.sampler, space.clone(), study.objectives.clone(), &study.search);

    let mut saw_active_flto = false;
    for _ in 0..100 {
        let assignment = sampler.suggest();
        if assignment.is_active("-flto") {
            saw_active_flto = true;
            assert_eq!(
                assignment.active_value("opt_level"),
                Some(&Value::Str("-O3".to_string())),
                "-flto must only be active when opt_level is -O3"
            );
        } else {
            // Guarded-inactive entries still carry a sentinel assignment.
            assert!(assignment.get("-flto").is_some());
        }
    }
    assert!(saw_active_flto, "100 samples never chose -O3; guard was never exercised");
}

/// Scenario: an env-var family where `OMP_PLACES` is only live when
/// `ACPP_VISIBILITY_MASK` is "omp" and `DPCPP_CPU_PLACES` only when "ocl".
#[test]
fn env_conditional_guards_are_mutually_exclusive() {
    let config_json = r#"{
        "backend": "perf",
        "project": {"source": "x.c", "compiler": "cc"},
        "env": {
            "ACPP_VISIBILITY_MASK": ["omp", "ocl"],
            "OMP_PLACES": {"when": {"ACPP_VISIBILITY_MASK": "omp"}, "values": ["cores"]},
            "DPCPP_CPU_PLACES": {"when": {"ACPP_VISIBILITY_MASK": "ocl"}, "values": ["0-7"]}
        },
        "objectives": [{"metric": "CPI", "goal": "min"}],
        "search": {"sampler": "tpe", "population_size": 10, "random_seed": 7},
        "perf": {"events": ["cycles"], "metrics": ["CPI"], "core_list": [0]},
        "runs": 1,
        "csv_log": "out.csv"
    }"#;
    let study = scout::config::parse_study_definition(config_json).unwrap();
    let space = scout::space::compile(&study).unwrap();
    let mut sampler =
        build_optimizer(study.search.sampler, space.clone(), study.objectives.clone(), &study.search);

    let mut saw_omp = false;
    let mut saw_ocl = false;
    for _ in 0..100 {
        let assignment = sampler.suggest();
        let mask = assignment.active_value("ACPP_VISIBILITY_MASK").cloned();
        let omp_places_active = assignment.is_active("OMP_PLACES");
        let dpcpp_places_active = assignment.is_active("DPCPP_CPU_PLACES");

        match mask {
            Some(Value::Str(ref m)) if m == "omp" => {
                saw_omp = true;
                assert!(omp_places_active);
                assert!(!dpcpp_places_active);
            }
            Some(Value::Str(ref m)) if m == "ocl" => {
                saw_ocl = true;
                assert!(!omp_places_active);
                assert!(dpcpp_places_active);
            }
            other => panic!("unexpected ACPP_VISIBILITY_MASK value: {:?}", other),
        }

        let (_, runtime_plan) = scout::materialize::materialize(&space, &assignment, &study).unwrap();
        assert_eq!(omp_places_active, runtime_plan.env.contains_key("OMP_PLACES"));
        assert_eq!(dpcpp_places_active, runtime_plan.env.contains_key("DPCPP_CPU_PLACES"));
    }
    assert!(saw_omp && saw_ocl, "100 samples should exercise both branches of the guard");
}

/// Scenario: an artifact that always fails must surface as a failed run
/// rather than being silently scored, per the "non-zero exit ⇒ run failed"
/// rule the fixed-up `perf`/`likwid` backends now enforce.
#[test]
fn run_failure_resilience() {
    let archive_dir = tempdir().unwrap();
    let csv_path = archive_dir.path().join("archive.csv");
    let config_json = perf_study_json(&csv_path, 5);

    let study = scout::config::parse_study_definition(&config_json).unwrap();
    let space = scout::space::compile(&study).unwrap();

    let mut sampler =
        build_optimizer(study.search.sampler, space.clone(), study.objectives.clone(), &study.search);
    let assignment = sampler.suggest();
    let (build_plan, runtime_plan) = scout::materialize::materialize(&space, &assignment, &study).unwrap();

    let workdir = tempdir().unwrap();
    let build_outcome = scout::build::build(&study, &build_plan, workdir.path(), Duration::from_secs(10));
    assert_eq!(build_outcome.status, BuildStatus::Ok);
    let artifact = build_outcome.artifact.unwrap();

    let backend_config = study.perf.as_ref().unwrap();
    let run_outcome = with_fixture_env(&[("FAKE_EXIT_CODE", "1")], || {
        scout::run::measure(
            study.backend,
            backend_config,
            &artifact,
            &runtime_plan,
            study.runs,
            Duration::from_secs(10),
        )
    });

    assert_eq!(run_outcome.status, RunStatus::Failed);
    assert!(run_outcome.log.contains("exited with status"), "log was: {}", run_outcome.log);

    let record = scout::model::TrialRecord {
        trial_id: 0,
        assignment,
        build_status: build_outcome.status,
        run_status: run_outcome.status,
        raw_samples: run_outcome.samples,
        aggregated: Default::default(),
        objective_vector: Vec::new(),
        wallclock: Duration::from_millis(1),
        error_code: Some("run_failed".to_string()),
        error_message: Some(run_outcome.log.clone()),
    };
    let mut archive = scout::archive::Archive::create(&csv_path, &space, &["CPI".to_string()]).unwrap();
    archive.append(&record, &space, &["CPI".to_string()]).unwrap();

    let contents = std::fs::read_to_string(&csv_path).unwrap();
    let mut reader = csv::ReaderBuilder::new().from_reader(contents.as_bytes());
    let mut rows = reader.records();
    let row = rows.next().unwrap().unwrap();
    assert!(row.iter().any(|field| field == "run_failed"), "row: {:?}", row);
    assert!(row.iter().any(|field| field.contains("exited with status")), "row: {:?}", row);
    assert!(rows.next().is_none());
}

/// Scenario: repetition aggregation over a likwid-backed metric with
/// declared variance. Five known runtime samples should average and spread
/// exactly as `aggregate::aggregate`'s formulas predict.
#[test]
fn repetition_aggregation_averages_and_reports_variance() {
    let config_json = r#"{
        "backend": "likwid",
        "project": {"source": "x.c", "compiler": "cc"},
        "compiler_flags": ["-O2"],
        "objectives": [{"metric": "Runtime (RDTSC) [s]", "goal": "min"}],
        "search": {"sampler": "tpe", "population_size": 10, "random_seed": 3},
        "likwid": {
            "event_groups": ["MEM_DP"],
            "metrics": [{"name": "Runtime (RDTSC) [s]", "agg": "avg", "var": true}],
            "core_list": [0]
        },
        "runs": 5,
        "csv_log": "out.csv"
    }"#;
    let study = scout::config::parse_study_definition(config_json).unwrap();
    let space = scout::space::compile(&study).unwrap();

    let mut sampler =
        build_optimizer(study.search.sampler, space.clone(), study.objectives.clone(), &study.search);
    let assignment = sampler.suggest();
    let (build_plan, runtime_plan) = scout::materialize::materialize(&space, &assignment, &study).unwrap();

    let cc_workdir = tempdir().unwrap();
    let build_outcome = scout::build::build(&study, &build_plan, cc_workdir.path(), Duration::from_secs(10));
    assert_eq!(build_outcome.status, BuildStatus::Ok);
    let artifact = build_outcome.artifact.unwrap();

    let runtimes_dir = tempdir().unwrap();
    let runtime_file = runtimes_dir.path().join("runtimes.txt");
    std::fs::write(&runtime_file, "0.1\n0.2\n0.3\n0.4\n0.5\n").unwrap();

    let backend_config = study.likwid.as_ref().unwrap();
    let run_outcome = with_fixture_env(&[("RUNTIME_FILE", runtime_file.to_str().unwrap())], || {
        scout::run::measure(
            study.backend,
            backend_config,
            &artifact,
            &runtime_plan,
            study.runs,
            Duration::from_secs(10),
        )
    });
    assert_eq!(run_outcome.status, RunStatus::Ok, "run log: {}", run_outcome.log);
    assert_eq!(run_outcome.samples["Runtime (RDTSC) [s]"].len(), 5);

    let aggregated = scout::aggregate::aggregate(backend_config, &run_outcome.samples);
    let mean = aggregated["Runtime (RDTSC) [s]"];
    assert!((mean - 0.3).abs() < 1e-9, "expected mean 0.3, got {}", mean);
    let var = aggregated["Runtime (RDTSC) [s]_var"];
    assert!((var - 0.025).abs() < 1e-9, "expected sample variance 0.025, got {}", var);

    // The archive itself must carry the `_var` column through to a CSV row,
    // not just the in-memory aggregated map.
    let metric_names = vec!["Runtime (RDTSC) [s]".to_string(), "Runtime (RDTSC) [s]_var".to_string()];
    let archive_dir = tempdir().unwrap();
    let csv_path = archive_dir.path().join("archive.csv");
    let mut archive = scout::archive::Archive::create(&csv_path, &space, &metric_names).unwrap();
    let record = scout::model::TrialRecord {
        trial_id: 0,
        assignment,
        build_status: build_outcome.status,
        run_status: run_outcome.status,
        raw_samples: run_outcome.samples,
        aggregated,
        objective_vector: vec![mean],
        wallclock: Duration::from_millis(1),
        error_code: None,
        error_message: None,
    };
    archive.append(&record, &space, &metric_names).unwrap();

    let contents = std::fs::read_to_string(&csv_path).unwrap();
    let mut lines = contents.lines();
    let header: Vec<&str> = lines.next().unwrap().split(',').collect();
    assert!(header.contains(&"Runtime (RDTSC) [s]_var"), "header: {:?}", header);
    let var_col = header.iter().position(|h| *h == "Runtime (RDTSC) [s]_var").unwrap();
    let row: Vec<&str> = lines.next().unwrap().split(',').collect();
    let archived_var: f64 = row[var_col].parse().unwrap();
    assert!((archived_var - 0.025).abs() < 1e-9, "expected archived variance 0.025, got {}", archived_var);
}

/// Scenario: NSGA-III over several objectives should, after enough trials,
/// keep suggesting well-formed assignments and never lose track of which
/// variables are guard-inactive.
#[test]
fn nsga3_multi_objective_loop_stays_well_formed() {
    let config_json = r#"{
        "backend": "perf",
        "project": {"source": "x.c", "compiler": "cc"},
        "compiler_flags": ["-O1", "-O2", "-O3"],
        "compiler_flag_pool": ["-flto", "-fopenmp"],
        "compiler_params": {
            "-march": {"when": {"opt_level": "2+"}, "values": ["znver4", "native"]}
        },
        "objectives": [
            {"metric": "CPI", "goal": "min"},
            {"metric": "instructions", "goal": "min"},
            {"metric": "cycles", "goal": "min"}
        ],
        "search": {"sampler": "nsga3", "population_size": 16, "random_seed": 9},
        "perf": {
            "events": ["cycles", "instructions"],
            "metrics": ["CPI", "instructions", "cycles"],
            "core_list": [0]
        },
        "runs": 1,
        "csv_log": "out.csv"
    }"#;
    let study = scout::config::parse_study_definition(config_json).unwrap();
    let space = scout::space::compile(&study).unwrap();
    let mut sampler =
        build_optimizer(study.search.sampler, space.clone(), study.objectives.clone(), &study.search);

    for trial in 0..64u64 {
        let assignment = sampler.suggest();
        for var in &space.variables {
            assert!(assignment.get(&var.name).is_some(), "missing assignment for {}", var.name);
        }
        if assignment.is_active("-march") {
            let opt_level = assignment.active_value("opt_level");
            assert!(matches!(
                opt_level,
                Some(Value::Str(s)) if s == "-O2" || s == "-O3"
            ));
        }

        // Synthetic objective vector: cheaper-looking when -O3 + -flto chosen.
        let bonus = if assignment.active_value("opt_level") == Some(&Value::Str("-O3".to_string())) {
            0.5
        } else {
            0.0
        };
        let flto_bonus = if assignment.is_active("-flto") { 0.2 } else { 0.0 };
        let cpi = 2.0 - bonus - flto_bonus;
        let objective_vector = vec![cpi, 1_000_000.0 - trial as f64 * 100.0, 2_000_000.0];

        sampler.report(scout::optimizer::Observation {
            assignment,
            objective_vector,
            feasible: true,
        });
    }
}

/// A directly-constructed assignment round-trips through guard evaluation:
/// inactive decision variables stay absent from both the build plan and
/// runtime env even when materialized outside the sampler loop.
#[test]
fn materialize_omits_guard_inactive_variables_end_to_end() {
    let config_json = r#"{
        "backend": "perf",
        "project": {"source": "x.c", "compiler": "cc"},
        "compiler_flags": ["-O1", "-O2", "-O3"],
        "compiler_params": {
            "-flto": {"when": {"opt_level": "3+"}, "values": [true, false]}
        },
        "objectives": [{"metric": "CPI", "goal": "min"}],
        "search": {"sampler": "tpe", "population_size": 10, "random_seed": 1},
        "perf": {"events": ["cycles"], "metrics": ["CPI"], "core_list": [0]},
        "runs": 1,
        "csv_log": "out.csv"
    }"#;
    let study = scout::config::parse_study_definition(config_json).unwrap();
    let space = scout::space::compile(&study).unwrap();

    let mut assignment = Assignment::new();
    assignment.insert("opt_level", AssignedValue::Active(Value::Str("-O2".into())));
    assignment.insert("-flto", AssignedValue::Inactive);

    let (build_plan, _) = scout::materialize::materialize(&space, &assignment, &study).unwrap();
    assert_eq!(build_plan.trial_flags, vec!["-O2".to_string()]);
}
