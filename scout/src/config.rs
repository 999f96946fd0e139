//! Config Loader: parses the declarative JSON configuration into an
//! in-memory `StudyDefinition`.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::Deserialize;
use serde_json::Value as Json;

use crate::error::ScoutError;
use crate::model::{Agg, Backend, Goal, Objective, Project, Value};

/// A `compiler_params`/`env` entry: either a plain list of values, or a
/// guarded block `{when, values}`.
#[derive(Debug, Clone)]
pub enum ParamEntry {
    Plain(Vec<Value>),
    Guarded { when_var: String, when_value: String, values: Vec<Value> },
}

#[derive(Debug, Clone)]
pub struct MetricSpec {
    pub name: String,
    pub agg: Agg,
    pub var: bool,
}

#[derive(Debug, Clone, Default)]
pub struct BackendConfig {
    pub event_groups: Vec<String>,
    pub events: Vec<String>,
    pub metrics: Vec<MetricSpec>,
    pub core_list: Vec<u32>,
}

#[derive(Debug, Clone)]
pub struct SearchConfig {
    pub sampler: Sampler,
    pub population_size: usize,
    pub random_seed: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sampler {
    Tpe,
    Nsga3,
    Rf,
}

/// The immutable Study Definition.
#[derive(Debug, Clone)]
pub struct StudyDefinition {
    pub backend: Backend,
    pub project: Project,
    pub program_args: Vec<String>,
    pub compiler_flags: Vec<String>,
    pub compiler_flag_pool: Vec<String>,
    pub compiler_params: BTreeMap<String, ParamEntry>,
    pub env: BTreeMap<String, ParamEntry>,
    pub objectives: Vec<Objective>,
    pub search: SearchConfig,
    pub likwid: Option<BackendConfig>,
    pub perf: Option<BackendConfig>,
    pub runs: usize,
    pub csv_log: PathBuf,
}

const KNOWN_TOP_LEVEL_KEYS: &[&str] = &[
    "backend",
    "project",
    "program_args",
    "compiler_flags",
    "compiler_flag_pool",
    "compiler_params",
    "env",
    "objectives",
    "search",
    "likwid",
    "perf",
    "runs",
    "csv_log",
];

pub fn load_study_definition(path: &std::path::Path) -> Result<StudyDefinition, ScoutError> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| ScoutError::Config(format!("reading {:?}: {}", path, e)))?;
    parse_study_definition(&text)
}

pub fn parse_study_definition(text: &str) -> Result<StudyDefinition, ScoutError> {
    let raw: Json = serde_json::from_str(text)
        .map_err(|e| ScoutError::Config(format!("invalid JSON: {}", e)))?;
    let obj = raw
        .as_object()
        .ok_or_else(|| ScoutError::Config("top level must be a JSON object".into()))?;

    for key in obj.keys() {
        if !KNOWN_TOP_LEVEL_KEYS.contains(&key.as_str()) {
            log::warn!("ignoring unknown top-level config key '{}'", key);
        }
    }

    let backend = match get_str(obj, "backend")?.as_str() {
        "likwid" => Backend::Likwid,
        "perf" => Backend::Perf,
        other => return Err(ScoutError::Config(format!("unknown backend '{}'", other))),
    };

    let project = parse_project(obj)?;

    let program_args = obj
        .get("program_args")
        .map(parse_string_list)
        .transpose()?
        .unwrap_or_default();

    let compiler_flags = obj
        .get("compiler_flags")
        .map(parse_string_list)
        .transpose()?
        .unwrap_or_default();

    let compiler_flag_pool = obj
        .get("compiler_flag_pool")
        .map(parse_string_list)
        .transpose()?
        .unwrap_or_default();

    let compiler_params = obj
        .get("compiler_params")
        .map(|v| parse_param_map(v, "compiler_params"))
        .transpose()?
        .unwrap_or_default();

    let env = obj
        .get("env")
        .map(|v| parse_param_map(v, "env"))
        .transpose()?
        .unwrap_or_default();

    let objectives = parse_objectives(obj)?;
    let search = parse_search(obj)?;

    let likwid = obj.get("likwid").map(parse_backend_config).transpose()?;
    let perf = obj.get("perf").map(parse_backend_config).transpose()?;

    match backend {
        Backend::Likwid if likwid.is_none() => {
            return Err(ScoutError::Config("backend=likwid requires a 'likwid' section".into()));
        }
        Backend::Perf if perf.is_none() => {
            return Err(ScoutError::Config("backend=perf requires a 'perf' section".into()));
        }
        _ => {}
    }

    let runs = obj
        .get("runs")
        .and_then(|v| v.as_u64())
        .unwrap_or(1) as usize;
    if runs < 1 {
        return Err(ScoutError::Config("'runs' must be >= 1".into()));
    }

    let csv_log = PathBuf::from(get_str(obj, "csv_log")?);

    if search.population_size < 1 {
        return Err(ScoutError::Config("search.population_size must be >= 1".into()));
    }

    let study = StudyDefinition {
        backend,
        project,
        program_args,
        compiler_flags,
        compiler_flag_pool,
        compiler_params,
        env,
        objectives,
        search,
        likwid,
        perf,
        runs,
        csv_log,
    };

    validate_objectives(&study)?;

    Ok(study)
}

fn validate_objectives(study: &StudyDefinition) -> Result<(), ScoutError> {
    let known: Vec<&str> = match study.backend {
        Backend::Likwid => study
            .likwid
            .as_ref()
            .map(|b| b.metrics.iter().map(|m| m.name.as_str()).collect())
            .unwrap_or_default(),
        Backend::Perf => study
            .perf
            .as_ref()
            .map(|b| b.metrics.iter().map(|m| m.name.as_str()).collect())
            .unwrap_or_default(),
    };
    for objective in &study.objectives {
        if !known.contains(&objective.metric.as_str()) {
            return Err(ScoutError::Config(format!(
                "objective metric '{}' not produced by backend's declared metric set",
                objective.metric
            )));
        }
    }
    if study.objectives.is_empty() {
        return Err(ScoutError::Config("'objectives' must declare at least one metric".into()));
    }
    Ok(())
}

fn get_str(obj: &serde_json::Map<String, Json>, key: &str) -> Result<String, ScoutError> {
    obj.get(key)
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .ok_or_else(|| ScoutError::Config(format!("missing or non-string key '{}'", key)))
}

fn parse_string_list(v: &Json) -> Result<Vec<String>, ScoutError> {
    v.as_array()
        .ok_or_else(|| ScoutError::Config("expected a JSON array of strings".into()))?
        .iter()
        .map(|x| {
            x.as_str()
                .map(str::to_string)
                .ok_or_else(|| ScoutError::Config("expected a string in array".into()))
        })
        .collect()
}

fn json_to_value(v: &Json) -> Result<Value, ScoutError> {
    match v {
        Json::String(s) => Ok(Value::Str(s.clone())),
        Json::Number(n) => Ok(Value::Num(n.as_f64().unwrap_or(0.0))),
        Json::Bool(b) => Ok(Value::Bool(*b)),
        other => Err(ScoutError::Config(format!("unsupported value type: {}", other))),
    }
}

fn parse_project(obj: &serde_json::Map<String, Json>) -> Result<Project, ScoutError> {
    let p = obj
        .get("project")
        .and_then(|v| v.as_object())
        .ok_or_else(|| ScoutError::Config("missing 'project' object".into()))?;

    if let Some(source) = p.get("source").and_then(|v| v.as_str()) {
        let compiler = p
            .get("compiler")
            .and_then(|v| v.as_str())
            .ok_or_else(|| ScoutError::Config("single-source project requires 'compiler'".into()))?
            .to_string();
        let compiler_flags_base = p
            .get("compiler_flags_base")
            .map(parse_string_list)
            .transpose()?
            .unwrap_or_default();
        let output_basename = p
            .get("output_basename")
            .and_then(|v| v.as_str())
            .unwrap_or("a.out")
            .to_string();
        return Ok(Project::SingleSource {
            source: PathBuf::from(source),
            compiler,
            compiler_flags_base,
            output_basename,
        });
    }

    let dir = p
        .get("dir")
        .and_then(|v| v.as_str())
        .ok_or_else(|| ScoutError::Config("project mode requires 'dir' or 'source'".into()))?;
    let build_system = p
        .get("build_system")
        .and_then(|v| v.as_str())
        .ok_or_else(|| ScoutError::Config("project mode requires 'build_system'".into()))?;
    let target = p.get("target").and_then(|v| v.as_str()).map(str::to_string);

    match build_system {
        "make" => {
            let make_vars = parse_string_map(p.get("make_vars"))?;
            Ok(Project::Make { dir: PathBuf::from(dir), target, make_vars })
        }
        "cmake" => {
            let cmake_defs = parse_string_map(p.get("cmake_defs"))?;
            Ok(Project::CMake { dir: PathBuf::from(dir), target, cmake_defs })
        }
        other => Err(ScoutError::Config(format!("unknown build_system '{}'", other))),
    }
}

fn parse_string_map(v: Option<&Json>) -> Result<BTreeMap<String, String>, ScoutError> {
    let mut out = BTreeMap::new();
    if let Some(v) = v {
        let obj = v
            .as_object()
            .ok_or_else(|| ScoutError::Config("expected a JSON object of string values".into()))?;
        for (k, val) in obj {
            let s = val
                .as_str()
                .ok_or_else(|| ScoutError::Config(format!("value for '{}' must be a string", k)))?;
            out.insert(k.clone(), s.to_string());
        }
    }
    Ok(out)
}

fn parse_param_map(v: &Json, ctx: &str) -> Result<BTreeMap<String, ParamEntry>, ScoutError> {
    let obj = v
        .as_object()
        .ok_or_else(|| ScoutError::Config(format!("'{}' must be a JSON object", ctx)))?;
    let mut out = BTreeMap::new();
    for (name, entry) in obj {
        out.insert(name.clone(), parse_param_entry(entry, name)?);
    }
    Ok(out)
}

fn parse_param_entry(v: &Json, name: &str) -> Result<ParamEntry, ScoutError> {
    if let Some(arr) = v.as_array() {
        let values = arr.iter().map(json_to_value).collect::<Result<Vec<_>, _>>()?;
        return Ok(ParamEntry::Plain(values));
    }
    let obj = v
        .as_object()
        .ok_or_else(|| ScoutError::Config(format!("entry '{}' must be a list or guarded block", name)))?;
    let when = obj
        .get("when")
        .and_then(|v| v.as_object())
        .ok_or_else(|| ScoutError::Config(format!("guarded entry '{}' missing 'when'", name)))?;
    if when.len() != 1 {
        return Err(ScoutError::Config(format!(
            "guard on '{}' must name exactly one variable",
            name
        )));
    }
    let (when_var, when_value_json) = when.iter().next().unwrap();
    let when_value = when_value_json
        .as_str()
        .ok_or_else(|| ScoutError::Config(format!("guard value for '{}' must be a string", name)))?
        .to_string();
    let values = obj
        .get("values")
        .and_then(|v| v.as_array())
        .ok_or_else(|| ScoutError::Config(format!("guarded entry '{}' missing 'values'", name)))?
        .iter()
        .map(json_to_value)
        .collect::<Result<Vec<_>, _>>()?;
    Ok(ParamEntry::Guarded { when_var: when_var.clone(), when_value, values })
}

fn parse_objectives(obj: &serde_json::Map<String, Json>) -> Result<Vec<Objective>, ScoutError> {
    let arr = obj
        .get("objectives")
        .and_then(|v| v.as_array())
        .ok_or_else(|| ScoutError::Config("missing 'objectives' array".into()))?;
    #[derive(Deserialize)]
    struct RawObjective {
        metric: String,
        goal: Goal,
    }
    arr.iter()
        .map(|v| {
            let raw: RawObjective = serde_json::from_value(v.clone())
                .map_err(|e| ScoutError::Config(format!("invalid objective entry: {}", e)))?;
            Ok(Objective { metric: raw.metric, goal: raw.goal })
        })
        .collect()
}

fn parse_search(obj: &serde_json::Map<String, Json>) -> Result<SearchConfig, ScoutError> {
    let s = obj
        .get("search")
        .and_then(|v| v.as_object())
        .ok_or_else(|| ScoutError::Config("missing 'search' object".into()))?;
    let sampler = match s.get("sampler").and_then(|v| v.as_str()).unwrap_or("tpe") {
        "tpe" => Sampler::Tpe,
        "nsga3" => Sampler::Nsga3,
        "rf" => Sampler::Rf,
        other => return Err(ScoutError::Config(format!("unknown sampler '{}'", other))),
    };
    let population_size = s
        .get("population_size")
        .and_then(|v| v.as_u64())
        .unwrap_or(20) as usize;
    let random_seed = s.get("random_seed").and_then(|v| v.as_u64()).unwrap_or(0);
    Ok(SearchConfig { sampler, population_size, random_seed })
}

fn parse_backend_config(v: &Json) -> Result<BackendConfig, ScoutError> {
    let obj = v
        .as_object()
        .ok_or_else(|| ScoutError::Config("backend section must be a JSON object".into()))?;
    let event_groups = obj
        .get("event_groups")
        .map(parse_string_list)
        .transpose()?
        .unwrap_or_default();
    let events = obj
        .get("events")
        .map(parse_string_list)
        .transpose()?
        .unwrap_or_default();
    let core_list = obj
        .get("core_list")
        .and_then(|v| v.as_array())
        .map(|arr| {
            arr.iter()
                .filter_map(|v| v.as_u64())
                .map(|v| v as u32)
                .collect()
        })
        .unwrap_or_default();

    let metrics = obj
        .get("metrics")
        .and_then(|v| v.as_array())
        .map(|arr| {
            arr.iter()
                .map(parse_metric_spec)
                .collect::<Result<Vec<_>, _>>()
        })
        .transpose()?
        .unwrap_or_default();

    Ok(BackendConfig { event_groups, events, metrics, core_list })
}

fn parse_metric_spec(v: &Json) -> Result<MetricSpec, ScoutError> {
    if let Some(name) = v.as_str() {
        return Ok(MetricSpec { name: name.to_string(), agg: Agg::Avg, var: false });
    }
    let obj = v
        .as_object()
        .ok_or_else(|| ScoutError::Config("metric entry must be a string or object".into()))?;
    let name = obj
        .get("name")
        .and_then(|v| v.as_str())
        .ok_or_else(|| ScoutError::Config("metric entry missing 'name'".into()))?
        .to_string();
    let agg = match obj.get("agg").and_then(|v| v.as_str()).unwrap_or("avg") {
        "avg" => Agg::Avg,
        "median" => Agg::Median,
        "min" => Agg::Min,
        "max" => Agg::Max,
        other => return Err(ScoutError::Config(format!("unknown aggregation '{}'", other))),
    };
    let var = obj.get("var").and_then(|v| v.as_bool()).unwrap_or(false);
    Ok(MetricSpec { name, agg, var })
}
