//! Core data model shared by every stage of the pipeline (config loader
//! through archive).

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// A concrete value a decision variable can take on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Str(String),
    Num(f64),
    Bool(bool),
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Str(s) => f.write_str(s),
            Value::Num(n) => write!(f, "{}", n),
            Value::Bool(b) => write!(f, "{}", b),
        }
    }
}

/// The sentinel rendered into the archive and carried in an `Assignment`
/// for a variable whose guard evaluated to false.
pub const INACTIVE_SENTINEL: &str = "";

#[derive(Debug, Clone, PartialEq)]
pub enum AssignedValue {
    Active(Value),
    Inactive,
}

impl AssignedValue {
    pub fn is_active(&self) -> bool {
        matches!(self, AssignedValue::Active(_))
    }

    pub fn as_active(&self) -> Option<&Value> {
        match self {
            AssignedValue::Active(v) => Some(v),
            AssignedValue::Inactive => None,
        }
    }

    /// The string this value renders as in an archive row.
    pub fn archive_field(&self) -> String {
        match self {
            AssignedValue::Active(v) => v.to_string(),
            AssignedValue::Inactive => INACTIVE_SENTINEL.to_string(),
        }
    }
}

/// A total choice of values for all decision variables declared by a
/// `SearchSpace`, guarded ones included (inactive ones carry the sentinel).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Assignment(pub BTreeMap<String, AssignedValue>);

impl Assignment {
    pub fn new() -> Self {
        Assignment(BTreeMap::new())
    }

    pub fn get(&self, name: &str) -> Option<&AssignedValue> {
        self.0.get(name)
    }

    pub fn active_value(&self, name: &str) -> Option<&Value> {
        self.0.get(name).and_then(|v| v.as_active())
    }

    pub fn is_active(&self, name: &str) -> bool {
        matches!(self.0.get(name), Some(AssignedValue::Active(_)))
    }

    pub fn insert(&mut self, name: impl Into<String>, value: AssignedValue) {
        self.0.insert(name.into(), value);
    }
}

/// The kind of knob a decision variable represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecisionKind {
    /// One of `compiler_flags`: exactly one value chosen per trial.
    Choice,
    /// A key of `compiler_params`.
    Param,
    /// An entry of `compiler_flag_pool`: independently toggled on/off.
    Toggle,
    /// A key of `env`.
    Env,
}

/// A guard predicate, evaluated against previously-assigned variables.
#[derive(Debug, Clone, PartialEq)]
pub enum Guard {
    /// `{var: value}` — true when `var`'s current assignment equals `value`.
    Equals { var: String, value: Value },
    /// `{var: "N+"}` — true when the numeric tail of `var`'s chosen value
    /// is >= N (see `guard::numeric_suffix`).
    AtLeast { var: String, threshold: u32 },
}

impl Guard {
    pub fn depends_on(&self) -> &str {
        match self {
            Guard::Equals { var, .. } => var,
            Guard::AtLeast { var, .. } => var,
        }
    }
}

/// A single decision variable: a named, finite-domain dimension of the
/// search space with an optional guard.
#[derive(Debug, Clone)]
pub struct DecisionVariable {
    pub name: String,
    pub kind: DecisionKind,
    pub domain: Vec<Value>,
    pub guard: Option<Guard>,
}

impl DecisionVariable {
    pub fn is_guarded(&self) -> bool {
        self.guard.is_some()
    }
}

/// The compiled, read-only search space: decision variables in declaration
/// order (opt-level, then pool toggles, then params, then env — see
/// the Candidate Materializer), with an acyclic guard DAG already verified by
/// the Space Compiler.
#[derive(Debug, Clone)]
pub struct SearchSpace {
    pub variables: Vec<DecisionVariable>,
}

impl SearchSpace {
    pub fn get(&self, name: &str) -> Option<&DecisionVariable> {
        self.variables.iter().find(|v| v.name == name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Goal {
    Min,
    Max,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Objective {
    pub metric: String,
    pub goal: Goal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Agg {
    Avg,
    Median,
    Min,
    Max,
}

impl Default for Agg {
    fn default() -> Self {
        Agg::Avg
    }
}

/// Build-system-specific project description.
#[derive(Debug, Clone)]
pub enum Project {
    SingleSource {
        source: PathBuf,
        compiler: String,
        compiler_flags_base: Vec<String>,
        output_basename: String,
    },
    Make {
        dir: PathBuf,
        target: Option<String>,
        make_vars: BTreeMap<String, String>,
    },
    CMake {
        dir: PathBuf,
        target: Option<String>,
        cmake_defs: BTreeMap<String, String>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    Likwid,
    Perf,
}

/// What the Candidate Materializer produces from an `Assignment`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BuildPlan {
    /// Ordered trial compiler flags (opt-level, pool, params), folded into
    /// `EXTRA_CFLAGS` (Make) or `CMAKE_CXX_FLAGS` (CMake) by the Builder.
    pub trial_flags: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RuntimePlan {
    pub env: BTreeMap<String, String>,
    pub program_args: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BuildStatus {
    Ok,
    Failed,
    Timeout,
    MaterializationError,
}

impl fmt::Display for BuildStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BuildStatus::Ok => "ok",
            BuildStatus::Failed => "failed",
            BuildStatus::Timeout => "build_timeout",
            BuildStatus::MaterializationError => "materialization_error",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunStatus {
    Ok,
    NotRun,
    Failed,
    Timeout,
    MetricMissing,
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunStatus::Ok => "ok",
            RunStatus::NotRun => "not_run",
            RunStatus::Failed => "run_failed",
            RunStatus::Timeout => "run_timeout",
            RunStatus::MetricMissing => "metric_missing",
        };
        f.write_str(s)
    }
}

/// One full build+run+measure cycle for a single `Assignment`.
#[derive(Debug, Clone)]
pub struct TrialRecord {
    pub trial_id: u64,
    pub assignment: Assignment,
    pub build_status: BuildStatus,
    pub run_status: RunStatus,
    pub raw_samples: BTreeMap<String, Vec<f64>>,
    pub aggregated: BTreeMap<String, f64>,
    pub objective_vector: Vec<f64>,
    pub wallclock: Duration,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
}

impl TrialRecord {
    pub fn is_feasible(&self) -> bool {
        self.build_status == BuildStatus::Ok && self.run_status == RunStatus::Ok
    }
}
