//! Candidate Materializer: turns a sampled `Assignment` into a `BuildPlan`
//! and `RuntimePlan`.

use crate::error::ScoutError;
use crate::model::{Assignment, BuildPlan, DecisionKind, RuntimePlan, SearchSpace, Value};
use crate::config::StudyDefinition;

/// Renders one active param/toggle as a command-line token: boolean values
/// expand to the flag name itself (or nothing); single-dash keys use
/// `key=value`; anything else is space-joined.
fn render_param_token(name: &str, value: &Value) -> Option<String> {
    match value {
        Value::Bool(true) => Some(name.to_string()),
        Value::Bool(false) => None,
        Value::Str(s) => Some(render_key_value(name, s)),
        Value::Num(n) => Some(render_key_value(name, &n.to_string())),
    }
}

fn render_key_value(name: &str, value: &str) -> String {
    let is_single_dash = name.starts_with('-') && !name.starts_with("--");
    if is_single_dash {
        format!("{}={}", name, value)
    } else {
        format!("{} {}", name, value)
    }
}

pub fn materialize(
    space: &SearchSpace,
    assignment: &Assignment,
    study: &StudyDefinition,
) -> Result<(BuildPlan, RuntimePlan), ScoutError> {
    let mut trial_flags = Vec::new();
    let mut env = std::collections::BTreeMap::new();

    for var in space.variables.iter().filter(|v| v.kind == DecisionKind::Choice) {
        if let Some(value) = assignment.active_value(&var.name) {
            trial_flags.push(value.to_string());
        }
    }

    for var in space.variables.iter().filter(|v| v.kind == DecisionKind::Toggle) {
        if let Some(Value::Bool(true)) = assignment.active_value(&var.name) {
            trial_flags.push(var.name.clone());
        }
    }

    for var in space.variables.iter().filter(|v| v.kind == DecisionKind::Param) {
        if let Some(value) = assignment.active_value(&var.name) {
            if let Some(token) = render_param_token(&var.name, value) {
                trial_flags.push(token);
            }
        }
    }

    for var in space.variables.iter().filter(|v| v.kind == DecisionKind::Env) {
        if let Some(value) = assignment.active_value(&var.name) {
            env.insert(var.name.clone(), value.to_string());
        }
    }

    if space.variables.is_empty() {
        return Err(ScoutError::Materialization("search space has no decision variables".into()));
    }

    let build_plan = BuildPlan { trial_flags };
    let runtime_plan = RuntimePlan { env, program_args: study.program_args.clone() };

    Ok((build_plan, runtime_plan))
}
