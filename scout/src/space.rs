//! Space Compiler: turns a `StudyDefinition` into a `SearchSpace`.

use std::collections::{BTreeMap, HashSet, VecDeque};

use crate::config::{ParamEntry, StudyDefinition};
use crate::error::ScoutError;
use crate::guard::parse_threshold;
use crate::model::{DecisionKind, DecisionVariable, Guard, SearchSpace, Value};

const OPT_LEVEL_NAME: &str = "opt_level";

struct RawVar {
    var: DecisionVariable,
}

pub fn compile(study: &StudyDefinition) -> Result<SearchSpace, ScoutError> {
    let mut raw: Vec<RawVar> = Vec::new();
    let mut seen_names: HashSet<String> = HashSet::new();

    if !study.compiler_flags.is_empty() {
        push_unique(
            &mut raw,
            &mut seen_names,
            DecisionVariable {
                name: OPT_LEVEL_NAME.to_string(),
                kind: DecisionKind::Choice,
                domain: study.compiler_flags.iter().cloned().map(Value::Str).collect(),
                guard: None,
            },
        )?;
    }

    for flag in &study.compiler_flag_pool {
        push_unique(
            &mut raw,
            &mut seen_names,
            DecisionVariable {
                name: flag.clone(),
                kind: DecisionKind::Toggle,
                domain: vec![Value::Bool(true), Value::Bool(false)],
                guard: None,
            },
        )?;
    }

    for (name, entry) in &study.compiler_params {
        let (domain, guard) = domain_and_guard(entry)?;
        push_unique(
            &mut raw,
            &mut seen_names,
            DecisionVariable { name: name.clone(), kind: DecisionKind::Param, domain, guard },
        )?;
    }

    for (name, entry) in &study.env {
        let (domain, guard) = domain_and_guard(entry)?;
        push_unique(
            &mut raw,
            &mut seen_names,
            DecisionVariable { name: name.clone(), kind: DecisionKind::Env, domain, guard },
        )?;
    }

    for rv in &raw {
        if rv.var.domain.is_empty() {
            return Err(ScoutError::Config(format!(
                "decision variable '{}' has an empty domain",
                rv.var.name
            )));
        }
    }

    let ordered = topological_order(raw)?;

    Ok(SearchSpace { variables: ordered })
}

fn push_unique(
    raw: &mut Vec<RawVar>,
    seen: &mut HashSet<String>,
    var: DecisionVariable,
) -> Result<(), ScoutError> {
    if !seen.insert(var.name.clone()) {
        return Err(ScoutError::Config(format!(
            "duplicate decision variable name '{}' (declared in two different decision kinds)",
            var.name
        )));
    }
    raw.push(RawVar { var });
    Ok(())
}

fn domain_and_guard(entry: &ParamEntry) -> Result<(Vec<Value>, Option<Guard>), ScoutError> {
    match entry {
        ParamEntry::Plain(values) => Ok((values.clone(), None)),
        ParamEntry::Guarded { when_var, when_value, values } => {
            let guard = if when_value.ends_with('+') {
                Guard::AtLeast { var: when_var.clone(), threshold: parse_threshold(when_value)? }
            } else {
                Guard::Equals { var: when_var.clone(), value: Value::Str(when_value.clone()) }
            };
            Ok((values.clone(), Some(guard)))
        }
    }
}

/// Kahn's algorithm over the guard dependency graph. The raw declaration
/// order (opt-level, pool, params, env) is used as a stable tie-break so
/// that two configs with the same guard structure compile to the same
/// variable order.
fn topological_order(raw: Vec<RawVar>) -> Result<Vec<DecisionVariable>, ScoutError> {
    let names: Vec<String> = raw.iter().map(|r| r.var.name.clone()).collect();
    let index_of: BTreeMap<&str, usize> =
        names.iter().enumerate().map(|(i, n)| (n.as_str(), i)).collect();

    let mut indegree = vec![0usize; raw.len()];
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); raw.len()];

    for (i, rv) in raw.iter().enumerate() {
        if let Some(guard) = &rv.var.guard {
            let dep_name = guard.depends_on();
            let dep_idx = *index_of.get(dep_name).ok_or_else(|| {
                ScoutError::Config(format!(
                    "guard on '{}' references unknown variable '{}'",
                    rv.var.name, dep_name
                ))
            })?;
            indegree[i] += 1;
            dependents[dep_idx].push(i);
        }
    }

    let mut queue: VecDeque<usize> =
        (0..raw.len()).filter(|&i| indegree[i] == 0).collect();
    let mut order = Vec::with_capacity(raw.len());
    let mut visited = vec![false; raw.len()];

    while let Some(i) = queue.pop_front() {
        if visited[i] {
            continue;
        }
        visited[i] = true;
        order.push(i);
        for &dep in &dependents[i] {
            indegree[dep] -= 1;
            if indegree[dep] == 0 {
                queue.push_back(dep);
            }
        }
    }

    if order.len() != raw.len() {
        let stuck: Vec<&str> = (0..raw.len())
            .filter(|i| !visited[*i])
            .map(|i| names[i].as_str())
            .collect();
        return Err(ScoutError::Config(format!(
            "cyclic guard dependency among variables: {}",
            stuck.join(", ")
        )));
    }

    let mut raw = raw.into_iter().map(Some).collect::<Vec<_>>();
    Ok(order.into_iter().map(|i| raw[i].take().unwrap().var).collect())
}
