use std::path::Path;
use std::process::Command;
use std::time::Duration;

use regex::Regex;

use crate::config::BackendConfig;
use crate::model::RuntimePlan;
use crate::process::{run_with_timeout, RunOutcome as ProcOutcome};

use super::{core_list_arg, RepetitionError};

/// Runs the artifact once under `likwid-perfctr`, collecting one sample per
/// declared metric from its "Metric,Core N,..." CSV-ish table.
pub(crate) fn measure_once(
    config: &BackendConfig,
    artifact: &Path,
    plan: &RuntimePlan,
    timeout: Duration,
) -> Result<Vec<(String, f64)>, RepetitionError> {
    let likwid = which::which("likwid-perfctr")
        .map_err(|_| RepetitionError::Failed("'likwid-perfctr' not found on PATH".into()))?;

    let cores = core_list_arg(&config.core_list)
        .ok_or_else(|| RepetitionError::Failed("likwid backend requires a non-empty core_list".into()))?;

    let mut cmd = Command::new(likwid);
    cmd.arg("-C").arg(&cores);
    if let Some(group) = config.event_groups.first() {
        cmd.arg("-g").arg(group);
    } else if !config.events.is_empty() {
        cmd.arg("-g").arg(config.events.join(","));
    } else {
        return Err(RepetitionError::Failed(
            "likwid backend requires at least one event_group or event".into(),
        ));
    }
    cmd.arg("-m");
    cmd.arg(artifact);
    cmd.args(&plan.program_args);
    for (k, v) in &plan.env {
        cmd.env(k, v);
    }

    let outcome = run_with_timeout(&mut cmd, timeout)
        .map_err(|e| RepetitionError::Failed(format!("failed to spawn likwid-perfctr: {}", e)))?;

    match outcome {
        ProcOutcome::TimedOut { .. } => Err(RepetitionError::Timeout),
        ProcOutcome::Completed { output, .. } => {
            // `likwid-perfctr -m ... artifact` exits with the wrapped
            // artifact's own exit code, so non-zero status here is a run
            // failure, not a likwid failure.
            if !output.status.success() {
                return Err(RepetitionError::Failed(format!(
                    "artifact exited with status {}: {}",
                    output.status,
                    String::from_utf8_lossy(&output.stderr)
                )));
            }
            let text = String::from_utf8_lossy(&output.stdout).into_owned();
            let table = parse_metric_table(&text)?;
            let metrics: Vec<(String, f64)> = config
                .metrics
                .iter()
                .filter_map(|m| table.iter().find(|(name, _)| name == &m.name).cloned())
                .collect();
            if metrics.is_empty() {
                return Err(RepetitionError::MetricMissing(
                    "no declared metric found in likwid-perfctr output".into(),
                ));
            }
            Ok(metrics)
        }
    }
}

/// LIKWID's `-m` marker-API output includes a `TABLE,Metric,...` block
/// followed by CSV rows `Name,value[,value...]`; we take the first value
/// column (core 0 / aggregate) for each declared metric row.
fn parse_metric_table(text: &str) -> Result<Vec<(String, f64)>, RepetitionError> {
    let row = Regex::new(r"^([A-Za-z0-9_ ()\[\]/%]+),([-+0-9.eE]+)").unwrap();
    let mut out = Vec::new();
    for line in text.lines() {
        if let Some(caps) = row.captures(line.trim()) {
            let name = caps[1].trim().to_string();
            if let Ok(value) = caps[2].parse::<f64>() {
                out.push((name, value));
            }
        }
    }
    if out.is_empty() {
        return Err(RepetitionError::Failed(
            "likwid-perfctr produced no parseable metric rows".into(),
        ));
    }
    Ok(out)
}
