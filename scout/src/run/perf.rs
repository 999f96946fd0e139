use std::path::Path;
use std::process::Command;
use std::time::Duration;

use log::warn;

use crate::config::BackendConfig;
use crate::model::RuntimePlan;
use crate::process::{run_with_timeout, RunOutcome as ProcOutcome};

use super::{core_list_arg, RepetitionError};

/// Runs the artifact once under `perf stat -x,`, collecting one sample per
/// declared event. Field layout follows `perf
/// stat`'s machine-readable CSV mode: `count,unit,name,time,percentage`.
pub(crate) fn measure_once(
    config: &BackendConfig,
    artifact: &Path,
    plan: &RuntimePlan,
    timeout: Duration,
) -> Result<Vec<(String, f64)>, RepetitionError> {
    let perf = which::which("perf")
        .map_err(|_| RepetitionError::Failed("'perf' not found on PATH".into()))?;

    let mut cmd = Command::new(perf);
    cmd.arg("stat").arg("-x,");

    if !config.events.is_empty() {
        cmd.arg("-e").arg(config.events.join(","));
    }
    for group in &config.event_groups {
        cmd.arg("-e").arg(group);
    }
    if let Some(cores) = core_list_arg(&config.core_list) {
        cmd.arg("--cpu").arg(cores);
    }
    cmd.arg("--");
    cmd.arg(artifact);
    cmd.args(&plan.program_args);
    for (k, v) in &plan.env {
        cmd.env(k, v);
    }

    let outcome = run_with_timeout(&mut cmd, timeout)
        .map_err(|e| RepetitionError::Failed(format!("failed to spawn perf: {}", e)))?;

    match outcome {
        ProcOutcome::TimedOut { .. } => Err(RepetitionError::Timeout),
        ProcOutcome::Completed { output, .. } => {
            // `perf stat -- artifact` exits with the wrapped artifact's own
            // exit code, so a non-zero status here is the artifact failing.
            if !output.status.success() {
                return Err(RepetitionError::Failed(format!(
                    "artifact exited with status {}: {}",
                    output.status,
                    String::from_utf8_lossy(&output.stderr)
                )));
            }
            // `perf stat` writes its report to stderr regardless of `-x`.
            let text = String::from_utf8_lossy(&output.stderr).into_owned();
            let counts = parse_stat_output(&text)?;
            let mut metrics = resolve_metrics(config, &counts);
            derive_cpi(config, &counts, &mut metrics);
            if metrics.is_empty() {
                return Err(RepetitionError::MetricMissing(
                    "no declared metric found in perf output".into(),
                ));
            }
            Ok(metrics)
        }
    }
}

fn parse_stat_output(text: &str) -> Result<Vec<(String, f64)>, RepetitionError> {
    let mut counts = Vec::new();
    for line in text.lines() {
        macro_rules! get {
            ($e:expr) => {
                match $e {
                    Some(s) => s,
                    None => {
                        warn!("unhandled perf stat line: {}", line);
                        continue;
                    }
                }
            };
        }
        let mut parts = line.split(',').map(str::trim);
        let cnt = get!(parts.next());
        let _unit = get!(parts.next());
        let name = get!(parts.next());
        if cnt.is_empty() || cnt == "<not supported>" || cnt == "<not counted>" {
            continue;
        }
        let value: f64 = cnt
            .parse()
            .map_err(|_| RepetitionError::Failed(format!("could not parse `{}` as a float", cnt)))?;
        counts.push((name.to_string(), value));
    }
    if counts.is_empty() {
        return Err(RepetitionError::Failed(
            "perf produced no parseable stat lines".into(),
        ));
    }
    Ok(counts)
}

fn resolve_metrics(config: &BackendConfig, counts: &[(String, f64)]) -> Vec<(String, f64)> {
    let mut out = Vec::new();
    for metric in &config.metrics {
        if metric.name == "CPI" {
            continue; // derived separately below
        }
        if let Some((_, value)) = counts.iter().find(|(name, _)| name == &metric.name) {
            out.push((metric.name.clone(), *value));
        }
    }
    out
}

/// `CPI := cycles / instructions`, computed whenever both raw events are
/// present and `CPI` is declared as a metric.
fn derive_cpi(config: &BackendConfig, counts: &[(String, f64)], out: &mut Vec<(String, f64)>) {
    if !config.metrics.iter().any(|m| m.name == "CPI") {
        return;
    }
    let cycles = counts.iter().find(|(n, _)| n == "cycles").map(|(_, v)| *v);
    let instructions = counts.iter().find(|(n, _)| n == "instructions").map(|(_, v)| *v);
    if let (Some(cycles), Some(instructions)) = (cycles, instructions) {
        if instructions > 0.0 {
            out.push(("CPI".to_string(), cycles / instructions));
        }
    }
}
