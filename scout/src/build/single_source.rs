use std::path::Path;
use std::process::Command;
use std::time::Duration;

use log::debug;

use crate::model::BuildPlan;
use crate::process::{run_with_timeout, RunOutcome};

use super::BuildOutcome;

/// Single compile invocation: `compiler base_flags trial_flags source -o artifact`.
pub fn build(
    source: &Path,
    compiler: &str,
    base_flags: &[String],
    plan: &BuildPlan,
    output_basename: &str,
    workdir: &Path,
    timeout: Duration,
) -> BuildOutcome {
    let resolved = match which::which(compiler) {
        Ok(path) => path,
        Err(_) => return BuildOutcome::failed(format!("compiler '{}' not found on PATH", compiler)),
    };

    let artifact = workdir.join(output_basename);
    let mut cmd = Command::new(&resolved);
    cmd.args(base_flags).args(&plan.trial_flags).arg(source).arg("-o").arg(&artifact);
    debug!("single-source build: {:?}", cmd);

    match run_with_timeout(&mut cmd, timeout) {
        Ok(RunOutcome::Completed { output, .. }) => {
            let log = format!(
                "{}{}",
                String::from_utf8_lossy(&output.stdout),
                String::from_utf8_lossy(&output.stderr)
            );
            if output.status.success() && artifact.exists() {
                BuildOutcome::ok(artifact, log)
            } else {
                BuildOutcome::failed(log)
            }
        }
        Ok(RunOutcome::TimedOut { .. }) => BuildOutcome::timeout(),
        Err(e) => BuildOutcome::failed(format!("failed to spawn compiler: {}", e)),
    }
}
