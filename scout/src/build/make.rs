use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use log::debug;

use crate::model::BuildPlan;
use crate::process::{run_with_timeout, RunOutcome};

use super::BuildOutcome;

/// Copies the project directory into the (exclusive) build working
/// directory, runs `make clean` then `make` with `EXTRA_CFLAGS` set to the
/// trial flag string and `make_vars` overridden.
pub fn build(
    dir: &Path,
    target: Option<&str>,
    make_vars: &BTreeMap<String, String>,
    plan: &BuildPlan,
    workdir: &Path,
    timeout: Duration,
) -> BuildOutcome {
    let make = match which::which("make") {
        Ok(p) => p,
        Err(_) => return BuildOutcome::failed("'make' not found on PATH".into()),
    };

    if let Err(e) = copy_project(dir, workdir) {
        return BuildOutcome::failed(format!("copying project into build dir: {}", e));
    }

    let extra_cflags = plan.trial_flags.join(" ");

    let clean_outcome = run_make(&make, workdir, &["clean"], make_vars, &extra_cflags, timeout);
    match clean_outcome {
        Ok(RunOutcome::TimedOut { .. }) => return BuildOutcome::timeout(),
        Ok(RunOutcome::Completed { .. }) | Err(_) => {
            // A missing `clean` target is not fatal; proceed to the real build.
        }
    }

    match run_make(&make, workdir, &[], make_vars, &extra_cflags, timeout) {
        Ok(RunOutcome::Completed { output, .. }) => {
            let log = format!(
                "{}{}",
                String::from_utf8_lossy(&output.stdout),
                String::from_utf8_lossy(&output.stderr)
            );
            if !output.status.success() {
                return BuildOutcome::failed(log);
            }
            match find_artifact(workdir, target) {
                Some(path) => BuildOutcome::ok(path, log),
                None => BuildOutcome::failed(format!("{}\n(artifact not found after build)", log)),
            }
        }
        Ok(RunOutcome::TimedOut { .. }) => BuildOutcome::timeout(),
        Err(e) => BuildOutcome::failed(format!("failed to spawn make: {}", e)),
    }
}

fn run_make(
    make: &Path,
    workdir: &Path,
    extra_args: &[&str],
    make_vars: &BTreeMap<String, String>,
    extra_cflags: &str,
    timeout: Duration,
) -> std::io::Result<RunOutcome> {
    let mut cmd = Command::new(make);
    cmd.current_dir(workdir).env("EXTRA_CFLAGS", extra_cflags).args(extra_args);
    for (k, v) in make_vars {
        cmd.arg(format!("{}={}", k, v));
    }
    debug!("make invocation: {:?}", cmd);
    run_with_timeout(&mut cmd, timeout)
}

fn find_artifact(workdir: &Path, target: Option<&str>) -> Option<PathBuf> {
    if let Some(target) = target {
        let candidate = workdir.join(target);
        if candidate.exists() {
            return Some(candidate);
        }
    }
    for entry in walkdir::WalkDir::new(workdir).max_depth(3).into_iter().flatten() {
        if entry.file_type().is_file() && is_executable(entry.path()) {
            return Some(entry.path().to_path_buf());
        }
    }
    None
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path).map(|m| m.permissions().mode() & 0o111 != 0).unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(_path: &Path) -> bool {
    false
}

fn copy_project(dir: &Path, workdir: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(workdir)?;
    let mut dir_with_slash = dir.to_path_buf();
    dir_with_slash.push(".");
    let mut cmd = Command::new("cp");
    cmd.arg("-LR").arg(&dir_with_slash).arg(workdir);
    let status = cmd.status()?;
    if !status.success() {
        return Err(std::io::Error::new(std::io::ErrorKind::Other, "cp failed"));
    }
    Ok(())
}
