use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use log::debug;

use crate::model::BuildPlan;
use crate::process::{run_with_timeout, RunOutcome};

use super::BuildOutcome;

/// Fresh out-of-tree configure + build for each trial: `cmake -S -B
/// -DCMAKE_CXX_FLAGS=<trial flags> <cmake_defs>` then `cmake --build`.
pub fn build(
    dir: &Path,
    target: Option<&str>,
    cmake_defs: &BTreeMap<String, String>,
    plan: &BuildPlan,
    workdir: &Path,
    timeout: Duration,
) -> BuildOutcome {
    let cmake = match which::which("cmake") {
        Ok(p) => p,
        Err(_) => return BuildOutcome::failed("'cmake' not found on PATH".into()),
    };

    let build_dir = workdir.join("build");
    if let Err(e) = std::fs::create_dir_all(&build_dir) {
        return BuildOutcome::failed(format!("creating cmake build dir: {}", e));
    }

    let trial_flags = plan.trial_flags.join(" ");

    let mut configure = Command::new(&cmake);
    configure
        .arg("-S")
        .arg(dir)
        .arg("-B")
        .arg(&build_dir)
        .arg(format!("-DCMAKE_C_FLAGS={}", trial_flags))
        .arg(format!("-DCMAKE_CXX_FLAGS={}", trial_flags));
    for (k, v) in cmake_defs {
        configure.arg(format!("-D{}={}", k, v));
    }
    debug!("cmake configure: {:?}", configure);

    match run_with_timeout(&mut configure, timeout) {
        Ok(RunOutcome::Completed { output, .. }) if output.status.success() => {}
        Ok(RunOutcome::Completed { output, .. }) => {
            return BuildOutcome::failed(format!(
                "{}{}",
                String::from_utf8_lossy(&output.stdout),
                String::from_utf8_lossy(&output.stderr)
            ))
        }
        Ok(RunOutcome::TimedOut { .. }) => return BuildOutcome::timeout(),
        Err(e) => return BuildOutcome::failed(format!("failed to spawn cmake configure: {}", e)),
    }

    let mut build_cmd = Command::new(&cmake);
    build_cmd.arg("--build").arg(&build_dir);
    if let Some(target) = target {
        build_cmd.arg("--target").arg(target);
    }
    debug!("cmake build: {:?}", build_cmd);

    match run_with_timeout(&mut build_cmd, timeout) {
        Ok(RunOutcome::Completed { output, .. }) => {
            let log = format!(
                "{}{}",
                String::from_utf8_lossy(&output.stdout),
                String::from_utf8_lossy(&output.stderr)
            );
            if !output.status.success() {
                return BuildOutcome::failed(log);
            }
            match find_artifact(&build_dir, target) {
                Some(path) => BuildOutcome::ok(path, log),
                None => BuildOutcome::failed(format!("{}\n(artifact not found after build)", log)),
            }
        }
        Ok(RunOutcome::TimedOut { .. }) => BuildOutcome::timeout(),
        Err(e) => BuildOutcome::failed(format!("failed to spawn cmake --build: {}", e)),
    }
}

fn find_artifact(build_dir: &Path, target: Option<&str>) -> Option<PathBuf> {
    if let Some(target) = target {
        if let Some(found) = walkdir::WalkDir::new(build_dir)
            .into_iter()
            .flatten()
            .find(|e| e.file_type().is_file() && e.file_name().to_string_lossy() == target)
        {
            return Some(found.path().to_path_buf());
        }
    }
    for entry in walkdir::WalkDir::new(build_dir).into_iter().flatten() {
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
