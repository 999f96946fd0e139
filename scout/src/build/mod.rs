//! Builder: executes a `BuildPlan` via the chosen build backend.

mod cmake;
mod make;
mod single_source;

use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::config::StudyDefinition;
use crate::model::{BuildPlan, BuildStatus, Project};

pub struct BuildOutcome {
    pub status: BuildStatus,
    pub artifact: Option<PathBuf>,
    pub log: String,
}

impl BuildOutcome {
    pub fn ok(artifact: PathBuf, log: String) -> Self {
        BuildOutcome { status: BuildStatus::Ok, artifact: Some(artifact), log }
    }

    pub fn failed(log: String) -> Self {
        BuildOutcome { status: BuildStatus::Failed, artifact: None, log }
    }

    pub fn timeout() -> Self {
        BuildOutcome { status: BuildStatus::Timeout, artifact: None, log: String::new() }
    }
}

/// Default per-build timeout, configurable and deliberately generous.
pub const DEFAULT_BUILD_TIMEOUT: Duration = Duration::from_secs(600);

/// Builds one candidate. Cleans prior build products for Make/CMake modes
/// to avoid stale-object contamination.
pub fn build(
    study: &StudyDefinition,
    plan: &BuildPlan,
    workdir: &Path,
    timeout: Duration,
) -> BuildOutcome {
    match &study.project {
        Project::SingleSource { source, compiler, compiler_flags_base, output_basename } => {
            single_source::build(source, compiler, compiler_flags_base, plan, output_basename, workdir, timeout)
        }
        Project::Make { dir, target, make_vars } => {
            make::build(dir, target.as_deref(), make_vars, plan, workdir, timeout)
        }
        Project::CMake { dir, target, cmake_defs } => {
            cmake::build(dir, target.as_deref(), cmake_defs, plan, workdir, timeout)
        }
    }
}
