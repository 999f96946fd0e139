//! Runner: executes a built artifact under a measurement backend `runs`
//! times and collects the raw `{metric: [sample, ...]}` matrix.

mod likwid;
mod perf;

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use crate::config::BackendConfig;
use crate::error::ScoutError;
use crate::model::{Backend, RunStatus, RuntimePlan};

pub struct RunOutcome {
    pub status: RunStatus,
    pub samples: BTreeMap<String, Vec<f64>>,
    pub log: String,
}

/// Default per-repetition timeout, mirrored from the Builder's default.
pub const DEFAULT_RUN_TIMEOUT: Duration = Duration::from_secs(120);

/// Runs the artifact `reps` times through the backend named by `backend`,
/// merging each repetition's metric samples into one `{metric: [f64]}`
/// matrix.
pub fn measure(
    backend: Backend,
    config: &BackendConfig,
    artifact: &Path,
    plan: &RuntimePlan,
    reps: usize,
    timeout: Duration,
) -> RunOutcome {
    let mut samples: BTreeMap<String, Vec<f64>> = BTreeMap::new();
    for rep in 0..reps {
        let single = match backend {
            Backend::Likwid => likwid::measure_once(config, artifact, plan, timeout),
            Backend::Perf => perf::measure_once(config, artifact, plan, timeout),
        };
        match single {
            Ok(metrics) => {
                for (k, v) in metrics {
                    samples.entry(k).or_default().push(v);
                }
            }
            Err(RepetitionError::Timeout) => {
                return RunOutcome {
                    status: RunStatus::Timeout,
                    samples,
                    log: format!("repetition {} timed out", rep),
                };
            }
            Err(RepetitionError::Failed(msg)) => {
                return RunOutcome { status: RunStatus::Failed, samples, log: msg };
            }
            Err(RepetitionError::MetricMissing(msg)) => {
                return RunOutcome { status: RunStatus::MetricMissing, samples, log: msg };
            }
        }
    }
    RunOutcome { status: RunStatus::Ok, samples, log: String::new() }
}

/// Internal per-repetition failure, collapsed by `measure` into a
/// backend-agnostic `RunStatus`.
pub(crate) enum RepetitionError {
    Timeout,
    Failed(String),
    MetricMissing(String),
}

impl From<RepetitionError> for ScoutError {
    fn from(e: RepetitionError) -> Self {
        match e {
            RepetitionError::Timeout => ScoutError::RunTimeout(DEFAULT_RUN_TIMEOUT),
            RepetitionError::Failed(m) => ScoutError::RunFailed(m),
            RepetitionError::MetricMissing(m) => ScoutError::MetricMissing(m),
        }
    }
}

/// Builds the `taskset`-style core-pinning prefix shared by both backends,
/// when a `core_list` is declared.
pub(crate) fn core_list_arg(core_list: &[u32]) -> Option<String> {
    if core_list.is_empty() {
        return None;
    }
    Some(
        core_list
            .iter()
            .map(|c| c.to_string())
            .collect::<Vec<_>>()
            .join(","),
    )
}
