//! Result Archive: an append-only CSV log of every trial, with a
//! byte-stable header so two runs over the same config produce comparable
//! files and so a mismatched header is refused rather than silently
//! corrupted.

use std::fs::{File, OpenOptions};
use std::path::Path;

use csv::{ReaderBuilder, WriterBuilder};

use crate::error::ScoutError;
use crate::model::{AssignedValue, Assignment, BuildStatus, DecisionKind, RunStatus, SearchSpace, TrialRecord, Value};

pub struct Archive {
    writer: csv::Writer<File>,
    header: Vec<String>,
}

/// Column layout: trial id, one column per decision variable (in the
/// Space Compiler's order), build/run status, one column per declared
/// metric, then the error code/message and wallclock columns.
fn expected_header(space: &SearchSpace, metric_names: &[String]) -> Vec<String> {
    let mut header = vec!["trial_id".to_string()];
    header.extend(space.variables.iter().map(|v| v.name.clone()));
    header.push("build_status".to_string());
    header.push("run_status".to_string());
    header.extend(metric_names.iter().cloned());
    header.push("error_code".to_string());
    header.push("error_message".to_string());
    header.push("wallclock_ms".to_string());
    header
}

impl Archive {
    /// Opens a fresh archive, refusing to clobber an existing file. Use
    /// `resume` to append to one explicitly.
    pub fn create(path: &Path, space: &SearchSpace, metric_names: &[String]) -> Result<Self, ScoutError> {
        if path.exists() {
            return Err(ScoutError::Archive(format!(
                "{:?} already exists; pass --resume to append to it",
                path
            )));
        }
        let header = expected_header(space, metric_names);
        let mut writer = WriterBuilder::new()
            .from_path(path)
            .map_err(|e| ScoutError::Archive(format!("creating {:?}: {}", path, e)))?;
        writer
            .write_record(&header)
            .map_err(|e| ScoutError::Archive(format!("writing header: {}", e)))?;
        writer.flush().map_err(|e| ScoutError::Archive(e.to_string()))?;
        Ok(Archive { writer, header })
    }

    /// Opens an existing archive for append, verifying its header matches
    /// byte-for-byte and replaying its rows back as `TrialRecord`s so the
    /// orchestrator can re-seed the optimizer before the first new
    /// `suggest()` call.
    pub fn resume(
        path: &Path,
        space: &SearchSpace,
        metric_names: &[String],
    ) -> Result<(Self, Vec<TrialRecord>), ScoutError> {
        if !path.exists() {
            return Err(ScoutError::Archive(format!("--resume given but {:?} does not exist", path)));
        }
        let expected = expected_header(space, metric_names);

        let mut reader = ReaderBuilder::new()
            .from_path(path)
            .map_err(|e| ScoutError::Archive(format!("reading {:?}: {}", path, e)))?;
        let actual_header: Vec<String> =
            reader.headers().map_err(|e| ScoutError::Archive(e.to_string()))?.iter().map(str::to_string).collect();
        if actual_header != expected {
            return Err(ScoutError::Archive(format!(
                "{:?} header does not match this config's archive layout; refusing to resume",
                path
            )));
        }

        let mut records = Vec::new();
        for row in reader.records() {
            let row = row.map_err(|e| ScoutError::Archive(e.to_string()))?;
            records.push(parse_row(&row, space, metric_names)?);
        }

        let file = OpenOptions::new()
            .append(true)
            .open(path)
            .map_err(|e| ScoutError::Archive(format!("opening {:?} for append: {}", path, e)))?;
        let writer = WriterBuilder::new().has_headers(false).from_writer(file);

        Ok((Archive { writer, header: expected }, records))
    }

    /// Appends one trial's row, converting non-UTF8-safe/absent fields to
    /// the empty string per the archive's sentinel convention.
    pub fn append(&mut self, record: &TrialRecord, space: &SearchSpace, metric_names: &[String]) -> Result<(), ScoutError> {
        let mut row = vec![record.trial_id.to_string()];
        for var in &space.variables {
            let field = record.assignment.get(&var.name).map(|v| v.archive_field()).unwrap_or_default();
            row.push(field);
        }
        row.push(record.build_status.to_string());
        row.push(record.run_status.to_string());
        for name in metric_names {
            row.push(record.aggregated.get(name).map(|v| v.to_string()).unwrap_or_default());
        }
        row.push(record.error_code.clone().unwrap_or_default());
        row.push(record.error_message.clone().unwrap_or_default());
        row.push(record.wallclock.as_millis().to_string());

        self.writer
            .write_record(&row)
            .map_err(|e| ScoutError::Archive(format!("writing trial {}: {}", record.trial_id, e)))?;
        self.writer.flush().map_err(|e| ScoutError::Archive(e.to_string()))?;
        Ok(())
    }

    pub fn header(&self) -> &[String] {
        &self.header
    }
}

fn parse_row(row: &csv::StringRecord, space: &SearchSpace, metric_names: &[String]) -> Result<TrialRecord, ScoutError> {
    let get = |idx: usize| -> Result<&str, ScoutError> {
        row.get(idx).ok_or_else(|| ScoutError::Archive("archive row has fewer columns than its header".into()))
    };

    let trial_id: u64 = get(0)?
        .parse()
        .map_err(|_| ScoutError::Archive("non-numeric trial_id in archive".into()))?;

    let mut assignment = Assignment::new();
    let mut col = 1;
    for var in &space.variables {
        let field = get(col)?;
        col += 1;
        if field.is_empty() && var.kind != DecisionKind::Choice {
            assignment.insert(var.name.clone(), AssignedValue::Inactive);
            continue;
        }
        let value = var
            .domain
            .iter()
            .find(|d| d.to_string() == field)
            .cloned()
            .unwrap_or_else(|| Value::Str(field.to_string()));
        assignment.insert(var.name.clone(), AssignedValue::Active(value));
    }

    let build_status = match get(col)? {
        "ok" => BuildStatus::Ok,
        "failed" => BuildStatus::Failed,
        "build_timeout" => BuildStatus::Timeout,
        _ => BuildStatus::MaterializationError,
    };
    col += 1;
    let run_status = match get(col)? {
        "ok" => RunStatus::Ok,
        "run_failed" => RunStatus::Failed,
        "run_timeout" => RunStatus::Timeout,
        "metric_missing" => RunStatus::MetricMissing,
        _ => RunStatus::NotRun,
    };
    col += 1;

    let mut aggregated = std::collections::BTreeMap::new();
    for name in metric_names {
        let field = get(col)?;
        col += 1;
        if !field.is_empty() {
            if let Ok(v) = field.parse::<f64>() {
                aggregated.insert(name.clone(), v);
            }
        }
    }

    let error_code = get(col)?;
    let error_code = if error_code.is_empty() { None } else { Some(error_code.to_string()) };
    col += 1;
    let error_message = get(col)?;
    let error_message = if error_message.is_empty() { None } else { Some(error_message.to_string()) };
    col += 1;
    let wallclock_ms: u64 = get(col)?.parse().unwrap_or(0);

    Ok(TrialRecord {
        trial_id,
        assignment,
        build_status,
        run_status,
        raw_samples: std::collections::BTreeMap::new(),
        aggregated,
        objective_vector: Vec::new(),
        wallclock: std::time::Duration::from_millis(wallclock_ms),
        error_code,
        error_message,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{DecisionKind, DecisionVariable};
    use tempfile::tempdir;

    fn toy_space() -> SearchSpace {
        SearchSpace {
            variables: vec![DecisionVariable {
                name: "opt_level".into(),
                kind: DecisionKind::Choice,
                domain: vec![Value::Str("-O2".into()), Value::Str("-O3".into())],
                guard: None,
            }],
        }
    }

    fn toy_record(trial_id: u64) -> TrialRecord {
        let mut assignment = Assignment::new();
        assignment.insert("opt_level", AssignedValue::Active(Value::Str("-O3".into())));
        let mut aggregated = std::collections::BTreeMap::new();
        aggregated.insert("CPI".to_string(), 1.23);
        TrialRecord {
            trial_id,
            assignment,
            build_status: BuildStatus::Ok,
            run_status: RunStatus::Ok,
            raw_samples: Default::default(),
            aggregated,
            objective_vector: vec![1.23],
            wallclock: std::time::Duration::from_millis(42),
            error_code: None,
            error_message: None,
        }
    }

    #[test]
    fn refuses_to_create_over_an_existing_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("out.csv");
        std::fs::write(&path, "x").unwrap();
        let space = toy_space();
        let err = Archive::create(&path, &space, &["CPI".to_string()]).unwrap_err();
        assert!(matches!(err, ScoutError::Archive(_)));
    }

    #[test]
    fn round_trips_a_trial_through_resume() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("out.csv");
        let space = toy_space();
        let metrics = vec!["CPI".to_string()];

        {
            let mut archive = Archive::create(&path, &space, &metrics).unwrap();
            archive.append(&toy_record(0), &space, &metrics).unwrap();
        }

        let (_, records) = Archive::resume(&path, &space, &metrics).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].trial_id, 0);
        assert_eq!(records[0].aggregated["CPI"], 1.23);
        assert_eq!(records[0].assignment.active_value("opt_level"), Some(&Value::Str("-O3".into())));
    }

    #[test]
    fn resume_rejects_mismatched_header() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("out.csv");
        let space = toy_space();
        let metrics = vec!["CPI".to_string()];
        {
            let mut archive = Archive::create(&path, &space, &metrics).unwrap();
            archive.append(&toy_record(0), &space, &metrics).unwrap();
        }
        let other_metrics = vec!["IPC".to_string()];
        let err = Archive::resume(&path, &space, &other_metrics).unwrap_err();
        assert!(err.to_string().contains("header"));
    }
}
