pub mod convert;
pub mod harness;

/*
 * Scoring of an aggregated job, run once by the barrier runner or manually:
 * 1. Convert the aggregated records into the prediction format of the harness
 * 2. Run the harness with a fresh run id
 * 3. Move its log directory and summary report into the job directory
 */

use crate::{
    config::{ConfigErrors, HarnessConfig},
    distributed::fs::JobLayout,
};
use chrono::{DateTime, Utc};
use harness::{relocate, HarnessRun};
use serde_json::Value;
use std::{
    fs, io,
    path::{Path, PathBuf},
    process::ExitStatus,
    time::Duration,
};
use thiserror::Error;
use tracing::{info, instrument, warn};

pub const RUN_ID_FORMAT: &str = "%Y%m%d_%H%M%S";

#[derive(Debug, Error)]
pub enum EvaluationError {
    #[error(transparent)]
    Config(#[from] ConfigErrors),
    #[error("Job was already evaluated, see {0:?}")]
    AlreadyEvaluated(PathBuf),
    #[error("Failed to read {path:?}")]
    Read { path: PathBuf, source: io::Error },
    #[error("Failed to write {path:?}")]
    Write { path: PathBuf, source: io::Error },
    #[error("Record on line {line} is not valid JSON")]
    MalformedRecord {
        line: usize,
        source: serde_json::Error,
    },
    #[error("Record on line {line} has no instance_id")]
    MissingInstanceId { line: usize },
    #[error("{0:?} contains no records to evaluate")]
    NoPredictions(PathBuf),
    #[error("Failed to run the harness")]
    Spawn(#[source] io::Error),
    #[error("Harness exceeded {0:?}")]
    HarnessTimeout(Duration),
    #[error("Harness failed with {0}")]
    HarnessFailed(ExitStatus),
    #[error("Harness did not write its report to {0:?}")]
    MissingReport(PathBuf),
}

/// Final artifacts of an evaluated job
#[derive(Debug, Clone, PartialEq)]
pub struct EvaluationReport {
    pub run_id: String,
    pub predictions: usize,
    pub report: PathBuf,
    /// `None` if the harness did not leave a log directory
    pub eval_logs: Option<PathBuf>,
    pub resolved: Option<u64>,
    pub total: Option<u64>,
}

/// run id derived from the start time of the evaluation
pub fn run_id(now: DateTime<Utc>) -> String {
    now.format(RUN_ID_FORMAT).to_string()
}

/// Everything the trigger needs besides the job itself
#[derive(Debug, Clone, Copy)]
pub struct EvaluationRequest<'a> {
    pub dataset: &'a str,
    pub split: &'a str,
    pub environment: &'a str,
    pub run_id: &'a str,
}

/// Score the aggregated results of a job and move the outcome into the job directory.
/// Nothing is scored twice, an existing report fails the call.
#[instrument(skip_all, fields(job = ?layout.root(), run_id = request.run_id), level = "info")]
pub fn evaluate(
    config: &HarnessConfig,
    layout: &JobLayout,
    request: EvaluationRequest,
) -> Result<EvaluationReport, EvaluationError> {
    let report = layout.report();
    if report.exists() {
        return Err(EvaluationError::AlreadyEvaluated(report));
    }

    let environment_args = config.environment_args(request.environment)?;
    let predictions = layout.predictions();
    let count = convert::to_predictions(
        &layout.aggregated(),
        &predictions,
        &config.model_name,
        &config.patch_pointer,
    )?;

    let working_dir = config
        .working_dir
        .clone()
        .unwrap_or_else(|| layout.root().to_path_buf());
    let run = HarnessRun {
        config,
        dataset: request.dataset,
        split: request.split,
        predictions: &predictions,
        run_id: request.run_id,
        environment_args,
        working_dir: &working_dir,
    };
    run.run()?;

    let harness_report = run.report();
    if !harness_report.is_file() {
        return Err(EvaluationError::MissingReport(harness_report));
    }
    relocate(&harness_report, &report).map_err(|source| EvaluationError::Write {
        path: report.clone(),
        source,
    })?;

    let log_dir = run.log_dir();
    let eval_logs = if log_dir.is_dir() {
        let target = layout.eval_logs();
        relocate(&log_dir, &target).map_err(|source| EvaluationError::Write {
            path: target.clone(),
            source,
        })?;

        Some(target)
    } else {
        warn!(path = ?log_dir, "Harness left no log directory");

        None
    };

    let (resolved, total) = summarize(&report);
    info!(
        resolved = ?resolved,
        total = ?total,
        "Evaluation report available at {:?}",
        report
    );

    Ok(EvaluationReport {
        run_id: request.run_id.to_string(),
        predictions: count,
        report,
        eval_logs,
        resolved,
        total,
    })
}

/// resolved and total instance counts, if the report carries them
fn summarize(report: &Path) -> (Option<u64>, Option<u64>) {
    let summary = fs::read(report)
        .ok()
        .and_then(|contents| serde_json::from_slice::<Value>(&contents).ok());

    match summary {
        Some(summary) => (
            summary.get("resolved_instances").and_then(Value::as_u64),
            summary.get("total_instances").and_then(Value::as_u64),
        ),
        None => {
            warn!(path = ?report, "Report is not valid JSON");

            (None, None)
        }
    }
}
