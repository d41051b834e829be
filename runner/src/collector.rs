use crate::distributed::{
    fs::{publish_replace, JobLayout, ERROR_PREFIX, RECORD_SUFFIX, RESULT_PREFIX},
    util::parse_ordinal,
};
use globset::{Glob, GlobMatcher};
use ignore::{DirEntry, WalkBuilder};
use itertools::Itertools;
use serde_json::Value;
use std::{
    collections::HashSet,
    ffi::OsString,
    fs, io,
    path::{Path, PathBuf},
};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

#[derive(Debug, Error)]
pub enum AggregateError {
    #[error("Invalid artifact pattern")]
    Pattern(#[from] globset::Error),
    #[error("Failed to write {path:?}")]
    Write { path: PathBuf, source: io::Error },
    #[error("Output file {0:?} has no file name")]
    InvalidOutput(PathBuf),
}

/// A per-slot artifact found on disk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    pub job_dir: PathBuf,
    pub ordinal: u32,
    pub path: PathBuf,
}

/// What an aggregation run did, for logging and the exit status of the manual command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AggregateSummary {
    pub output: PathBuf,
    pub artifacts: usize,
    pub records: usize,
    pub duplicates: usize,
    pub malformed: usize,
    pub unreadable: usize,
    pub error_records: usize,
    /// `None` when no slot left an error record
    pub errors_output: Option<PathBuf>,
}

/// Where artifacts are collected from and where the concatenation goes
#[derive(Debug, Clone)]
pub enum Collector {
    /// artifacts of a single job, written into the job directory
    Job { layout: JobLayout },
    /// artifacts of every job below a state root, for recovering old runs
    Tree { root: PathBuf, output: PathBuf },
}

impl Collector {
    pub fn job(layout: JobLayout) -> Self {
        Self::Job { layout }
    }

    pub fn tree(root: PathBuf, output: PathBuf) -> Self {
        Self::Tree { root, output }
    }

    fn root(&self) -> &Path {
        match self {
            Self::Job { layout } => layout.root(),
            Self::Tree { root, .. } => root,
        }
    }

    fn outputs(&self) -> Result<(PathBuf, PathBuf), AggregateError> {
        match self {
            Self::Job { layout } => Ok((layout.aggregated(), layout.aggregated_errors())),
            Self::Tree { output, .. } => {
                let stem = output
                    .file_stem()
                    .ok_or_else(|| AggregateError::InvalidOutput(output.clone()))?;
                let mut name = OsString::from(stem);
                name.push("_errors");
                if let Some(extension) = output.extension() {
                    name.push(".");
                    name.push(extension);
                }

                Ok((output.clone(), output.with_file_name(name)))
            }
        }
    }

    /// find artifacts with `prefix`, ordered by job directory and numeric ordinal
    pub fn artifacts(&self, prefix: &str) -> Result<Vec<Artifact>, AggregateError> {
        let root = self.root();
        let (pattern, depth) = match self {
            Self::Job { .. } => (format!("{prefix}*{RECORD_SUFFIX}"), 1),
            Self::Tree { .. } => (format!("*/{prefix}*{RECORD_SUFFIX}"), 2),
        };
        let glob: GlobMatcher = Glob::new(&pattern)?.compile_matcher();
        debug!(root = ?root, glob = ?glob, "Collecting artifacts");

        let artifacts = WalkBuilder::new(root)
            .standard_filters(false)
            .hidden(true)
            .max_depth(Some(depth))
            .build()
            .filter_map(|entry| match entry {
                Ok(entry) => Some(entry),
                Err(error) => {
                    warn!(error = ?error, "Failed to walk state directory");
                    None
                }
            })
            .filter(|entry| entry.file_type().map_or(false, |kind| kind.is_file()))
            .map(DirEntry::into_path)
            .filter(|path| {
                path.strip_prefix(root)
                    .map_or(false, |relative| glob.is_match(relative))
            })
            .filter_map(|path| {
                let name = path.file_name()?;
                let ordinal = parse_ordinal(name, prefix, RECORD_SUFFIX)?;
                let job_dir = path.parent()?.to_path_buf();

                Some(Artifact {
                    job_dir,
                    ordinal,
                    path,
                })
            })
            .sorted_by(|a, b| (&a.job_dir, a.ordinal).cmp(&(&b.job_dir, b.ordinal)))
            .collect_vec();

        Ok(artifacts)
    }

    /// Concatenate every present result artifact in ascending ordinal order.
    ///
    /// Gaps are skipped, records of an already seen instance are dropped and the output is
    /// replaced atomically, so running it again over the same artifacts gives the same file.
    #[instrument(skip_all, fields(root = ?self.root()), level = "info")]
    pub fn aggregate(&self) -> Result<AggregateSummary, AggregateError> {
        let (output, errors_output) = self.outputs()?;
        let mut summary = AggregateSummary {
            output: output.clone(),
            ..Default::default()
        };

        let artifacts = self.artifacts(RESULT_PREFIX)?;
        summary.artifacts = artifacts.len();
        if artifacts.is_empty() {
            warn!("No result artifacts found, the aggregated file will be empty");
        }

        let mut seen = HashSet::new();
        let mut aggregated = String::new();
        for artifact in &artifacts {
            let Some(contents) = read_artifact(artifact, &mut summary) else {
                continue;
            };

            for (line, instance) in records(artifact, &contents, &mut summary) {
                if !seen.insert(instance.clone()) {
                    warn!(
                        instance = %instance,
                        path = ?artifact.path,
                        "Dropping duplicate record"
                    );
                    summary.duplicates += 1;
                    continue;
                }

                aggregated.push_str(line);
                aggregated.push('\n');
                summary.records += 1;
            }
        }

        write(&output, aggregated.as_bytes())?;

        let mut errors = String::new();
        for artifact in &self.artifacts(ERROR_PREFIX)? {
            let Some(contents) = read_artifact(artifact, &mut summary) else {
                continue;
            };

            for (line, _) in records(artifact, &contents, &mut summary) {
                errors.push_str(line);
                errors.push('\n');
                summary.error_records += 1;
            }
        }

        if summary.error_records > 0 {
            write(&errors_output, errors.as_bytes())?;
            summary.errors_output = Some(errors_output);
        }

        info!(
            artifacts = summary.artifacts,
            records = summary.records,
            duplicates = summary.duplicates,
            malformed = summary.malformed,
            errors = summary.error_records,
            "Aggregated results into {:?}",
            output
        );

        Ok(summary)
    }
}

fn read_artifact(artifact: &Artifact, summary: &mut AggregateSummary) -> Option<String> {
    match fs::read_to_string(&artifact.path) {
        Ok(contents) => Some(contents),
        Err(error) => {
            warn!(error = ?error, path = ?artifact.path, "Skipping unreadable artifact");
            summary.unreadable += 1;

            None
        }
    }
}

/// valid records of an artifact together with their instance id, malformed lines are counted
fn records<'c>(
    artifact: &Artifact,
    contents: &'c str,
    summary: &mut AggregateSummary,
) -> Vec<(&'c str, String)> {
    let mut valid = Vec::new();

    for (number, line) in contents.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let instance = serde_json::from_str::<Value>(line).ok().and_then(|record| {
            record
                .get("instance_id")
                .and_then(Value::as_str)
                .map(str::to_string)
        });

        match instance {
            Some(instance) => valid.push((line, instance)),
            None => {
                warn!(
                    path = ?artifact.path,
                    line = number + 1,
                    "Skipping malformed record"
                );
                summary.malformed += 1;
            }
        }
    }

    valid
}

fn write(path: &Path, contents: &[u8]) -> Result<(), AggregateError> {
    publish_replace(path, contents).map_err(|source| AggregateError::Write {
        path: path.to_path_buf(),
        source,
    })
}
