/*
 * Slurm side of a job:
 * 1. Size the array from the number of instances, one slot per instance
 * 2. Render a batch script with the array range, concurrency cap and resource directives
 * 3. Hand it to sbatch, which returns the job id all shared state is keyed by
 */

use super::EvalMode;
use crate::distributed::JobId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{
    io::{self, Write},
    path::PathBuf,
    process::{Command, Stdio},
};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error("A job array needs at least one instance")]
    EmptyArray,
    #[error("Concurrency cap must be at least 1")]
    InvalidConcurrency,
    #[error("Failed to run sbatch")]
    Spawn(#[from] io::Error),
    #[error("sbatch rejected the job: {0}")]
    Rejected(String),
    #[error("sbatch returned no usable job id: {0:?}")]
    InvalidJobId(String),
}

/// where the number of array slots came from
#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ItemCountSource {
    /// enumerated from the dataset at submission time
    Detected,
    /// given explicitly on the command line
    Override,
    /// offline diagnostic mode, never use these results for anything real
    Guessed,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ItemCount {
    pub count: u32,
    pub source: ItemCountSource,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
pub struct Resources {
    pub partition: Option<String>,
    pub cpus: u32,
    pub mem: String,
    pub time: String,
    pub gpus: Option<String>,
}

/// Description of a submitted job, persisted next to its shared state
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
pub struct JobMetadata {
    pub job_id: Option<JobId>,
    pub dataset: String,
    pub split: String,
    pub mode: EvalMode,
    pub agent: String,
    pub llm_config: PathBuf,
    pub max_iterations: u32,
    pub array_size: u32,
    pub max_concurrent: u32,
    pub end_to_end: bool,
    pub eval_env: Option<String>,
    pub item_count_source: ItemCountSource,
    pub submitted_at: DateTime<Utc>,
    pub submitted_from: String,
}

/// Inputs of the descriptor generator
#[derive(Clone, Debug)]
pub struct ArrayRequest {
    pub job_name: String,
    pub items: ItemCount,
    pub max_concurrent: u32,
    pub resources: Resources,
    pub logs_dir: PathBuf,
    pub setup: Vec<String>,
    /// command every slot runs
    pub command: Vec<String>,
    pub metadata: JobMetadata,
}

/// A fully sized job array submission
#[derive(Clone, Debug)]
pub struct ArrayDescriptor {
    request: ArrayRequest,
    array_end: u32,
}

impl ArrayDescriptor {
    pub fn new(mut request: ArrayRequest) -> Result<Self, SchedulerError> {
        if request.items.count == 0 {
            return Err(SchedulerError::EmptyArray);
        }
        if request.max_concurrent == 0 {
            return Err(SchedulerError::InvalidConcurrency);
        }

        request.metadata.array_size = request.items.count;
        request.metadata.max_concurrent = request.max_concurrent;
        request.metadata.item_count_source = request.items.source;

        Ok(Self {
            array_end: request.items.count - 1,
            request,
        })
    }

    pub fn array_end(&self) -> u32 {
        self.array_end
    }

    pub fn array_size(&self) -> u32 {
        self.array_end + 1
    }

    pub fn metadata(&self) -> &JobMetadata {
        &self.request.metadata
    }

    /// Array range for `--array`, the cap is only added when it actually limits the array
    pub fn array_spec(&self) -> String {
        if self.request.max_concurrent < self.array_size() {
            format!("0-{}%{}", self.array_end, self.request.max_concurrent)
        } else {
            format!("0-{}", self.array_end)
        }
    }

    /// render the batch script handed to sbatch
    pub fn render(&self) -> String {
        let request = &self.request;
        let resources = &request.resources;
        let logs = request.logs_dir.to_string_lossy();
        let mut directives = vec![
            ("job-name", request.job_name.clone()),
            ("array", self.array_spec()),
            ("output", format!("{logs}/%A_%a.out")),
            ("error", format!("{logs}/%A_%a.err")),
            ("cpus-per-task", resources.cpus.to_string()),
            ("mem", resources.mem.clone()),
            ("time", resources.time.clone()),
        ];
        if let Some(partition) = &resources.partition {
            directives.push(("partition", partition.clone()));
        }
        if let Some(gpus) = &resources.gpus {
            directives.push(("gres", format!("gpu:{gpus}")));
        }

        let mut script = String::from("#!/bin/bash\n");
        for (name, value) in directives {
            script.push_str(&format!("#SBATCH --{name}={value}\n"));
        }

        script.push_str(&format!(
            "\n# items: {} ({})\n",
            request.items.count,
            match request.items.source {
                ItemCountSource::Detected => "detected",
                ItemCountSource::Override => "override",
                ItemCountSource::Guessed => "guessed",
            }
        ));
        if request.items.source == ItemCountSource::Guessed {
            script.push_str(
                "# WARNING: item count was guessed in offline diagnostic mode, results are not valid\n",
            );
        }
        match serde_json::to_string(&request.metadata) {
            Ok(metadata) => script.push_str(&format!("# arrayeval-metadata: {metadata}\n")),
            Err(error) => warn!(error = ?error, "Failed to embed job metadata in the script"),
        }

        script.push_str("\nset -euo pipefail\n");
        for line in &request.setup {
            script.push_str(line);
            script.push('\n');
        }

        let command = request
            .command
            .iter()
            .map(|arg| shell_quote(arg))
            .collect::<Vec<_>>()
            .join(" ");
        script.push_str(&format!("exec {command}\n"));

        script
    }
}

/// quote `arg` for a POSIX shell, plain words are left alone
pub fn shell_quote(arg: &str) -> String {
    let plain = !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "_-./=:%@+,".contains(c));

    if plain {
        arg.to_string()
    } else {
        format!("'{}'", arg.replace('\'', r"'\''"))
    }
}

/// The cluster scheduler as seen by the submitting process
pub trait Scheduler {
    fn submit(&self, script: &str) -> Result<JobId, SchedulerError>;
}

/// Submits through the `sbatch` command line tool
#[derive(Debug, Clone)]
pub struct Sbatch {
    exec: PathBuf,
}

impl Sbatch {
    pub fn new(exec: PathBuf) -> Self {
        Self { exec }
    }
}

impl Scheduler for Sbatch {
    #[instrument(skip_all, level = "info")]
    fn submit(&self, script: &str) -> Result<JobId, SchedulerError> {
        let mut child = Command::new(&self.exec)
            .arg("--parsable")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(script.as_bytes())?;
            // closing stdin marks the end of the script
        }

        let output = child.wait_with_output()?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        debug!(stdout = %stdout, "sbatch finished");

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            warn!(status = %output.status, "sbatch rejected the job");

            return Err(SchedulerError::Rejected(stderr));
        }

        let job = parse_job_id(&stdout)?;
        info!(job = %job, "Submitted job array");

        Ok(job)
    }
}

/// `sbatch --parsable` prints `<job id>[;<cluster>]`
pub fn parse_job_id(stdout: &str) -> Result<JobId, SchedulerError> {
    let id = stdout
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .and_then(|line| line.split(';').next())
        .unwrap_or_default();

    if id.is_empty() || !id.chars().all(|c| c.is_ascii_digit()) {
        return Err(SchedulerError::InvalidJobId(stdout.to_string()));
    }

    id.parse()
        .map_err(|_| SchedulerError::InvalidJobId(stdout.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{fs, os::unix::fs::PermissionsExt};

    fn request(count: u32, source: ItemCountSource, max_concurrent: u32) -> ArrayRequest {
        ArrayRequest {
            job_name: "arrayeval".to_string(),
            items: ItemCount { count, source },
            max_concurrent,
            resources: Resources {
                partition: Some("gpu".to_string()),
                cpus: 8,
                mem: "32G".to_string(),
                time: "02:00:00".to_string(),
                gpus: None,
            },
            logs_dir: PathBuf::from("/shared/logs"),
            setup: vec!["module load apptainer".to_string()],
            command: vec![
                "/opt/arrayeval".to_string(),
                "slot".to_string(),
                "my config.toml".to_string(),
            ],
            metadata: JobMetadata {
                job_id: None,
                dataset: "princeton-nlp/SWE-bench_Lite".to_string(),
                split: "test".to_string(),
                mode: EvalMode::Swe,
                agent: "CodeActAgent".to_string(),
                llm_config: PathBuf::from("llm.toml"),
                max_iterations: 100,
                array_size: 0,
                max_concurrent: 0,
                end_to_end: true,
                eval_env: Some("local".to_string()),
                item_count_source: ItemCountSource::Detected,
                submitted_at: Utc::now(),
                submitted_from: "login1".to_string(),
            },
        }
    }

    #[test]
    fn array_covers_every_item() {
        let descriptor =
            ArrayDescriptor::new(request(300, ItemCountSource::Detected, 32)).unwrap();

        assert_eq!(descriptor.array_end(), 299);
        assert_eq!(descriptor.array_spec(), "0-299%32");
        assert_eq!(descriptor.metadata().array_size, 300);
        assert_eq!(descriptor.metadata().max_concurrent, 32);
    }

    #[test]
    fn single_item_array() {
        let descriptor = ArrayDescriptor::new(request(1, ItemCountSource::Override, 32)).unwrap();
        let script = descriptor.render();

        assert_eq!(descriptor.array_spec(), "0-0");
        assert!(script.contains("#SBATCH --array=0-0\n"));
    }

    #[test]
    fn empty_arrays_are_rejected() {
        assert!(matches!(
            ArrayDescriptor::new(request(0, ItemCountSource::Detected, 4)),
            Err(SchedulerError::EmptyArray)
        ));
    }

    #[test]
    fn script_carries_resources_and_command() {
        let script = ArrayDescriptor::new(request(10, ItemCountSource::Detected, 4))
            .unwrap()
            .render();

        assert!(script.starts_with("#!/bin/bash\n"));
        for line in [
            "#SBATCH --array=0-9%4",
            "#SBATCH --output=/shared/logs/%A_%a.out",
            "#SBATCH --error=/shared/logs/%A_%a.err",
            "#SBATCH --cpus-per-task=8",
            "#SBATCH --mem=32G",
            "#SBATCH --partition=gpu",
            "module load apptainer",
            "exec /opt/arrayeval slot 'my config.toml'",
        ] {
            assert!(script.lines().any(|l| l == line), "missing {line}");
        }
        assert!(!script.contains("--gres"));
        assert!(!script.contains("WARNING"));
    }

    #[test]
    fn directives_form_the_script_header() {
        let mut request = request(3, ItemCountSource::Detected, 8);
        request.resources.gpus = Some("a100:1".to_string());
        let script = ArrayDescriptor::new(request).unwrap().render();

        let header: Vec<&str> = script
            .lines()
            .skip(1)
            .take_while(|line| line.starts_with("#SBATCH"))
            .collect();
        assert_eq!(
            header,
            [
                "#SBATCH --job-name=arrayeval",
                "#SBATCH --array=0-2",
                "#SBATCH --output=/shared/logs/%A_%a.out",
                "#SBATCH --error=/shared/logs/%A_%a.err",
                "#SBATCH --cpus-per-task=8",
                "#SBATCH --mem=32G",
                "#SBATCH --time=02:00:00",
                "#SBATCH --partition=gpu",
                "#SBATCH --gres=gpu:a100:1",
            ]
        );
        assert!(script
            .lines()
            .any(|line| line.starts_with("# arrayeval-metadata: {")));
        assert!(script.ends_with("exec /opt/arrayeval slot 'my config.toml'\n"));
    }

    #[test]
    fn guessed_counts_are_flagged() {
        let descriptor = ArrayDescriptor::new(request(5, ItemCountSource::Guessed, 4)).unwrap();
        let script = descriptor.render();

        assert!(script.contains("# items: 5 (guessed)"));
        assert!(script.contains("WARNING: item count was guessed"));
        assert!(script.contains("\"item_count_source\":\"guessed\""));
        assert_eq!(
            descriptor.metadata().item_count_source,
            ItemCountSource::Guessed
        );
    }

    #[test]
    fn quoting() {
        assert_eq!(shell_quote("plain/path-1.toml"), "plain/path-1.toml");
        assert_eq!(shell_quote(""), "''");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
        assert_eq!(shell_quote("$HOME"), "'$HOME'");
    }

    #[test]
    fn job_id_parsing() {
        assert_eq!(parse_job_id("12345\n").unwrap().as_str(), "12345");
        assert_eq!(parse_job_id("987;cluster-a\n").unwrap().as_str(), "987");
        assert!(parse_job_id("").is_err());
        assert!(parse_job_id("Submitted batch job 1").is_err());
    }

    #[test]
    fn sbatch_reads_the_script_from_stdin() {
        let dir = tempfile::tempdir().unwrap();
        let captured = dir.path().join("captured.sh");
        let exec = dir.path().join("sbatch");
        fs::write(
            &exec,
            format!(
                "#!/bin/sh\n[ \"$1\" = \"--parsable\" ] || exit 9\ncat > {}\necho '4711;main'\n",
                captured.display()
            ),
        )
        .unwrap();
        fs::set_permissions(&exec, fs::Permissions::from_mode(0o755)).unwrap();

        let job = Sbatch::new(exec).submit("#!/bin/bash\necho hi\n").unwrap();

        assert_eq!(job.as_str(), "4711");
        assert_eq!(
            fs::read_to_string(captured).unwrap(),
            "#!/bin/bash\necho hi\n"
        );
    }

    #[test]
    fn sbatch_rejection_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let exec = dir.path().join("sbatch");
        fs::write(&exec, "#!/bin/sh\ncat > /dev/null\necho 'invalid partition' >&2\nexit 1\n")
            .unwrap();
        fs::set_permissions(&exec, fs::Permissions::from_mode(0o755)).unwrap();

        match Sbatch::new(exec).submit("#!/bin/bash\n") {
            Err(SchedulerError::Rejected(message)) => assert_eq!(message, "invalid partition"),
            other => panic!("unexpected {other:?}"),
        }
    }
}
