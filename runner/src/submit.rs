use crate::{
    config::{ConfigErrors, RunnerConfig},
    distributed::{
        fs::{publish_replace, JobLayout},
        util::hostname,
        JobId,
    },
    enumerate::{EnumerationError, InstanceSource},
    executors::{
        slurm::{
            ArrayDescriptor, ArrayRequest, ItemCount, ItemCountSource, JobMetadata, Resources,
            Scheduler, SchedulerError,
        },
        TaskBundle,
    },
};
use chrono::Utc;
use std::{
    fs,
    io::{self, Write},
    path::PathBuf,
};
use thiserror::Error;
use tracing::{error, info, instrument, warn};

#[derive(Debug, Error)]
pub enum SubmitError {
    #[error(transparent)]
    Config(#[from] ConfigErrors),
    #[error("LLM config {0:?} does not exist")]
    MissingLlmConfig(PathBuf),
    #[error("Failed to detect the number of instances, pass --array-size or --offline-guess")]
    Detection(#[source] EnumerationError),
    #[error(transparent)]
    Scheduler(#[from] SchedulerError),
    #[error("Failed to serialize job metadata")]
    Metadata(#[from] serde_json::Error),
    #[error("Failed to write {path:?}")]
    Write { path: PathBuf, source: io::Error },
}

/// Everything `submit` takes from the command line
#[derive(Debug, Clone)]
pub struct SubmitRequest {
    pub bundle: TaskBundle,
    pub end_to_end: bool,
    pub eval_env: String,
    pub resources: Resources,
    pub max_concurrent: u32,
    /// explicit item count, skips detection
    pub array_size: Option<u32>,
    /// count used if detection fails, diagnostic runs only
    pub offline_guess: Option<u32>,
    pub dry_run: bool,
    /// command line every slot runs, without the task arguments
    pub slot_command: Vec<String>,
}

impl SubmitRequest {
    /// the slot command followed by the arguments describing the task
    pub fn command(&self) -> Vec<String> {
        let bundle = &self.bundle;
        let mut command = self.slot_command.clone();

        command.extend([
            bundle.llm_config.to_string_lossy().into_owned(),
            bundle.agent.clone(),
            bundle.dataset.clone(),
            bundle.split.clone(),
            "--max-iterations".to_string(),
            bundle.max_iterations.to_string(),
            "--mode".to_string(),
            bundle.mode.to_string(),
            "--runtime".to_string(),
            bundle.runtime.clone(),
        ]);
        if self.end_to_end {
            command.extend([
                "--end-to-end".to_string(),
                "--eval-env".to_string(),
                self.eval_env.clone(),
            ]);
        }

        command
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SubmitOutcome {
    DryRun {
        script: String,
        metadata: JobMetadata,
    },
    Submitted {
        job: JobId,
        metadata: PathBuf,
    },
}

/// Number of array slots for the request.
/// A failed detection only falls back to a guess if one was given explicitly.
pub fn item_count<S: InstanceSource + ?Sized>(
    source: &S,
    request: &SubmitRequest,
) -> Result<ItemCount, SubmitError> {
    if let Some(count) = request.array_size {
        info!("Using {count} instances as requested");

        return Ok(ItemCount {
            count,
            source: ItemCountSource::Override,
        });
    }

    match source.enumerate(&request.bundle.dataset, &request.bundle.split) {
        Ok(list) => {
            info!("Detected {} instances", list.len());

            Ok(ItemCount {
                count: u32::try_from(list.len()).unwrap_or(u32::MAX),
                source: ItemCountSource::Detected,
            })
        }
        Err(e) => match request.offline_guess {
            Some(count) => {
                warn!(error = %e, "Detection failed, falling back to a guessed count of {count}. The results of this job are diagnostic only");

                Ok(ItemCount {
                    count,
                    source: ItemCountSource::Guessed,
                })
            }
            None => {
                error!(error = %e, "Could not detect the number of instances");

                Err(SubmitError::Detection(e))
            }
        },
    }
}

/// Size, render and submit the job array of a run, or print it on a dry run
#[instrument(skip_all, fields(dataset = %request.bundle.dataset, split = %request.bundle.split), level = "info")]
pub fn submit<S, D, W>(
    config: &RunnerConfig,
    request: &SubmitRequest,
    source: &S,
    scheduler: &D,
    out: &mut W,
) -> Result<SubmitOutcome, SubmitError>
where
    S: InstanceSource + ?Sized,
    D: Scheduler + ?Sized,
    W: Write,
{
    let llm_config = &request.bundle.llm_config;
    if !llm_config.is_file() {
        error!("LLM config {} does not exist", llm_config.to_string_lossy());

        return Err(SubmitError::MissingLlmConfig(llm_config.clone()));
    }
    if request.end_to_end {
        config.harness.environment_args(&request.eval_env)?;
    }

    let items = item_count(source, request)?;
    let bundle = &request.bundle;
    let metadata = JobMetadata {
        job_id: None,
        dataset: bundle.dataset.clone(),
        split: bundle.split.clone(),
        mode: bundle.mode,
        agent: bundle.agent.clone(),
        llm_config: bundle.llm_config.clone(),
        max_iterations: bundle.max_iterations,
        array_size: items.count,
        max_concurrent: request.max_concurrent,
        end_to_end: request.end_to_end,
        eval_env: request.end_to_end.then(|| request.eval_env.clone()),
        item_count_source: items.source,
        submitted_at: Utc::now(),
        submitted_from: hostname().to_string_lossy().into_owned(),
    };

    let logs_dir = config.logs_dir();
    let descriptor = ArrayDescriptor::new(ArrayRequest {
        job_name: config.scheduler.job_name.clone(),
        items,
        max_concurrent: request.max_concurrent,
        resources: request.resources.clone(),
        logs_dir: logs_dir.clone(),
        setup: config.scheduler.setup.clone(),
        command: request.command(),
        metadata,
    })?;
    let script = descriptor.render();

    if request.dry_run {
        let metadata = descriptor.metadata().clone();
        let pretty = serde_json::to_string_pretty(&metadata)?;
        writeln!(out, "{script}\n{pretty}").map_err(|source| SubmitError::Write {
            path: PathBuf::from("<stdout>"),
            source,
        })?;
        info!("Dry run, nothing was submitted");

        return Ok(SubmitOutcome::DryRun { script, metadata });
    }

    fs::create_dir_all(&logs_dir).map_err(|source| SubmitError::Write {
        path: logs_dir.clone(),
        source,
    })?;

    let job = scheduler.submit(&script)?;
    let layout = JobLayout::new(&config.state_root, &job);
    let path = layout.metadata();
    let mut metadata = descriptor.metadata().clone();
    metadata.job_id = Some(job.clone());

    layout
        .ensure()
        .and_then(|_| {
            let contents = serde_json::to_vec_pretty(&metadata)?;
            publish_replace(&path, &contents)
        })
        .map_err(|source| SubmitError::Write {
            path: path.clone(),
            source,
        })?;

    info!(
        job = %job,
        array = %descriptor.array_spec(),
        "Submitted, job state is collected in {:?}",
        layout.root()
    );
    // bare id on stdout for scripting around the submission
    writeln!(out, "{job}").map_err(|source| SubmitError::Write {
        path: PathBuf::from("<stdout>"),
        source,
    })?;

    Ok(SubmitOutcome::Submitted {
        job,
        metadata: path,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{enumerate::testing::StaticSource, executors::EvalMode};
    use std::cell::RefCell;

    /// Scheduler recording every script it was asked to submit
    struct FakeScheduler {
        scripts: RefCell<Vec<String>>,
    }

    impl FakeScheduler {
        fn new() -> Self {
            Self {
                scripts: RefCell::new(Vec::new()),
            }
        }
    }

    impl Scheduler for FakeScheduler {
        fn submit(&self, script: &str) -> Result<JobId, SchedulerError> {
            self.scripts.borrow_mut().push(script.to_string());

            Ok("1001".parse().unwrap())
        }
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        config: RunnerConfig,
        request: SubmitRequest,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let llm_config = dir.path().join("llm.toml");
            fs::write(&llm_config, "[llm]\n").unwrap();

            let config: RunnerConfig = serde_yaml::from_str(&format!(
                "state_root: {}\nenumerator: {{exec: enumerate}}\nworkload: {{exec: workload}}\nharness: {{exec: harness}}\n",
                dir.path().join("state").display()
            ))
            .unwrap();

            let request = SubmitRequest {
                bundle: TaskBundle {
                    llm_config,
                    agent: "CodeActAgent".to_string(),
                    dataset: "lite".to_string(),
                    split: "test".to_string(),
                    max_iterations: 100,
                    mode: EvalMode::Swt,
                    runtime: "docker".to_string(),
                },
                end_to_end: true,
                eval_env: "local".to_string(),
                resources: Resources {
                    partition: None,
                    cpus: 4,
                    mem: "16G".to_string(),
                    time: "04:00:00".to_string(),
                    gpus: Some("1".to_string()),
                },
                max_concurrent: 2,
                array_size: None,
                offline_guess: None,
                dry_run: false,
                slot_command: vec![
                    "/opt/arrayeval".to_string(),
                    "--config".to_string(),
                    "/opt/runner.yaml".to_string(),
                    "slot".to_string(),
                ],
            };

            Self {
                _dir: dir,
                config,
                request,
            }
        }

        fn submit(
            &self,
            source: &StaticSource,
            scheduler: &FakeScheduler,
        ) -> (Result<SubmitOutcome, SubmitError>, String) {
            let mut out = Vec::new();
            let result = submit(&self.config, &self.request, source, scheduler, &mut out);

            (result, String::from_utf8(out).unwrap())
        }
    }

    #[test]
    fn detected_count_sizes_the_array() {
        let fixture = Fixture::new();
        let scheduler = FakeScheduler::new();

        let (result, out) =
            fixture.submit(&StaticSource::new(&["a", "b", "c", "d", "e"]), &scheduler);

        let SubmitOutcome::Submitted { job, metadata } = result.unwrap() else {
            panic!("expected a submission");
        };
        assert_eq!(job.as_str(), "1001");
        assert_eq!(out, "1001\n");

        let scripts = scheduler.scripts.borrow();
        assert_eq!(scripts.len(), 1);
        assert!(scripts[0].contains("#SBATCH --array=0-4%2\n"));
        assert!(scripts[0].contains("#SBATCH --gres=gpu:1\n"));
        assert!(scripts[0].contains(
            "exec /opt/arrayeval --config /opt/runner.yaml slot"
        ));
        assert!(scripts[0].contains("--mode swt --runtime docker --end-to-end --eval-env local\n"));

        let metadata: JobMetadata =
            serde_json::from_slice(&fs::read(metadata).unwrap()).unwrap();
        assert_eq!(metadata.job_id.unwrap().as_str(), "1001");
        assert_eq!(metadata.array_size, 5);
        assert_eq!(metadata.item_count_source, ItemCountSource::Detected);
        assert_eq!(metadata.eval_env.as_deref(), Some("local"));
    }

    #[test]
    fn failed_detection_never_reaches_the_scheduler() {
        let fixture = Fixture::new();
        let scheduler = FakeScheduler::new();

        let (result, _) = fixture.submit(&StaticSource::failing(), &scheduler);

        assert!(matches!(result, Err(SubmitError::Detection(_))));
        assert!(scheduler.scripts.borrow().is_empty());
    }

    #[test]
    fn guessed_counts_are_flagged() {
        let mut fixture = Fixture::new();
        fixture.request.offline_guess = Some(300);
        let scheduler = FakeScheduler::new();

        let (result, _) = fixture.submit(&StaticSource::failing(), &scheduler);

        assert!(result.is_ok());
        let scripts = scheduler.scripts.borrow();
        assert!(scripts[0].contains("#SBATCH --array=0-299%2\n"));
        assert!(scripts[0].contains("\"item_count_source\":\"guessed\""));
    }

    #[test]
    fn explicit_size_skips_detection() {
        let mut fixture = Fixture::new();
        fixture.request.array_size = Some(7);
        let source = StaticSource::new(&["a"]);
        let scheduler = FakeScheduler::new();

        let (result, _) = fixture.submit(&source, &scheduler);

        assert!(result.is_ok());
        assert_eq!(source.calls.get(), 0);
        assert!(scheduler.scripts.borrow()[0].contains("#SBATCH --array=0-6%2\n"));
    }

    #[test]
    fn dry_run_prints_without_submitting() {
        let mut fixture = Fixture::new();
        fixture.request.dry_run = true;
        fixture.request.array_size = Some(1);
        let scheduler = FakeScheduler::new();

        let (result, out) = fixture.submit(&StaticSource::failing(), &scheduler);

        let SubmitOutcome::DryRun { script, metadata } = result.unwrap() else {
            panic!("expected a dry run");
        };
        assert!(script.contains("#SBATCH --array=0-0\n"));
        assert!(out.starts_with(&script));
        assert!(out.contains("\"item_count_source\": \"override\""));
        assert_eq!(metadata.job_id, None);
        assert!(scheduler.scripts.borrow().is_empty());
        assert!(!fixture.config.state_root.exists());
    }

    #[test]
    fn missing_llm_config_is_rejected() {
        let mut fixture = Fixture::new();
        fixture.request.bundle.llm_config = PathBuf::from("/nonexistent/llm.toml");
        let scheduler = FakeScheduler::new();

        let (result, _) = fixture.submit(&StaticSource::new(&["a"]), &scheduler);

        assert!(matches!(result, Err(SubmitError::MissingLlmConfig(_))));
        assert!(scheduler.scripts.borrow().is_empty());
    }

    #[test]
    fn unknown_eval_env_is_rejected_before_detection() {
        let mut fixture = Fixture::new();
        fixture.request.eval_env = "elsewhere".to_string();
        let source = StaticSource::new(&["a"]);

        let (result, _) = fixture.submit(&source, &FakeScheduler::new());

        assert!(matches!(
            result,
            Err(SubmitError::Config(ConfigErrors::UnknownEnvironment(_)))
        ));
        assert_eq!(source.calls.get(), 0);
    }
}
