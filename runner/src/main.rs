use arrayeval_runner::{
    collector::{AggregateError, Collector},
    config::{ConfigErrors, RunnerConfig},
    distributed::{
        fs::JobLayout,
        poll::{Cancellation, PollError, SystemClock},
        SlotError,
    },
    enumerate::CommandSource,
    evaluation::{self, EvaluationError, EvaluationRequest},
    executors::{
        slurm::{JobMetadata, Resources, Sbatch},
        EvalMode, TaskBundle,
    },
    slot::{run_slot, SlotFailure, SlotRun},
    submit::{submit, SubmitError, SubmitRequest},
    JobId, Slot,
};
use chrono::Utc;
use clap::{Args, Parser, Subcommand};
use std::{env, error::Error as _, fs, io, path::PathBuf, process::ExitCode};
use thiserror::Error;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about = "Run dataset evaluations as Slurm job arrays")]
struct Cli {
    /// runner configuration
    #[arg(long, short, env = "ARRAYEVAL_CONFIG", default_value = "runner.yaml")]
    config: PathBuf,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Debug, Clone)]
struct TaskArgs {
    llm_config: PathBuf,
    agent: String,
    dataset: String,
    split: String,
    #[arg(long, default_value_t = 100)]
    max_iterations: u32,
    #[arg(long, value_enum, default_value_t = EvalMode::Swe)]
    mode: EvalMode,
    /// sandbox runtime of the workload
    #[arg(long, default_value = "docker")]
    runtime: String,
    /// aggregate and evaluate once every slot finished
    #[arg(long)]
    end_to_end: bool,
    /// harness environment used for the evaluation
    #[arg(long, default_value = "local")]
    eval_env: String,
}

impl TaskArgs {
    fn bundle(&self) -> TaskBundle {
        TaskBundle {
            // slots may start in another working directory
            llm_config: fs::canonicalize(&self.llm_config)
                .unwrap_or_else(|_| self.llm_config.clone()),
            agent: self.agent.clone(),
            dataset: self.dataset.clone(),
            split: self.split.clone(),
            max_iterations: self.max_iterations,
            mode: self.mode,
            runtime: self.runtime.clone(),
        }
    }
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Submit an evaluation as a job array
    Submit {
        #[command(flatten)]
        task: TaskArgs,
        #[arg(long)]
        partition: Option<String>,
        #[arg(long)]
        cpus: Option<u32>,
        #[arg(long)]
        mem: Option<String>,
        #[arg(long)]
        time: Option<String>,
        #[arg(long)]
        gpus: Option<String>,
        /// number of instances, skips detection
        #[arg(long)]
        array_size: Option<u32>,
        #[arg(long)]
        max_concurrent: Option<u32>,
        /// print the job script instead of submitting it
        #[arg(long)]
        dry_run: bool,
        /// instance count to assume if detection fails, for diagnostic runs only
        #[arg(long, value_name = "COUNT")]
        offline_guess: Option<u32>,
    },
    /// Run a single array slot, started by the job script
    Slot {
        #[command(flatten)]
        task: TaskArgs,
    },
    /// Aggregate the results of a job, or of every job under the state root
    Aggregate {
        #[arg(long)]
        job_id: Option<JobId>,
        /// destination when aggregating every job
        #[arg(long)]
        output_file: Option<PathBuf>,
    },
    /// Evaluate an aggregated job
    Evaluate {
        #[arg(long)]
        job_id: JobId,
        /// defaults to the dataset recorded at submission
        #[arg(long)]
        dataset: Option<String>,
        #[arg(long)]
        split: Option<String>,
        #[arg(long)]
        eval_env: Option<String>,
    },
}

#[derive(Debug, Error)]
enum CliError {
    #[error(transparent)]
    Config(#[from] ConfigErrors),
    #[error("Not running inside a job array")]
    Slot(#[from] SlotError),
    #[error(transparent)]
    SlotFailure(#[from] SlotFailure),
    #[error(transparent)]
    Submit(#[from] SubmitError),
    #[error(transparent)]
    Aggregate(#[from] AggregateError),
    #[error(transparent)]
    Evaluation(#[from] EvaluationError),
    #[error(transparent)]
    Poll(#[from] PollError),
    #[error("Failed to read job metadata {path:?}, pass --dataset and --split")]
    Metadata {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Invalid job metadata")]
    InvalidMetadata(#[from] serde_json::Error),
    #[error("Failed to locate the runner binary")]
    CurrentExe(#[source] io::Error),
}

impl CliError {
    fn exit_code(&self) -> u8 {
        match self {
            Self::Config(_)
            | Self::Submit(SubmitError::Config(_))
            | Self::Evaluation(EvaluationError::Config(_)) => 2,
            _ => 1,
        }
    }
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match run(cli) {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            error!("{e}");
            let mut source = e.source();
            while let Some(cause) = source {
                error!("  caused by: {cause}");
                source = cause.source();
            }

            ExitCode::from(e.exit_code())
        }
    }
}

fn run(cli: Cli) -> Result<u8, CliError> {
    let config = RunnerConfig::load(&cli.config)?;

    match cli.command {
        Commands::Submit {
            task,
            partition,
            cpus,
            mem,
            time,
            gpus,
            array_size,
            max_concurrent,
            dry_run,
            offline_guess,
        } => {
            config.preflight_checks()?;

            let defaults = &config.scheduler;
            let exe = env::current_exe().map_err(CliError::CurrentExe)?;
            let config_path = fs::canonicalize(&cli.config).unwrap_or(cli.config);
            let request = SubmitRequest {
                bundle: task.bundle(),
                end_to_end: task.end_to_end,
                eval_env: task.eval_env.clone(),
                resources: Resources {
                    partition: partition.or_else(|| defaults.partition.clone()),
                    cpus: cpus.unwrap_or(defaults.cpus),
                    mem: mem.unwrap_or_else(|| defaults.mem.clone()),
                    time: time.unwrap_or_else(|| defaults.time.clone()),
                    gpus: gpus.or_else(|| defaults.gpus.clone()),
                },
                max_concurrent: max_concurrent.unwrap_or(defaults.max_concurrent),
                array_size,
                offline_guess,
                dry_run,
                slot_command: vec![
                    exe.to_string_lossy().into_owned(),
                    "--config".to_string(),
                    config_path.to_string_lossy().into_owned(),
                    "slot".to_string(),
                ],
            };

            submit(
                &config,
                &request,
                &CommandSource::new(config.enumerator.clone()),
                &Sbatch::new(defaults.sbatch.clone()),
                &mut io::stdout().lock(),
            )?;

            Ok(0)
        }
        Commands::Slot { task } => {
            config.preflight_checks()?;

            let slot = Slot::from_env()?;
            let bundle = task.bundle();
            let run = SlotRun {
                config: &config,
                bundle: &bundle,
                end_to_end: task.end_to_end,
                eval_env: &task.eval_env,
            };
            let outcome = run_slot(
                &slot,
                &run,
                &CommandSource::new(config.enumerator.clone()),
                &SystemClock::new(),
                &Cancellation::for_process()?,
            )?;

            if let Some(finalization) = &outcome.finalization {
                info!(
                    barrier = ?finalization.barrier.state,
                    records = finalization.aggregate.records,
                    report = ?finalization.evaluation.report,
                    "Job finished"
                );
            }

            Ok(u8::try_from(outcome.exit_code()).unwrap_or(1))
        }
        Commands::Aggregate {
            job_id,
            output_file,
        } => {
            let collector = match job_id {
                Some(job) => {
                    if output_file.is_some() {
                        warn!("--output-file is ignored when aggregating a single job");
                    }

                    Collector::job(JobLayout::new(&config.state_root, &job))
                }
                None => Collector::tree(
                    config.state_root.clone(),
                    output_file.unwrap_or_else(|| config.state_root.join("output.jsonl")),
                ),
            };
            let summary = collector.aggregate()?;
            info!("Wrote {} records to {:?}", summary.records, summary.output);

            Ok(0)
        }
        Commands::Evaluate {
            job_id,
            dataset,
            split,
            eval_env,
        } => {
            let layout = JobLayout::new(&config.state_root, &job_id);
            let (dataset, split, eval_env) = match (dataset, split) {
                (Some(dataset), Some(split)) => (dataset, split, eval_env),
                (dataset, split) => {
                    let path = layout.metadata();
                    let contents = fs::read(&path)
                        .map_err(|source| CliError::Metadata { path, source })?;
                    let metadata: JobMetadata = serde_json::from_slice(&contents)?;

                    (
                        dataset.unwrap_or(metadata.dataset),
                        split.unwrap_or(metadata.split),
                        eval_env.or(metadata.eval_env),
                    )
                }
            };

            let run_id = evaluation::run_id(Utc::now());
            let report = evaluation::evaluate(
                &config.harness,
                &layout,
                EvaluationRequest {
                    dataset: &dataset,
                    split: &split,
                    environment: eval_env.as_deref().unwrap_or("local"),
                    run_id: &run_id,
                },
            )?;
            info!(
                resolved = ?report.resolved,
                total = ?report.total,
                "Report written to {:?}",
                report.report
            );

            Ok(0)
        }
    }
}
