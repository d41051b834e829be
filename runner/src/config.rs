use crate::distributed::poll::PollBudget;
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    fs::File,
    io::Error,
    os::unix::fs::MetadataExt,
    path::{Path, PathBuf},
};
use thiserror::Error;
use tracing::{error, warn};

// check if a file is executable
pub fn check_executable(path: &Path) -> Result<bool, ConfigErrors> {
    if !path.is_file() {
        Err(ConfigErrors::FileNotFound(path.to_path_buf()))
    } else {
        match File::open(path).map(|file| file.metadata()) {
            Ok(Ok(metadata)) => Ok((metadata.mode() & 0o111) != 0),
            Ok(Err(e)) | Err(e) => Err(ConfigErrors::MetadataNotFound(e)),
        }
    }
}

#[derive(Error, Debug)]
pub enum ConfigErrors {
    #[error("File not found: {0:?}")]
    FileNotFound(PathBuf),
    #[error("Metadata not found")]
    MetadataNotFound(#[from] Error),
    #[error("Config could not be parsed")]
    InvalidConfig(#[from] serde_yaml::Error),
    #[error("Evaluation environment {0:?} is not defined in harness.environments")]
    UnknownEnvironment(String),
    #[error("Config failed {0} preflight check(s)")]
    Preflight(usize),
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct RunnerConfig {
    /// shared directory visible to every node, all job state lives below it
    #[serde(default = "default_state_root")]
    pub state_root: PathBuf,
    pub enumerator: EnumeratorConfig,
    pub workload: WorkloadConfig,
    #[serde(default)]
    pub isolation: IsolationConfig,
    pub harness: HarnessConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub polling: PollingConfig,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct EnumeratorConfig {
    // program printing the instance ids of a dataset split as a JSON array
    pub exec: PathBuf,
    #[serde(default)]
    pub params: Vec<String>,
    /// optional JSON array of ids, everything else is filtered out
    pub allow_list: Option<PathBuf>,
    #[serde(default = "default_enumerator_timeout")]
    pub timeout: u64,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct WorkloadConfig {
    // the per-instance inference program
    pub exec: PathBuf,
    #[serde(default)]
    pub params: Vec<String>,
    /// wall clock limit for a single instance in seconds
    #[serde(default = "default_workload_timeout")]
    pub timeout: u64,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum IsolationRuntime {
    /// run the workload directly on the node
    #[default]
    None,
    Docker,
    Apptainer,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct Substitution {
    pub from: String,
    pub to: String,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct IsolationConfig {
    #[serde(default)]
    pub runtime: IsolationRuntime,
    /// overrides the runtime binary, e.g. `podman` for docker
    pub binary: Option<PathBuf>,
    /// image per instance, `{instance_id}` is replaced by the substituted instance id
    #[serde(default = "default_image_template")]
    pub image_template: String,
    #[serde(default = "default_substitutions")]
    pub substitutions: Vec<Substitution>,
    /// additional host paths made visible inside the environment, the state root always is
    #[serde(default)]
    pub mounts: Vec<PathBuf>,
    #[serde(default)]
    pub extra_args: Vec<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct HarnessConfig {
    // the scoring harness
    pub exec: PathBuf,
    #[serde(default)]
    pub params: Vec<String>,
    /// directory the harness writes its logs and report to, defaults to the job directory
    pub working_dir: Option<PathBuf>,
    #[serde(default = "default_model_name")]
    pub model_name: String,
    /// JSON pointer of the patch inside a result record
    #[serde(default = "default_patch_pointer")]
    pub patch_pointer: String,
    /// per instance timeout handed to the harness in seconds
    #[serde(default = "default_harness_instance_timeout")]
    pub instance_timeout: u64,
    #[serde(default = "default_cache_level")]
    pub cache_level: String,
    #[serde(default = "default_max_workers")]
    pub max_workers: u32,
    /// limit for the whole harness run in seconds
    #[serde(default = "default_harness_timeout")]
    pub timeout: u64,
    /// additional harness arguments per evaluation environment
    #[serde(default = "default_environments")]
    pub environments: BTreeMap<String, Vec<String>>,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct SchedulerConfig {
    #[serde(default = "default_sbatch")]
    pub sbatch: PathBuf,
    #[serde(default = "default_job_name")]
    pub job_name: String,
    pub partition: Option<String>,
    #[serde(default = "default_cpus")]
    pub cpus: u32,
    #[serde(default = "default_mem")]
    pub mem: String,
    #[serde(default = "default_time")]
    pub time: String,
    pub gpus: Option<String>,
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: u32,
    /// directory for per-slot stdout/stderr, defaults to `{state_root}/logs`
    pub logs_dir: Option<PathBuf>,
    /// commands run at the top of the job script, e.g. module loads
    #[serde(default)]
    pub setup: Vec<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct PollingConfig {
    #[serde(default = "default_instance_list_budget")]
    pub instance_list: PollBudget,
    #[serde(default = "default_barrier_budget")]
    pub barrier: PollBudget,
}

impl Default for IsolationConfig {
    fn default() -> Self {
        Self {
            runtime: IsolationRuntime::default(),
            binary: None,
            image_template: default_image_template(),
            substitutions: default_substitutions(),
            mounts: Vec::new(),
            extra_args: Vec::new(),
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            sbatch: default_sbatch(),
            job_name: default_job_name(),
            partition: None,
            cpus: default_cpus(),
            mem: default_mem(),
            time: default_time(),
            gpus: None,
            max_concurrent: default_max_concurrent(),
            logs_dir: None,
            setup: Vec::new(),
        }
    }
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            instance_list: default_instance_list_budget(),
            barrier: default_barrier_budget(),
        }
    }
}

impl IsolationConfig {
    /// image for a single instance, the image is a function of the instance id only
    pub fn image_for(&self, instance_id: &str) -> String {
        let id = self
            .substitutions
            .iter()
            .fold(instance_id.to_string(), |id, substitution| {
                id.replace(&substitution.from, &substitution.to)
            });

        self.image_template
            .replace("{instance_id}", &id)
            .to_lowercase()
    }

    pub fn binary(&self) -> Option<PathBuf> {
        match self.runtime {
            IsolationRuntime::None => None,
            IsolationRuntime::Docker => {
                Some(self.binary.clone().unwrap_or_else(|| PathBuf::from("docker")))
            }
            IsolationRuntime::Apptainer => Some(
                self.binary
                    .clone()
                    .unwrap_or_else(|| PathBuf::from("apptainer")),
            ),
        }
    }
}

impl HarnessConfig {
    pub fn environment_args(&self, environment: &str) -> Result<&[String], ConfigErrors> {
        self.environments
            .get(environment)
            .map(Vec::as_slice)
            .ok_or_else(|| ConfigErrors::UnknownEnvironment(environment.to_string()))
    }
}

impl RunnerConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigErrors> {
        if !path.is_file() {
            error!("Config file {} does not exist", path.to_string_lossy());

            return Err(ConfigErrors::FileNotFound(path.to_path_buf()));
        }

        let file = File::open(path)?;

        Ok(serde_yaml::from_reader(file)?)
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.scheduler
            .logs_dir
            .clone()
            .unwrap_or_else(|| self.state_root.join("logs"))
    }

    /// Validate everything that can be checked before a job is created.
    /// All problems are reported at once instead of piece-by-piece to make debugging easier.
    pub fn preflight_checks(&self) -> Result<(), ConfigErrors> {
        let mut errors = 0;

        for (name, exec) in [
            ("enumerator", &self.enumerator.exec),
            ("workload", &self.workload.exec),
            ("harness", &self.harness.exec),
        ] {
            // bare program names are resolved through PATH at spawn time
            if exec.components().count() == 1 && exec.is_relative() {
                continue;
            }

            match check_executable(exec) {
                Ok(true) => {}
                Ok(false) => {
                    error!("{name}.exec ({}) is not executable", exec.to_string_lossy());
                    errors += 1;
                }
                Err(e) => {
                    error!(
                        "Failed to find {name}.exec. Either not a file or not found at {}: {e}",
                        exec.to_string_lossy()
                    );
                    errors += 1;
                }
            }
        }

        if let Some(allow_list) = &self.enumerator.allow_list {
            if !allow_list.is_file() {
                error!(
                    "enumerator.allow_list {} does not exist",
                    allow_list.to_string_lossy()
                );
                errors += 1;
            }
        }

        if !self.isolation.image_template.contains("{instance_id}")
            && self.isolation.runtime != IsolationRuntime::None
        {
            warn!("isolation.image_template has no {{instance_id}} placeholder, every instance will share one image");
        }

        for (name, budget) in [
            ("instance_list", &self.polling.instance_list),
            ("barrier", &self.polling.barrier),
        ] {
            if budget.interval == 0 {
                error!("polling.{name}.interval cannot be 0");
                errors += 1;
            }
            if budget.ceiling < budget.interval {
                error!("polling.{name}.ceiling must be at least one interval");
                errors += 1;
            }
            if !budget.backoff.is_finite() || budget.backoff < 1.0 {
                error!("polling.{name}.backoff must be a finite factor >= 1.0");
                errors += 1;
            }
        }

        if self.scheduler.max_concurrent == 0 {
            error!("scheduler.max_concurrent cannot be 0");
            errors += 1;
        }

        if self.workload.timeout == 0 || self.harness.timeout == 0 {
            error!("workload.timeout and harness.timeout cannot be 0");
            errors += 1;
        }

        if !self.state_root.is_absolute() {
            warn!(
                "state_root {} is relative, slots on other nodes resolve it against their own working directory",
                self.state_root.to_string_lossy()
            );
        }

        if errors == 0 {
            Ok(())
        } else {
            Err(ConfigErrors::Preflight(errors))
        }
    }
}

fn default_state_root() -> PathBuf {
    PathBuf::from("arrayeval_state")
}

fn default_enumerator_timeout() -> u64 {
    600
}

fn default_workload_timeout() -> u64 {
    4 * 60 * 60
}

fn default_image_template() -> String {
    "docker.io/swebench/sweb.eval.x86_64.{instance_id}:latest".to_string()
}

fn default_substitutions() -> Vec<Substitution> {
    vec![Substitution {
        from: "__".to_string(),
        to: "_1776_".to_string(),
    }]
}

fn default_model_name() -> String {
    "arrayeval".to_string()
}

fn default_patch_pointer() -> String {
    "/test_result/git_patch".to_string()
}

fn default_harness_instance_timeout() -> u64 {
    1800
}

fn default_cache_level() -> String {
    "instance".to_string()
}

fn default_max_workers() -> u32 {
    4
}

fn default_harness_timeout() -> u64 {
    12 * 60 * 60
}

fn default_environments() -> BTreeMap<String, Vec<String>> {
    BTreeMap::from([("local".to_string(), Vec::new())])
}

fn default_sbatch() -> PathBuf {
    PathBuf::from("sbatch")
}

fn default_job_name() -> String {
    "arrayeval".to_string()
}

fn default_cpus() -> u32 {
    4
}

fn default_mem() -> String {
    "16G".to_string()
}

fn default_time() -> String {
    "04:00:00".to_string()
}

fn default_max_concurrent() -> u32 {
    32
}

fn default_instance_list_budget() -> PollBudget {
    PollBudget::fixed(5, 5 * 60)
}

fn default_barrier_budget() -> PollBudget {
    PollBudget::fixed(30, 60 * 60)
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = "
enumerator:
  exec: list-instances
workload:
  exec: run-instance
harness:
  exec: run-harness
";

    #[test]
    fn minimal_config_uses_defaults() {
        let config: RunnerConfig = serde_yaml::from_str(MINIMAL).unwrap();

        assert_eq!(config.polling.instance_list, PollBudget::fixed(5, 300));
        assert_eq!(config.polling.barrier, PollBudget::fixed(30, 3600));
        assert_eq!(config.isolation.runtime, IsolationRuntime::None);
        assert_eq!(config.scheduler.max_concurrent, 32);
        assert!(config.harness.environment_args("local").unwrap().is_empty());
        assert!(config.preflight_checks().is_ok());
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let result = serde_yaml::from_str::<RunnerConfig>(&format!("{MINIMAL}color: blue\n"));

        assert!(result.is_err());
    }

    #[test]
    fn image_depends_on_the_instance() {
        let isolation = IsolationConfig::default();

        assert_eq!(
            isolation.image_for("django__django-11099"),
            "docker.io/swebench/sweb.eval.x86_64.django_1776_django-11099:latest"
        );
        assert_ne!(
            isolation.image_for("astropy__astropy-12907"),
            isolation.image_for("django__django-11099")
        );
    }

    #[test]
    fn unknown_environment_is_an_error() {
        let config: RunnerConfig = serde_yaml::from_str(MINIMAL).unwrap();

        assert!(matches!(
            config.harness.environment_args("modal"),
            Err(ConfigErrors::UnknownEnvironment(_))
        ));
    }

    #[test]
    fn preflight_collects_every_problem() {
        let mut config: RunnerConfig = serde_yaml::from_str(MINIMAL).unwrap();
        config.workload.exec = PathBuf::from("/definitely/not/here");
        config.polling.barrier.interval = 0;
        config.scheduler.max_concurrent = 0;

        assert!(matches!(
            config.preflight_checks(),
            Err(ConfigErrors::Preflight(3))
        ));
    }

    #[test]
    fn non_executable_files_fail_preflight() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("harness.sh");
        std::fs::write(&script, "#!/bin/sh\n").unwrap();

        assert!(!check_executable(&script).unwrap());
        assert!(matches!(
            check_executable(&dir.path().join("missing")),
            Err(ConfigErrors::FileNotFound(_))
        ));
    }
}
