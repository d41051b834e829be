use super::{wait_cancellable, wait_with_timeout, TaskBundle, Waited};
use crate::{
    config::{IsolationConfig, IsolationRuntime, WorkloadConfig},
    distributed::{fs::JobLayout, poll::Cancellation, Slot},
    enumerate::WorkItem,
};
use serde_json::json;
use std::{
    env,
    ffi::OsString,
    fs::OpenOptions,
    io::{self, Write},
    path::{Path, PathBuf},
    process::{Command, ExitStatus, Stdio},
    time::{Duration, Instant},
};
use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};

#[derive(Error, Debug)]
pub enum ExecutorError {
    #[error("Failed to spawn workload for {instance}")]
    Spawn {
        instance: WorkItem,
        #[source]
        source: io::Error,
    },
    #[error("Workload for {instance} exceeded {timeout:?}")]
    Timeout { instance: WorkItem, timeout: Duration },
    #[error("Workload for {instance} was stopped because the slot is shutting down")]
    Cancelled { instance: WorkItem },
    #[error("Workload for {instance} exited with {status} without producing {path:?}")]
    MissingArtifact {
        instance: WorkItem,
        status: String,
        path: PathBuf,
    },
    #[error("Failed to wait for workload")]
    Wait(#[from] io::Error),
}

/// A single work item ready to be run by a slot
#[derive(Debug, Clone, Copy)]
pub struct Invocation<'a> {
    pub slot: &'a Slot,
    pub item: &'a WorkItem,
    pub layout: &'a JobLayout,
    pub bundle: &'a TaskBundle,
}

/// time granted to the container runtime for removing a killed container
const CLEANUP_TIMEOUT: Duration = Duration::from_secs(60);

/// Runs the external workload for one item inside the isolation environment of that item
#[derive(Debug, Clone)]
pub struct TaskExecutor<'a> {
    workload: &'a WorkloadConfig,
    isolation: &'a IsolationConfig,
    state_root: &'a Path,
    eval_note: Option<String>,
}

impl<'a> TaskExecutor<'a> {
    pub fn new(
        workload: &'a WorkloadConfig,
        isolation: &'a IsolationConfig,
        state_root: &'a Path,
    ) -> Self {
        Self {
            workload,
            isolation,
            state_root,
            eval_note: env::var("EVAL_NOTE").ok().filter(|note| !note.is_empty()),
        }
    }

    /// environment handed to the workload
    pub fn environment(&self, invocation: &Invocation) -> Vec<(String, String)> {
        let task_note = format!("slurm-task-{}", invocation.slot.ordinal);
        let eval_note = match &self.eval_note {
            Some(note) => format!("{note}-{task_note}"),
            None => task_note,
        };

        vec![
            ("INSTANCE_ID".to_string(), invocation.item.to_string()),
            ("RUNTIME".to_string(), invocation.bundle.runtime.clone()),
            ("EVAL_NOTE".to_string(), eval_note),
        ]
    }

    /// arguments of the workload itself, identical for every runtime
    pub fn workload_args(&self, invocation: &Invocation) -> Vec<OsString> {
        let bundle = invocation.bundle;
        let mut args: Vec<OsString> = self.workload.params.iter().map(OsString::from).collect();

        for (flag, value) in [
            ("--instance-id", OsString::from(invocation.item.as_str())),
            ("--agent-cls", OsString::from(&bundle.agent)),
            ("--llm-config", bundle.llm_config.clone().into_os_string()),
            (
                "--max-iterations",
                OsString::from(bundle.max_iterations.to_string()),
            ),
            ("--dataset", OsString::from(&bundle.dataset)),
            ("--split", OsString::from(&bundle.split)),
            ("--mode", OsString::from(bundle.mode.to_string())),
            (
                "--output-dir",
                invocation.layout.root().as_os_str().to_owned(),
            ),
            (
                "--task-id",
                OsString::from(invocation.slot.ordinal.to_string()),
            ),
            ("--runtime", OsString::from(&bundle.runtime)),
        ] {
            args.push(OsString::from(flag));
            args.push(value);
        }

        args
    }

    /// host paths made visible inside the isolation environment at the same location
    fn mounts(&self, invocation: &Invocation) -> Vec<PathBuf> {
        let mut mounts = vec![self.state_root.to_path_buf()];
        mounts.extend(self.isolation.mounts.iter().cloned());

        if let Some(parent) = invocation
            .bundle
            .llm_config
            .parent()
            .filter(|parent| parent.is_absolute())
        {
            mounts.push(parent.to_path_buf());
        }

        mounts.sort();
        mounts.dedup();
        mounts
    }

    /// build the full command for an invocation without running it
    pub fn command(&self, invocation: &Invocation) -> Command {
        let environment = self.environment(invocation);
        let workload_args = self.workload_args(invocation);
        let image = self.isolation.image_for(invocation.item.as_str());

        let Some(binary) = self.isolation.binary() else {
            let mut command = Command::new(&self.workload.exec);
            command.args(workload_args).envs(environment);

            return command;
        };

        let mut command = Command::new(binary);

        if self.isolation.runtime == IsolationRuntime::Apptainer {
            command.args(["exec", "--cleanenv"]);

            for mount in self.mounts(invocation) {
                command.arg("--bind").arg(bind(&mount));
            }
            for (key, value) in environment {
                command.arg("--env").arg(format!("{key}={value}"));
            }

            let image = if image.contains("://") {
                image
            } else {
                format!("docker://{image}")
            };

            command.args(&self.isolation.extra_args).arg(image);
        } else {
            command
                .args(["run", "--rm", "--name"])
                .arg(container_name(invocation.slot));

            for mount in self.mounts(invocation) {
                command.arg("-v").arg(bind(&mount));
            }
            for (key, value) in environment {
                command.arg("-e").arg(format!("{key}={value}"));
            }

            command.args(&self.isolation.extra_args).arg(image);
        }

        command.arg(&self.workload.exec).args(workload_args);

        command
    }

    /// Run the workload and check for its result artifact.
    /// The artifact is the only completion signal, the exit status is informational.
    #[instrument(skip_all, fields(instance = %invocation.item), level = "info")]
    pub fn invoke(
        &self,
        invocation: &Invocation,
        cancellation: &Cancellation,
    ) -> Result<PathBuf, ExecutorError> {
        let artifact = invocation.layout.result(invocation.slot.ordinal);

        if artifact.exists() {
            info!(path = ?artifact, "Result artifact already exists, not running the workload again");

            return Ok(artifact);
        }

        let timeout = Duration::from_secs(self.workload.timeout);
        let mut command = self.command(invocation);
        debug!(?command, "Starting workload");

        let start = Instant::now();
        let mut child = command
            .stdin(Stdio::null())
            .spawn()
            .map_err(|source| ExecutorError::Spawn {
                instance: invocation.item.clone(),
                source,
            })?;

        let status = match wait_cancellable(&mut child, timeout, cancellation)? {
            Waited::Exited(status) => status,
            Waited::TimedOut => {
                self.remove_container(invocation);
                self.record_failure(invocation, "timeout", None);

                return Err(ExecutorError::Timeout {
                    instance: invocation.item.clone(),
                    timeout,
                });
            }
            Waited::Cancelled => {
                self.remove_container(invocation);
                self.record_failure(invocation, "cancelled", None);

                return Err(ExecutorError::Cancelled {
                    instance: invocation.item.clone(),
                });
            }
        };

        info!(elapsed = ?start.elapsed(), %status, "Workload finished");

        if artifact.exists() {
            if !status.success() {
                warn!(%status, "Workload failed but produced its result artifact");
            }

            return Ok(artifact);
        }

        error!(%status, path = ?artifact, "Workload did not produce its result artifact");
        self.record_failure(invocation, "missing result artifact", Some(status));

        Err(ExecutorError::MissingArtifact {
            instance: invocation.item.clone(),
            status: status.to_string(),
            path: artifact,
        })
    }

    /// Killing the docker client leaves its container running, remove it by name.
    /// Apptainer and direct workloads die with the killed process.
    fn remove_container(&self, invocation: &Invocation) {
        let Some(binary) = self.isolation.binary() else {
            return;
        };
        if self.isolation.runtime != IsolationRuntime::Docker {
            return;
        }

        let name = container_name(invocation.slot);
        let result = Command::new(binary)
            .args(["rm", "-f"])
            .arg(&name)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .spawn()
            .and_then(|mut child| wait_with_timeout(&mut child, CLEANUP_TIMEOUT));

        match result {
            Ok(Some(status)) if status.success() => info!(container = %name, "Removed container"),
            Ok(Some(status)) => warn!(container = %name, %status, "Failed to remove container"),
            Ok(None) => warn!(container = %name, "Removing the container timed out"),
            Err(error) => error!(container = %name, error = ?error, "Failed to remove container"),
        }
    }

    /// append an error record unless the workload already wrote one itself
    fn record_failure(&self, invocation: &Invocation, reason: &str, status: Option<ExitStatus>) {
        let path = invocation.layout.error_record(invocation.slot.ordinal);

        if path.exists() {
            return;
        }

        let record = json!({
            "instance_id": invocation.item,
            "task_id": invocation.slot.ordinal,
            "error": reason,
            "exit_code": status.and_then(|status| status.code()),
        });

        let result = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .and_then(|mut file| writeln!(file, "{record}"));

        if let Err(error) = result {
            error!(error = ?error, path = ?path, "Failed to write error record");
        }
    }
}

/// deterministic per slot so a killed container can be found again
fn container_name(slot: &Slot) -> String {
    format!("arrayeval-{}-{}", slot.job, slot.ordinal)
}

fn bind(path: &Path) -> OsString {
    let mut bind = path.as_os_str().to_owned();
    bind.push(":");
    bind.push(path.as_os_str());

    bind
}
