use super::EvaluationError;
use crate::{config::HarnessConfig, distributed::util::is_cross_device, executors::wait_with_timeout};
use ignore::WalkBuilder;
use std::{
    ffi::OsString,
    fs, io,
    path::{Path, PathBuf},
    process::{Command, Stdio},
    time::Duration,
};
use tracing::{debug, info, instrument, warn};

/// One invocation of the scoring harness
#[derive(Debug, Clone)]
pub struct HarnessRun<'a> {
    pub config: &'a HarnessConfig,
    pub dataset: &'a str,
    pub split: &'a str,
    pub predictions: &'a Path,
    pub run_id: &'a str,
    /// additional arguments of the selected evaluation environment
    pub environment_args: &'a [String],
    pub working_dir: &'a Path,
}

impl<'a> HarnessRun<'a> {
    pub fn args(&self) -> Vec<OsString> {
        let mut args: Vec<OsString> = self.config.params.iter().map(OsString::from).collect();

        for (flag, value) in [
            ("--dataset_name", OsString::from(self.dataset)),
            ("--split", OsString::from(self.split)),
            ("--predictions_path", self.predictions.as_os_str().to_owned()),
            ("--timeout", OsString::from(self.config.instance_timeout.to_string())),
            ("--cache_level", OsString::from(&self.config.cache_level)),
            ("--max_workers", OsString::from(self.config.max_workers.to_string())),
            ("--run_id", OsString::from(self.run_id)),
        ] {
            args.push(OsString::from(flag));
            args.push(value);
        }
        args.extend(self.environment_args.iter().map(OsString::from));

        args
    }

    /// per instance log directory the harness creates for this run
    pub fn log_dir(&self) -> PathBuf {
        self.working_dir
            .join("logs")
            .join("run_evaluation")
            .join(self.run_id)
    }

    /// summary report the harness writes, the model name has its slashes replaced
    pub fn report(&self) -> PathBuf {
        self.working_dir.join(format!(
            "{}.{}.json",
            self.config.model_name.replace('/', "__"),
            self.run_id
        ))
    }

    #[instrument(skip_all, fields(run_id = self.run_id), level = "info")]
    pub fn run(&self) -> Result<(), EvaluationError> {
        let timeout = Duration::from_secs(self.config.timeout);
        let mut command = Command::new(&self.config.exec);
        command
            .args(self.args())
            .current_dir(self.working_dir)
            .stdin(Stdio::null());
        debug!(command = ?command, "Starting harness");

        let mut child = command.spawn().map_err(EvaluationError::Spawn)?;
        let status = wait_with_timeout(&mut child, timeout)
            .map_err(EvaluationError::Spawn)?
            .ok_or(EvaluationError::HarnessTimeout(timeout))?;

        if !status.success() {
            return Err(EvaluationError::HarnessFailed(status));
        }
        info!("Harness finished");

        Ok(())
    }
}

/// Move `from` to `to`, copying and removing the source when both are on different devices
pub fn relocate(from: &Path, to: &Path) -> io::Result<()> {
    match fs::rename(from, to) {
        Err(error) if is_cross_device(&error) => {
            debug!(from = ?from, to = ?to, "Rename crosses devices, copying instead");

            if from.is_dir() {
                copy_tree(from, to)?;
                fs::remove_dir_all(from)
            } else {
                fs::copy(from, to)?;
                fs::remove_file(from)
            }
        }
        result => result,
    }
}

fn copy_tree(from: &Path, to: &Path) -> io::Result<()> {
    for entry in WalkBuilder::new(from).standard_filters(false).build() {
        let entry = entry.map_err(|error| io::Error::new(io::ErrorKind::Other, error))?;
        let relative = entry
            .path()
            .strip_prefix(from)
            .map_err(|error| io::Error::new(io::ErrorKind::Other, error))?;
        let target = to.join(relative);

        match entry.file_type() {
            Some(kind) if kind.is_dir() => fs::create_dir_all(&target)?,
            Some(kind) if kind.is_file() => {
                fs::copy(entry.path(), &target)?;
            }
            _ => warn!(path = ?entry.path(), "Skipping special file during copy"),
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> HarnessConfig {
        serde_yaml::from_str("exec: harness\nparams: [-m, swebench.run]\nmodel_name: org/model\n")
            .unwrap()
    }

    #[test]
    fn harness_arguments() {
        let config = config();
        let extra = vec!["--namespace".to_string(), "remote".to_string()];
        let run = HarnessRun {
            config: &config,
            dataset: "lite",
            split: "test",
            predictions: Path::new("/shared/job_1/output.swebench.jsonl"),
            run_id: "20240101_120000",
            environment_args: &extra,
            working_dir: Path::new("/shared/job_1"),
        };

        assert_eq!(
            run.args(),
            [
                "-m",
                "swebench.run",
                "--dataset_name",
                "lite",
                "--split",
                "test",
                "--predictions_path",
                "/shared/job_1/output.swebench.jsonl",
                "--timeout",
                "1800",
                "--cache_level",
                "instance",
                "--max_workers",
                "4",
                "--run_id",
                "20240101_120000",
                "--namespace",
                "remote",
            ]
            .map(OsString::from)
        );
        assert_eq!(
            run.report(),
            Path::new("/shared/job_1/org__model.20240101_120000.json")
        );
        assert_eq!(
            run.log_dir(),
            Path::new("/shared/job_1/logs/run_evaluation/20240101_120000")
        );
    }

    #[test]
    fn copying_a_tree() {
        let dir = tempfile::tempdir().unwrap();
        let from = dir.path().join("from");
        fs::create_dir_all(from.join("a/b")).unwrap();
        fs::write(from.join("a/b/log.txt"), "log").unwrap();
        fs::write(from.join(".hidden"), "x").unwrap();

        let to = dir.path().join("to");
        copy_tree(&from, &to).unwrap();

        assert_eq!(fs::read_to_string(to.join("a/b/log.txt")).unwrap(), "log");
        assert!(to.join(".hidden").is_file());
    }

    #[test]
    fn relocating_on_one_device() {
        let dir = tempfile::tempdir().unwrap();
        let from = dir.path().join("report.tmp");
        fs::write(&from, "{}").unwrap();

        relocate(&from, &dir.path().join("report.json")).unwrap();

        assert!(!from.exists());
        assert!(dir.path().join("report.json").is_file());
    }
}
