pub mod isolated;
pub mod slurm;

use crate::distributed::poll::{Cancellation, CANCELLATION_CHECK};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::{
    fmt, io,
    path::PathBuf,
    process::{Child, ExitStatus},
    time::{Duration, Instant},
};
use tracing::{debug, warn};
use wait_timeout::ChildExt;

/// Evaluation flavour handed through to the workload
#[derive(ValueEnum, Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum EvalMode {
    #[default]
    Swe,
    Swt,
    SwtCi,
}

impl fmt::Display for EvalMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Swe => "swe",
            Self::Swt => "swt",
            Self::SwtCi => "swt-ci",
        })
    }
}

/// Everything a slot needs to run its instance besides the instance itself
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskBundle {
    pub llm_config: PathBuf,
    pub agent: String,
    pub dataset: String,
    pub split: String,
    pub max_iterations: u32,
    pub mode: EvalMode,
    /// sandbox runtime used by the workload itself, e.g. `docker` or `local`
    pub runtime: String,
}

/// Wait for `child` for at most `timeout`, killing it once the limit is exceeded.
/// `None` means the child was killed.
pub fn wait_with_timeout(child: &mut Child, timeout: Duration) -> io::Result<Option<ExitStatus>> {
    match child.wait_timeout(timeout)? {
        Some(status) => {
            debug!(pid = child.id(), %status, "Child exited");

            Ok(Some(status))
        }
        None => {
            warn!(pid = child.id(), ?timeout, "Child ran into timeout, killing it");
            child.kill()?;
            child.wait()?;

            Ok(None)
        }
    }
}

/// How a child under [`wait_cancellable`] ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Waited {
    Exited(ExitStatus),
    /// killed after running into the timeout
    TimedOut,
    /// killed because the process is shutting down
    Cancelled,
}

/// Like [`wait_with_timeout`], but also kills the child as soon as `cancellation` is set.
pub fn wait_cancellable(
    child: &mut Child,
    timeout: Duration,
    cancellation: &Cancellation,
) -> io::Result<Waited> {
    let start = Instant::now();

    loop {
        let remaining = timeout.saturating_sub(start.elapsed());

        if cancellation.is_cancelled() {
            warn!(pid = child.id(), "Cancelled, killing child");
            child.kill()?;
            child.wait()?;

            return Ok(Waited::Cancelled);
        }

        if remaining.is_zero() {
            return Ok(match wait_with_timeout(child, Duration::ZERO)? {
                Some(status) => Waited::Exited(status),
                None => Waited::TimedOut,
            });
        }

        if let Some(status) = child.wait_timeout(remaining.min(CANCELLATION_CHECK))? {
            debug!(pid = child.id(), %status, "Child exited");

            return Ok(Waited::Exited(status));
        }
    }
}
