pub mod barrier;
pub mod fs;
pub mod poll;
pub mod util;


/*
 * Coordinator-less handling of a job array over a shared file system:
 * 1. Roles are fixed by ordinal: ordinal 0 publishes the instance list, the last ordinal runs
 *    the completion barrier and everything after it
 * 2. The instance list is published once with an exclusive link, everybody else only reads it
 * 3. Completion of a slot is signalled by the existence of its result artifact
 * 4. Waiting on either of the above is bounded polling, see `poll::await_predicate`
 */

use serde::{Deserialize, Serialize};
use std::{env, fmt, str::FromStr};
use thiserror::Error;

pub const ENV_ARRAY_JOB_ID: &str = "SLURM_ARRAY_JOB_ID";
pub const ENV_ARRAY_TASK_ID: &str = "SLURM_ARRAY_TASK_ID";
pub const ENV_ARRAY_TASK_MAX: &str = "SLURM_ARRAY_TASK_MAX";

#[derive(Error, Debug, PartialEq, Eq)]
pub enum SlotError {
    #[error("Environment variable {0} is not set, is this running inside a job array?")]
    MissingVariable(&'static str),
    #[error("Environment variable {name} is not a valid number: {value}")]
    InvalidNumber { name: &'static str, value: String },
    #[error("Job id {0:?} is not usable as a path component")]
    InvalidJobId(String),
    #[error("Ordinal {ordinal} is outside of an array of size {array_size}")]
    OrdinalOutOfRange { ordinal: u32, array_size: u32 },
}

/// Scheduler assigned identifier shared by all slots of an array, the key for all shared state
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct JobId(String);

impl JobId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for JobId {
    type Err = SlotError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();

        if trimmed.is_empty()
            || trimmed == "."
            || trimmed == ".."
            || trimmed.contains(&['/', '\\', '\0'][..])
        {
            Err(SlotError::InvalidJobId(value.to_string()))
        } else {
            Ok(Self(trimmed.to_string()))
        }
    }
}

impl TryFrom<String> for JobId {
    type Error = SlotError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<JobId> for String {
    fn from(value: JobId) -> Self {
        value.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One member of a job array
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Slot {
    pub job: JobId,
    pub ordinal: u32,
    pub array_size: u32,
}

impl Slot {
    pub fn new(job: JobId, ordinal: u32, array_size: u32) -> Result<Self, SlotError> {
        if ordinal >= array_size {
            return Err(SlotError::OrdinalOutOfRange {
                ordinal,
                array_size,
            });
        }

        Ok(Self {
            job,
            ordinal,
            array_size,
        })
    }

    /// Resolve the slot identity from the variables the scheduler exports to every array task.
    /// Arrays are always submitted as `0-N`, so the size is the maximum task id plus one.
    pub fn from_env() -> Result<Self, SlotError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, SlotError>
    where
        F: Fn(&'static str) -> Option<String>,
    {
        let job = lookup(ENV_ARRAY_JOB_ID)
            .ok_or(SlotError::MissingVariable(ENV_ARRAY_JOB_ID))?
            .parse::<JobId>()?;
        let ordinal = read_number(&lookup, ENV_ARRAY_TASK_ID)?;
        let max = read_number(&lookup, ENV_ARRAY_TASK_MAX)?;

        Self::new(job, ordinal, max.saturating_add(1))
    }

    /// ordinal 0 performs the one-time setup
    pub fn is_setup_leader(&self) -> bool {
        self.ordinal == 0
    }

    /// the last ordinal performs the one-time teardown
    pub fn is_barrier_runner(&self) -> bool {
        self.ordinal + 1 == self.array_size
    }
}

fn read_number<F>(lookup: &F, name: &'static str) -> Result<u32, SlotError>
where
    F: Fn(&'static str) -> Option<String>,
{
    let value = lookup(name).ok_or(SlotError::MissingVariable(name))?;

    value
        .trim()
        .parse()
        .map_err(|_| SlotError::InvalidNumber { name, value })
}
