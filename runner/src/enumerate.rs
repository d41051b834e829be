use crate::{
    config::EnumeratorConfig,
    distributed::fs::{publish_exclusive, Publication},
    executors::wait_with_timeout,
};
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::{
    collections::HashSet,
    fmt, fs,
    io::{self, Read},
    path::{Path, PathBuf},
    process::{Command, Stdio},
    thread::{self, JoinHandle},
    time::Duration,
};
use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};

#[derive(Debug, Error)]
pub enum EnumerationError {
    #[error("Failed to spawn enumerator {0:?}")]
    Spawn(PathBuf, #[source] io::Error),
    #[error("Enumerator exited with {status}: {stderr}")]
    Failed { status: String, stderr: String },
    #[error("Enumerator did not finish within {0:?}")]
    Timeout(Duration),
    #[error("Instance list is not a JSON array of strings")]
    Malformed(#[from] serde_json::Error),
    #[error("Instance {0} is listed more than once")]
    Duplicate(String),
    #[error("No instances left for dataset {dataset} split {split}")]
    Empty { dataset: String, split: String },
    #[error("Failed to access instance list")]
    Io(#[from] io::Error),
}

/// Identifier of one unit of evaluation work, i.e. one dataset instance
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkItem(String);

impl WorkItem {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WorkItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Ordered, immutable mapping from ordinal to work item
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstanceList {
    items: Vec<WorkItem>,
}

impl InstanceList {
    /// build a list, rejecting duplicate ids since they would run the same instance twice
    pub fn new(items: Vec<WorkItem>) -> Result<Self, EnumerationError> {
        if let Some(duplicate) = items.iter().duplicates().next() {
            return Err(EnumerationError::Duplicate(duplicate.to_string()));
        }

        Ok(Self { items })
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn items(&self) -> &[WorkItem] {
        &self.items
    }

    /// item owned by `ordinal`, `None` if the array has more slots than there are items
    pub fn get(&self, ordinal: u32) -> Option<&WorkItem> {
        usize::try_from(ordinal)
            .ok()
            .and_then(|index| self.items.get(index))
    }

    pub fn parse(bytes: &[u8]) -> Result<Self, EnumerationError> {
        Self::new(serde_json::from_slice(bytes)?)
    }

    pub fn load(path: &Path) -> Result<Self, EnumerationError> {
        Self::parse(&fs::read(path)?)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, EnumerationError> {
        let mut bytes = serde_json::to_vec_pretty(&self.items)?;
        bytes.push(b'\n');

        Ok(bytes)
    }

    /// keep only the allowed ids, in enumeration order
    pub fn retain_allowed(self, allowed: &HashSet<WorkItem>) -> Self {
        Self {
            items: self
                .items
                .into_iter()
                .filter(|item| allowed.contains(item))
                .collect(),
        }
    }
}

/// Anything able to produce the instance list of a dataset split
pub trait InstanceSource {
    fn enumerate(&self, dataset: &str, split: &str) -> Result<InstanceList, EnumerationError>;
}

/// Runs the configured enumerator program, which prints the ids as a JSON array on stdout
#[derive(Debug, Clone)]
pub struct CommandSource {
    config: EnumeratorConfig,
}

impl CommandSource {
    pub fn new(config: EnumeratorConfig) -> Self {
        Self { config }
    }
}

impl InstanceSource for CommandSource {
    #[instrument(skip(self), level = "info")]
    fn enumerate(&self, dataset: &str, split: &str) -> Result<InstanceList, EnumerationError> {
        let timeout = Duration::from_secs(self.config.timeout);
        let mut child = Command::new(&self.config.exec)
            .args(&self.config.params)
            .arg("--dataset")
            .arg(dataset)
            .arg("--split")
            .arg(split)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| EnumerationError::Spawn(self.config.exec.clone(), e))?;

        // drain both pipes while waiting, large datasets and progress output easily exceed the
        // pipe buffer
        let stdout = drain(child.stdout.take());
        let stderr = drain(child.stderr.take());

        let status = match wait_with_timeout(&mut child, timeout)? {
            Some(status) => status,
            None => return Err(EnumerationError::Timeout(timeout)),
        };

        let output = join(stdout)?;
        let stderr = String::from_utf8_lossy(&join(stderr)?).trim().to_string();

        if !status.success() {
            error!(%status, "Enumerator failed for {dataset}/{split}");

            return Err(EnumerationError::Failed {
                status: status.to_string(),
                stderr,
            });
        }
        if !stderr.is_empty() {
            debug!(stderr = %stderr, "Enumerator wrote to stderr");
        }

        let mut list = InstanceList::parse(&output)?;
        debug!("Enumerator returned {} instances", list.len());

        if let Some(allow_list) = &self.config.allow_list {
            let allowed: HashSet<WorkItem> = serde_json::from_slice(&fs::read(allow_list)?)?;
            list = list.retain_allowed(&allowed);
            info!("Filtered to {} allowed instances", list.len());
        }

        if list.is_empty() {
            return Err(EnumerationError::Empty {
                dataset: dataset.to_string(),
                split: split.to_string(),
            });
        }

        info!("Found {} instances", list.len());

        Ok(list)
    }
}

/// read `pipe` to its end on a separate thread
fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> JoinHandle<io::Result<Vec<u8>>> {
    thread::spawn(move || {
        let mut buffer = Vec::new();
        if let Some(mut pipe) = pipe {
            pipe.read_to_end(&mut buffer)?;
        }

        Ok(buffer)
    })
}

fn join(reader: JoinHandle<io::Result<Vec<u8>>>) -> io::Result<Vec<u8>> {
    reader
        .join()
        .map_err(|_| io::Error::new(io::ErrorKind::Other, "pipe reader panicked"))?
}

/// Enumerate the dataset and publish the list at `path` unless a list is already there.
/// Must only be called by the setup leader. If somebody else published first their list wins.
#[instrument(skip(source), level = "info")]
pub fn publish_instance_list<S: InstanceSource + ?Sized>(
    source: &S,
    path: &Path,
    dataset: &str,
    split: &str,
) -> Result<InstanceList, EnumerationError> {
    if path.exists() {
        info!("Instance list already exists, reusing it");

        return InstanceList::load(path);
    }

    let list = source.enumerate(dataset, split)?;

    match publish_exclusive(path, &list.to_bytes()?)? {
        Publication::Published => {
            info!("Published instance list with {} instances", list.len());

            Ok(list)
        }
        Publication::AlreadyPresent => {
            warn!("Instance list appeared while enumerating, using the published one");

            InstanceList::load(path)
        }
    }
}
