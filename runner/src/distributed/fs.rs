use super::{
    util::{hostname, prefixed},
    JobId,
};
use once_cell::sync::Lazy;
use std::{
    ffi::OsString,
    fs::{self, File},
    io::{self, Write},
    ops::Deref,
    path::{Path, PathBuf},
    sync::atomic::{AtomicU64, Ordering},
};
use tracing::{debug, error};

pub const RESULT_PREFIX: &str = "output_task_";
pub const ERROR_PREFIX: &str = "error_task_";
pub const RECORD_SUFFIX: &str = ".jsonl";

/// Prefix for files that are still being written, they are never visible under their final name
pub static STAGING_PREFIX: Lazy<OsString> = Lazy::new(|| {
    let mut string = OsString::new();
    string.push(".staging_");
    string
});

static STAGING_COUNTER: AtomicU64 = AtomicU64::new(0);

/// All shared state of a single job, rooted at `{state_root}/job_{job_id}`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobLayout {
    root: PathBuf,
}

impl JobLayout {
    pub fn new(state_root: &Path, job: &JobId) -> Self {
        Self {
            root: state_root.join(format!("job_{job}")),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn ensure(&self) -> io::Result<()> {
        fs::create_dir_all(&self.root)
    }

    pub fn instance_list(&self) -> PathBuf {
        self.root.join("instances.json")
    }

    /// result artifact of a slot, existence of this file marks the slot as done
    pub fn result(&self, ordinal: u32) -> PathBuf {
        self.root
            .join(format!("{RESULT_PREFIX}{ordinal}{RECORD_SUFFIX}"))
    }

    pub fn error_record(&self, ordinal: u32) -> PathBuf {
        self.root.join(format!("{ERROR_PREFIX}{ordinal}{RECORD_SUFFIX}"))
    }

    pub fn aggregated(&self) -> PathBuf {
        self.root.join("output.jsonl")
    }

    pub fn aggregated_errors(&self) -> PathBuf {
        self.root.join("output_errors.jsonl")
    }

    /// aggregated results converted into the prediction format of the harness
    pub fn predictions(&self) -> PathBuf {
        self.root.join("output.swebench.jsonl")
    }

    pub fn eval_logs(&self) -> PathBuf {
        self.root.join("eval_logs")
    }

    pub fn report(&self) -> PathBuf {
        self.root.join("report.json")
    }

    pub fn metadata(&self) -> PathBuf {
        self.root.join("metadata.json")
    }
}

/// A file in the staging area next to its final destination, removed on drop unless published
#[derive(Debug)]
pub struct StagedFile {
    path: PathBuf,
}

impl StagedFile {
    /// Write `contents` to a staging file next to `target` and sync it to disk.
    /// The staging name contains host, pid and a counter so concurrent writers never share a file.
    pub fn write(target: &Path, contents: &[u8]) -> io::Result<Self> {
        let file_name = target
            .file_name()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "target has no file name"))?;

        let mut staged_name = prefixed(STAGING_PREFIX.as_os_str(), file_name);
        staged_name.push(".");
        staged_name.push(hostname());
        staged_name.push(format!(
            ".{}.{}",
            std::process::id(),
            STAGING_COUNTER.fetch_add(1, Ordering::Relaxed)
        ));

        let staged = Self {
            path: target.with_file_name(staged_name),
        };

        let mut file = File::create(&staged.path)?;
        file.write_all(contents)?;
        file.sync_all()?;

        Ok(staged)
    }
}

impl Deref for StagedFile {
    type Target = PathBuf;

    fn deref(&self) -> &Self::Target {
        &self.path
    }
}

impl Drop for StagedFile {
    fn drop(&mut self) {
        match fs::remove_file(&self.path) {
            Ok(()) => debug!(path = ?self.path, "Removed staging file"),
            Err(error) if error.kind() == io::ErrorKind::NotFound => {}
            Err(error) => error!(error = ?error, path = ?self.path, "Failed to cleanup staging file"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Publication {
    /// this call made the file visible
    Published,
    /// somebody else already published the file, nothing was changed
    AlreadyPresent,
}

/// Publish `contents` at `target` at most once.
///
/// The contents are fully written to a staging file first and then hard linked to `target`.
/// Linking fails if `target` exists, so readers either see nothing or the complete file and a
/// second writer can never replace the first one.
pub fn publish_exclusive(target: &Path, contents: &[u8]) -> io::Result<Publication> {
    let staged = StagedFile::write(target, contents)?;

    match fs::hard_link(&*staged, target) {
        Ok(()) => Ok(Publication::Published),
        Err(error) if error.kind() == io::ErrorKind::AlreadyExists => {
            Ok(Publication::AlreadyPresent)
        }
        Err(error) => Err(error),
    }
}

/// Publish `contents` at `target`, atomically replacing a previous version
pub fn publish_replace(target: &Path, contents: &[u8]) -> io::Result<()> {
    let staged = StagedFile::write(target, contents)?;

    fs::rename(&*staged, target)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distributed::util::parse_ordinal;

    fn layout() -> (tempfile::TempDir, JobLayout) {
        let dir = tempfile::tempdir().unwrap();
        let layout = JobLayout::new(dir.path(), &"812".parse().unwrap());
        layout.ensure().unwrap();

        (dir, layout)
    }

    #[test]
    fn layout_is_keyed_by_job() {
        let root = Path::new("/shared/state");
        let first = JobLayout::new(root, &"1".parse().unwrap());
        let second = JobLayout::new(root, &"2".parse().unwrap());

        assert_eq!(first.root(), Path::new("/shared/state/job_1"));
        assert_ne!(first.instance_list(), second.instance_list());
        assert_eq!(
            first.result(3),
            Path::new("/shared/state/job_1/output_task_3.jsonl")
        );
    }

    #[test]
    fn result_paths_are_unique_per_ordinal() {
        let layout = JobLayout::new(Path::new("/s"), &"9".parse().unwrap());
        let paths: std::collections::HashSet<_> = (0..1000).map(|o| layout.result(o)).collect();

        assert_eq!(paths.len(), 1000);
        for ordinal in [0, 1, 10, 999] {
            let path = layout.result(ordinal);
            assert_eq!(
                parse_ordinal(path.file_name().unwrap(), RESULT_PREFIX, RECORD_SUFFIX),
                Some(ordinal)
            );
            assert_ne!(path, layout.error_record(ordinal));
        }
    }

    #[test]
    fn exclusive_publish_happens_once() {
        let (_dir, layout) = layout();
        let target = layout.instance_list();

        assert_eq!(
            publish_exclusive(&target, b"[\"a\"]").unwrap(),
            Publication::Published
        );
        assert_eq!(
            publish_exclusive(&target, b"[\"b\"]").unwrap(),
            Publication::AlreadyPresent
        );
        assert_eq!(fs::read(&target).unwrap(), b"[\"a\"]");
    }

    #[test]
    fn racing_publishers_leave_a_single_file() {
        let (_dir, layout) = layout();
        let target = layout.instance_list();

        let outcomes: Vec<Publication> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..8)
                .map(|writer| {
                    let target = &target;
                    scope.spawn(move || {
                        publish_exclusive(target, format!("[\"{writer}\"]").as_bytes()).unwrap()
                    })
                })
                .collect();

            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        assert_eq!(
            outcomes
                .iter()
                .filter(|outcome| **outcome == Publication::Published)
                .count(),
            1
        );

        let published: Vec<String> =
            serde_json::from_slice(&fs::read(&target).unwrap()).unwrap();
        assert_eq!(published.len(), 1);
    }

    #[test]
    fn staging_files_are_removed() {
        let (_dir, layout) = layout();

        publish_exclusive(&layout.instance_list(), b"[]").unwrap();
        publish_replace(&layout.aggregated(), b"{}\n").unwrap();
        publish_replace(&layout.aggregated(), b"{\"a\":1}\n").unwrap();

        let leftovers: Vec<_> = fs::read_dir(layout.root())
            .unwrap()
            .filter_map(Result::ok)
            .filter(|entry| {
                entry
                    .file_name()
                    .to_string_lossy()
                    .starts_with(".staging_")
            })
            .collect();

        assert!(leftovers.is_empty());
        assert_eq!(fs::read(layout.aggregated()).unwrap(), b"{\"a\":1}\n");
    }
}
