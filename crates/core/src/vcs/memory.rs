//! In-memory VCS driver.
//!
//! Holds the "working tree" in a map and lets callers inject failures, so
//! runs can be exercised without a repository on disk.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock};

use super::{MergeOutcome, VcsDriver};
use crate::errors::VcsError;

/// Working tree kept in memory.
#[derive(Debug)]
pub struct MemoryVcs {
    branch: String,
    files: RwLock<BTreeMap<PathBuf, Vec<u8>>>,
    conflicted: RwLock<Vec<PathBuf>>,
    merge_result: RwLock<Result<MergeOutcome, String>>,
    unreadable: HashSet<PathBuf>,
    /// Remaining successful writes per path before writes start failing.
    write_budget: RwLock<HashMap<PathBuf, usize>>,
    writes: RwLock<HashMap<PathBuf, usize>>,
    merges: RwLock<usize>,
}

impl MemoryVcs {
    /// Create an empty tree on `branch`. Merges report `UpToDate` until told
    /// otherwise.
    pub fn new(branch: impl Into<String>) -> Self {
        Self {
            branch: branch.into(),
            files: RwLock::new(BTreeMap::new()),
            conflicted: RwLock::new(Vec::new()),
            merge_result: RwLock::new(Ok(MergeOutcome::UpToDate)),
            unreadable: HashSet::new(),
            write_budget: RwLock::new(HashMap::new()),
            writes: RwLock::new(HashMap::new()),
            merges: RwLock::new(0),
        }
    }

    /// Add a clean file.
    pub fn with_file(self, path: impl Into<PathBuf>, content: impl Into<String>) -> Self {
        self.files
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(path.into(), content.into().into_bytes());
        self
    }

    /// Add a file and list it as conflicted.
    pub fn with_conflicted_file(self, path: impl Into<PathBuf>, content: impl Into<String>) -> Self {
        let path = path.into();
        self.conflicted
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(path.clone());
        self.with_file(path, content)
    }

    /// List `path` as conflicted but fail every read of it.
    pub fn with_unreadable_file(mut self, path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        self.conflicted
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(path.clone());
        self.unreadable.insert(path);
        self
    }

    /// Outcome reported by the next merges.
    pub fn with_merge_outcome(self, outcome: MergeOutcome) -> Self {
        *self.merge_result.write().unwrap_or_else(PoisonError::into_inner) = Ok(outcome);
        self
    }

    /// Make every merge fail with `message`.
    pub fn fail_merge(self, message: impl Into<String>) -> Self {
        *self.merge_result.write().unwrap_or_else(PoisonError::into_inner) = Err(message.into());
        self
    }

    /// Allow `successes` more writes to `path`, then fail.
    pub fn fail_writes_after(self, path: impl Into<PathBuf>, successes: usize) -> Self {
        self.write_budget
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(path.into(), successes);
        self
    }

    /// Current content of `path`, if present and valid UTF-8.
    pub fn file(&self, path: impl AsRef<Path>) -> Option<String> {
        self.files
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(path.as_ref())
            .and_then(|bytes| String::from_utf8(bytes.clone()).ok())
    }

    /// Number of successful writes to `path`.
    pub fn write_count(&self, path: impl AsRef<Path>) -> usize {
        self.writes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(path.as_ref())
            .copied()
            .unwrap_or(0)
    }

    /// Number of merges attempted.
    pub fn merge_count(&self) -> usize {
        *self.merges.read().unwrap_or_else(PoisonError::into_inner)
    }
}

impl VcsDriver for MemoryVcs {
    fn fetch_and_merge(&self, remote: &str, branch: &str) -> Result<MergeOutcome, VcsError> {
        *self.merges.write().unwrap_or_else(PoisonError::into_inner) += 1;
        match &*self.merge_result.read().unwrap_or_else(PoisonError::into_inner) {
            Ok(outcome) => Ok(*outcome),
            Err(message) => Err(VcsError::RefNotFound(format!(
                "{remote}/{branch}: {message}"
            ))),
        }
    }

    fn list_conflicted_files(&self) -> Result<Vec<PathBuf>, VcsError> {
        Ok(self
            .conflicted
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone())
    }

    fn current_branch(&self) -> Result<String, VcsError> {
        Ok(self.branch.clone())
    }

    fn read_file(&self, path: &Path) -> Result<Vec<u8>, VcsError> {
        if self.unreadable.contains(path) {
            return Err(VcsError::FileRead {
                path: path.to_path_buf(),
                source: io::Error::new(io::ErrorKind::PermissionDenied, "unreadable"),
            });
        }
        self.files
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(path)
            .cloned()
            .ok_or_else(|| VcsError::FileRead {
                path: path.to_path_buf(),
                source: io::Error::new(io::ErrorKind::NotFound, "no such file"),
            })
    }

    fn write_file(&self, path: &Path, content: &[u8]) -> Result<(), VcsError> {
        {
            let mut budget = self.write_budget.write().unwrap_or_else(PoisonError::into_inner);
            if let Some(remaining) = budget.get_mut(path) {
                if *remaining == 0 {
                    return Err(VcsError::FileWrite {
                        path: path.to_path_buf(),
                        source: io::Error::new(io::ErrorKind::PermissionDenied, "read-only"),
                    });
                }
                *remaining -= 1;
            }
        }
        self.files
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(path.to_path_buf(), content.to_vec());
        *self
            .writes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(path.to_path_buf())
            .or_insert(0) += 1;
        Ok(())
    }
}
