//! Version-control seam: merging, conflict listing and working-tree file access.

pub mod git;
#[cfg(any(test, feature = "testing"))]
pub mod memory;

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::errors::VcsError;

pub use git::GitDriver;
#[cfg(any(test, feature = "testing"))]
pub use memory::MemoryVcs;

/// What a fetch-and-merge did to the working tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeOutcome {
    /// Nothing to merge.
    UpToDate,
    /// HEAD was moved forward; no merge commit needed.
    FastForward,
    /// Merged without conflicts; changes are staged but not committed.
    Clean,
    /// Merged with conflicts left in the working tree.
    Conflicted,
}

impl std::fmt::Display for MergeOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UpToDate => write!(f, "up_to_date"),
            Self::FastForward => write!(f, "fast_forward"),
            Self::Clean => write!(f, "clean"),
            Self::Conflicted => write!(f, "conflicted"),
        }
    }
}

/// Operations the resolver needs from a version-control system.
///
/// Implementations must be safe to share across threads; file operations for
/// distinct paths may run concurrently.
pub trait VcsDriver: Send + Sync {
    /// Fetch `branch` from `remote` and merge it into the current branch,
    /// leaving conflict markers in the working tree where needed.
    fn fetch_and_merge(&self, remote: &str, branch: &str) -> Result<MergeOutcome, VcsError>;

    /// Paths of files with unresolved conflicts, relative paths resolved
    /// against the working tree.
    fn list_conflicted_files(&self) -> Result<Vec<PathBuf>, VcsError>;

    /// Short name of the branch currently checked out.
    fn current_branch(&self) -> Result<String, VcsError>;

    /// Read a working-tree file.
    fn read_file(&self, path: &Path) -> Result<Vec<u8>, VcsError>;

    /// Replace a working-tree file's content.
    fn write_file(&self, path: &Path, content: &[u8]) -> Result<(), VcsError>;
}
